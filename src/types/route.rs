//! Route types

use std::fmt;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{OptimizationMethod, ServiceStop};

/// Sort key used for routes without a service date
pub const UNDATED_SORT_KEY: &str = "9999-99-99";

/// Composite identity of a route: one technician on one calendar date.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteKey {
    pub technician_id: Option<Uuid>,
    pub service_date: Option<NaiveDate>,
}

impl RouteKey {
    pub fn new(technician_id: Option<Uuid>, service_date: Option<NaiveDate>) -> Self {
        Self { technician_id, service_date }
    }

    /// Grouping key, `technicianId|'none'` + `serviceDate|'none'`
    pub fn group_key(&self) -> String {
        let tech = self
            .technician_id
            .map(|t| t.to_string())
            .unwrap_or_else(|| "none".to_string());
        let date = self
            .service_date
            .map(|d| d.to_string())
            .unwrap_or_else(|| "none".to_string());
        format!("{}|{}", tech, date)
    }

    /// Date used for ordering groups; undated groups sort last.
    pub fn sort_date(&self) -> String {
        self.service_date
            .map(|d| d.format("%Y-%m-%d").to_string())
            .unwrap_or_else(|| UNDATED_SORT_KEY.to_string())
    }

    /// Both halves of the key are needed before a route can be stored.
    pub fn persistable(&self) -> Option<(Uuid, NaiveDate)> {
        match (self.technician_id, self.service_date) {
            (Some(t), Some(d)) => Some((t, d)),
            _ => None,
        }
    }
}

impl fmt::Display for RouteKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.technician_id {
            Some(t) => write!(f, "{}", t)?,
            None => write!(f, "unassigned")?,
        }
        match self.service_date {
            Some(d) => write!(f, "@{}", d),
            None => write!(f, "@undated"),
        }
    }
}

/// One technician's set of stops for one calendar date.
///
/// Recomputed on every reload; its durable counterpart is
/// [`super::RouteOptimizationRecord`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Route {
    /// Synthetic id for addressing the route within one projection
    pub id: u32,
    pub technician_id: Option<Uuid>,
    pub service_date: Option<NaiveDate>,
    pub technician_name: String,
    pub stops: Vec<ServiceStop>,
    pub total_distance_km: f64,
    pub total_minutes: u32,
    /// Display form of the distance, e.g. "12.4 km"
    pub total_distance: String,
    /// Display form of the duration, e.g. "2h 35min"
    pub total_time: String,
    pub all_geocoded: bool,
    pub can_optimize: bool,
    pub is_optimized: bool,
    #[serde(default)]
    pub optimization_method: Option<OptimizationMethod>,
    /// Accepted path as [lng, lat] pairs, empty until optimized
    #[serde(default)]
    pub geometry: Vec<[f64; 2]>,
}

impl Route {
    pub fn key(&self) -> RouteKey {
        RouteKey::new(self.technician_id, self.service_date)
    }

    pub fn geocoded_stops(&self) -> impl Iterator<Item = &ServiceStop> {
        self.stops.iter().filter(|s| s.has_real_coordinates)
    }

    pub fn geocoded_count(&self) -> usize {
        self.geocoded_stops().count()
    }

    pub fn stop_ids(&self) -> Vec<String> {
        self.stops.iter().map(|s| s.id.clone()).collect()
    }
}

//! Route optimization types

use std::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{Route, ServiceOrderRow};

/// How an accepted route order was produced
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OptimizationMethod {
    Manual,
    Mapbox,
    Osrm,
    Local,
}

impl OptimizationMethod {
    pub const fn as_str(self) -> &'static str {
        match self {
            OptimizationMethod::Manual => "manual",
            OptimizationMethod::Mapbox => "mapbox",
            OptimizationMethod::Osrm => "osrm",
            OptimizationMethod::Local => "local",
        }
    }
}

impl FromStr for OptimizationMethod {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "manual" => Ok(OptimizationMethod::Manual),
            "mapbox" => Ok(OptimizationMethod::Mapbox),
            "osrm" => Ok(OptimizationMethod::Osrm),
            "local" => Ok(OptimizationMethod::Local),
            other => anyhow::bail!("unknown optimization method '{}'", other),
        }
    }
}

/// A stop's position within a route's persisted order
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Waypoint {
    pub stop_id: String,
    pub ticket_id: Uuid,
    /// 1-based position
    pub position: u32,
    pub address: String,
}

/// Durable record of a route's accepted order and path.
///
/// Unique on `(technician_id, route_date)`; writes are upserts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteOptimizationRecord {
    pub technician_id: Uuid,
    pub route_date: NaiveDate,
    pub waypoints_order: Vec<Waypoint>,
    /// Parallel to `waypoints_order`
    pub ticket_ids: Vec<Uuid>,
    /// Path as [lng, lat] pairs, in provider order
    pub geometry: Vec<[f64; 2]>,
    pub distance_km: f64,
    pub duration_minutes: i32,
    pub optimization_method: OptimizationMethod,
    pub updated_at: DateTime<Utc>,
}

impl RouteOptimizationRecord {
    /// Snapshot the route's current stop order under the given key.
    pub fn from_route(
        technician_id: Uuid,
        route_date: NaiveDate,
        route: &Route,
        geometry: Vec<[f64; 2]>,
        distance_km: f64,
        duration_minutes: f64,
        method: OptimizationMethod,
    ) -> Self {
        let waypoints_order: Vec<Waypoint> = route
            .stops
            .iter()
            .enumerate()
            .map(|(i, stop)| Waypoint {
                stop_id: stop.id.clone(),
                ticket_id: stop.ticket_id,
                position: (i + 1) as u32,
                address: stop.address.clone(),
            })
            .collect();
        let ticket_ids = waypoints_order.iter().map(|w| w.ticket_id).collect();

        Self {
            technician_id,
            route_date,
            waypoints_order,
            ticket_ids,
            geometry,
            distance_km,
            duration_minutes: duration_minutes.round() as i32,
            optimization_method: method,
            updated_at: Utc::now(),
        }
    }
}

/// Uniform result contract of the routing gateway.
///
/// `geometry` is in raw provider order, `[lng, lat]`. Rendering code must
/// swap each pair back to `lat, lng`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoutingResult {
    pub geometry: Vec<[f64; 2]>,
    pub distance_km: f64,
    pub duration_minutes: f64,
    pub provider: Option<OptimizationMethod>,
}

// ==========================================================================
// Request / response payloads
// ==========================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoadRoutesRequest {
    pub orders: Vec<ServiceOrderRow>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OptimizeRouteRequest {
    pub route_id: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OptimizeRouteResponse {
    pub route: Route,
    pub result: RoutingResult,
    pub persisted: bool,
    /// Set when the optimized route could not be saved
    #[serde(default)]
    pub warning: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OptimizeAllRequest {
    pub date: NaiveDate,
}

/// One route that did not make it through a batch
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchRouteFailure {
    pub route_id: u32,
    pub technician_name: String,
    pub error: String,
}

/// Outcome of "optimize all routes for a date"
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchOptimizeReport {
    pub date: NaiveDate,
    pub attempted: u32,
    pub optimized: u32,
    pub failures: Vec<BatchRouteFailure>,
    /// Route ids that were optimized but could not be saved
    pub not_persisted: Vec<u32>,
}

impl BatchOptimizeReport {
    pub fn summary(&self) -> String {
        format!("{} of {} routes optimized", self.optimized, self.attempted)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReorderRouteRequest {
    pub route_id: u32,
    pub stop_ids: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReorderRouteResponse {
    pub route: Route,
    pub persisted: bool,
    #[serde(default)]
    pub warning: Option<String>,
}

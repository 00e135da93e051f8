//! Background job types (geocoding batches, optimize-all progress)

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ==========================================================================
// Geocoding
// ==========================================================================

/// Request to geocode the stops of a route that lack real coordinates
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GeocodeRouteRequest {
    pub route_id: u32,
}

/// One address to resolve
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GeocodeItem {
    pub stop_id: String,
    pub service_order_id: Uuid,
    pub address: String,
}

/// Aggregate progress of a geocoding batch.
///
/// `completed_count` only counts resolved addresses and never decreases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GeocodeProgress {
    pub in_progress: bool,
    pub completed_count: u32,
    pub failed_count: u32,
    pub total_count: u32,
}

impl GeocodeProgress {
    pub fn started(total_count: u32) -> Self {
        Self {
            in_progress: total_count > 0,
            completed_count: 0,
            failed_count: 0,
            total_count,
        }
    }

    pub fn processed(&self) -> u32 {
        self.completed_count + self.failed_count
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GeocodeJobSubmitResponse {
    pub job_id: Uuid,
    pub total_count: u32,
}

/// Status update for a geocoding job (published via pub/sub)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GeocodeJobStatusUpdate {
    pub job_id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub progress: GeocodeProgress,
}

impl GeocodeJobStatusUpdate {
    pub fn new(job_id: Uuid, progress: GeocodeProgress) -> Self {
        Self {
            job_id,
            timestamp: Utc::now(),
            progress,
        }
    }
}

// ==========================================================================
// Optimize all
// ==========================================================================

/// Progress of an optimize-all batch, emitted after each route finishes
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchOptimizeProgress {
    pub date: NaiveDate,
    pub processed: u32,
    pub total: u32,
    pub optimized: u32,
    pub last_route_id: Option<u32>,
}

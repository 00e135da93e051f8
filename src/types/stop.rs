//! Service stop types

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Coordinates
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Coordinates {
    pub lat: f64,
    pub lng: f64,
}

impl Coordinates {
    pub const fn new(lat: f64, lng: f64) -> Self {
        Self { lat, lng }
    }
}

/// Ticket priority
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Critical,
    High,
    Medium,
    Low,
}

impl Priority {
    pub const fn as_str(self) -> &'static str {
        match self {
            Priority::Critical => "critical",
            Priority::High => "high",
            Priority::Medium => "medium",
            Priority::Low => "low",
        }
    }

    /// Lower rank is served first when the ordering pass needs a tie-break.
    pub const fn rank(self) -> u8 {
        match self {
            Priority::Critical => 0,
            Priority::High => 1,
            Priority::Medium => 2,
            Priority::Low => 3,
        }
    }
}

impl Default for Priority {
    fn default() -> Self {
        Priority::Medium
    }
}

/// Raw service-order record as delivered by the upstream backend.
///
/// One row carries exactly one ticket and at most one technician assignment.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceOrderRow {
    pub id: Uuid,
    pub ticket_id: Uuid,
    pub client_name: String,
    #[serde(default)]
    pub address: String,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default = "default_status")]
    pub status: String,
    #[serde(default)]
    pub service_type: Option<String>,
    #[serde(default)]
    pub technician_id: Option<Uuid>,
    #[serde(default)]
    pub technician_name: Option<String>,
    #[serde(default)]
    pub scheduled_date: Option<NaiveDate>,
    /// Estimated service duration in hours
    #[serde(default)]
    pub estimated_hours: Option<f64>,
    #[serde(default)]
    pub latitude: Option<f64>,
    #[serde(default)]
    pub longitude: Option<f64>,
}

fn default_status() -> String {
    "open".to_string()
}

/// One service visit to schedule. Rebuilt from upstream rows on every reload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceStop {
    pub id: String,
    pub service_order_id: Uuid,
    pub ticket_id: Uuid,
    pub client_name: String,
    pub address: String,
    pub priority: Priority,
    pub status: String,
    pub service_type: String,
    pub technician_id: Option<Uuid>,
    pub scheduled_date: Option<NaiveDate>,
    /// Estimated service duration in hours
    pub estimated_hours: f64,
    pub coordinates: Coordinates,
    /// True only when the coordinates come from a geocoded address
    pub has_real_coordinates: bool,
    /// Position within the route (1-based), assigned after ordering
    pub visit_order: Option<u32>,
    pub priority_color: String,
    pub status_color: String,
}

impl ServiceStop {
    /// Stop identity derived from the originating service order.
    pub fn stop_id_for(service_order_id: Uuid) -> String {
        format!("stop-{}", service_order_id)
    }

    pub fn service_minutes(&self) -> f64 {
        self.estimated_hours.max(0.0) * 60.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_priority_deserializes_lowercase() {
        let p: Priority = serde_json::from_str("\"critical\"").unwrap();
        assert_eq!(p, Priority::Critical);
        assert_eq!(p.as_str(), "critical");
    }

    #[test]
    fn test_priority_rank_orders_critical_first() {
        assert!(Priority::Critical.rank() < Priority::High.rank());
        assert!(Priority::High.rank() < Priority::Medium.rank());
        assert!(Priority::Medium.rank() < Priority::Low.rank());
    }

    #[test]
    fn test_service_order_row_defaults() {
        let json = r#"{
            "id": "00000000-0000-0000-0000-000000000001",
            "ticketId": "00000000-0000-0000-0000-000000000002",
            "clientName": "ACME"
        }"#;
        let row: ServiceOrderRow = serde_json::from_str(json).unwrap();
        assert_eq!(row.status, "open");
        assert_eq!(row.priority, Priority::Medium);
        assert!(row.technician_id.is_none());
        assert!(row.latitude.is_none());
    }

    #[test]
    fn test_stop_id_is_derived_from_order() {
        let id = Uuid::nil();
        assert_eq!(
            ServiceStop::stop_id_for(id),
            "stop-00000000-0000-0000-0000-000000000000"
        );
    }
}

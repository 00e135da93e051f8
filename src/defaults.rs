use crate::types::Coordinates;

/// Assumed travel speed for local estimates
pub const ASSUMED_SPEED_KMH: f64 = 30.0;

/// Fixed overhead (parking, walking in) per leg between consecutive stops
pub const STOP_OVERHEAD_MINUTES: f64 = 15.0;

/// Service duration used when an order carries no estimate
pub const DEFAULT_SERVICE_HOURS: f64 = 1.0;

/// Per-attempt timeout for external routing providers
pub const DEFAULT_ROUTING_TIMEOUT_SECS: u64 = 15;

/// Coordinate given to stops that have not been geocoded
pub const DEFAULT_FALLBACK_ORIGIN: Coordinates = Coordinates::new(50.0755, 14.4378);

/// Technician label for routes without an assignment
pub const UNASSIGNED_TECHNICIAN_NAME: &str = "Unassigned";

/// Label of the catch-all route synthesized when nothing can be grouped
pub const PENDING_ORDERS_NAME: &str = "Pending Orders";

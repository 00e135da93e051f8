//! Geographic calculations and display helpers

use crate::types::{Coordinates, Priority};

/// Earth radius in kilometers
const EARTH_RADIUS_KM: f64 = 6371.0;

/// Calculate Haversine distance between two points in kilometers
pub fn haversine_distance(from: &Coordinates, to: &Coordinates) -> f64 {
    let d_lat = (to.lat - from.lat).to_radians();
    let d_lon = (to.lng - from.lng).to_radians();

    let lat1 = from.lat.to_radians();
    let lat2 = to.lat.to_radians();

    let a = (d_lat / 2.0).sin().powi(2)
        + lat1.cos() * lat2.cos() * (d_lon / 2.0).sin().powi(2);

    // Rounding can push `a` marginally above 1 for antipodal points
    let c = 2.0 * a.min(1.0).sqrt().asin();

    EARTH_RADIUS_KM * c
}

/// Travel time in minutes for a distance at a constant speed
pub fn travel_time_minutes(distance_km: f64, speed_kmh: f64) -> f64 {
    if speed_kmh <= 0.0 {
        return 0.0;
    }
    distance_km / speed_kmh * 60.0
}

/// Wrap a longitude into [-180, 180]. In-range values are returned as is.
pub fn normalize_longitude(lng: f64) -> f64 {
    if (-180.0..=180.0).contains(&lng) {
        return lng;
    }
    let wrapped = (lng + 180.0).rem_euclid(360.0) - 180.0;
    if wrapped == -180.0 && lng > 0.0 {
        180.0
    } else {
        wrapped
    }
}

/// Validate raw coordinates coming from upstream data.
///
/// Returns `None` when either half is missing, not finite, the latitude is
/// out of range, or the point is (0, 0), which upstream uses as "not set".
pub fn validate_coordinates(lat: Option<f64>, lng: Option<f64>) -> Option<Coordinates> {
    let (lat, lng) = (lat?, lng?);
    if !lat.is_finite() || !lng.is_finite() {
        return None;
    }
    if !(-90.0..=90.0).contains(&lat) {
        return None;
    }
    if lat == 0.0 && lng == 0.0 {
        return None;
    }
    Some(Coordinates {
        lat,
        lng: normalize_longitude(lng),
    })
}

// ==========================================================================
// Coordinate order conversions
// ==========================================================================

/// Convert to storage/provider order, `[lng, lat]`
pub fn to_storage(point: &Coordinates) -> [f64; 2] {
    [point.lng, point.lat]
}

/// Convert a `[lng, lat]` pair back to coordinates for rendering
#[cfg(test)]
pub fn to_display(pair: [f64; 2]) -> Coordinates {
    Coordinates {
        lat: pair[1],
        lng: pair[0],
    }
}

/// Straight-line geometry through the given points, in `[lng, lat]` order
pub fn straight_line_geometry(points: &[Coordinates]) -> Vec<[f64; 2]> {
    points.iter().map(to_storage).collect()
}

// ==========================================================================
// Display helpers
// ==========================================================================

pub fn priority_color(priority: Priority) -> &'static str {
    match priority {
        Priority::Critical => "#dc2626",
        Priority::High => "#ea580c",
        Priority::Medium => "#d97706",
        Priority::Low => "#16a34a",
    }
}

pub fn status_color(status: &str) -> &'static str {
    match status.to_ascii_lowercase().as_str() {
        "open" | "pending" => "#2563eb",
        "assigned" | "scheduled" => "#7c3aed",
        "in_progress" | "in-progress" => "#d97706",
        "on_hold" | "waiting" => "#6b7280",
        "completed" | "closed" => "#16a34a",
        "cancelled" | "canceled" => "#9ca3af",
        _ => "#64748b",
    }
}

/// Statuses that take a stop out of planning
pub fn is_closed_status(status: &str) -> bool {
    matches!(
        status.to_ascii_lowercase().as_str(),
        "completed" | "closed" | "cancelled" | "canceled"
    )
}

/// "X.X km"
pub fn format_distance(km: f64) -> String {
    format!("{:.1} km", km.max(0.0))
}

/// "Hh Mmin"
pub fn format_duration(minutes: f64) -> String {
    let total = minutes.max(0.0).round() as u64;
    format!("{}h {}min", total / 60, total % 60)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn prague() -> Coordinates {
        Coordinates { lat: 50.0755, lng: 14.4378 }
    }

    fn brno() -> Coordinates {
        Coordinates { lat: 49.1951, lng: 16.6068 }
    }

    #[test]
    fn test_haversine_prague_brno() {
        let distance = haversine_distance(&prague(), &brno());

        // Prague to Brno is approximately 185 km
        assert!((distance - 185.0).abs() < 5.0);
    }

    #[test]
    fn test_haversine_same_point() {
        let point = Coordinates { lat: 50.0, lng: 14.0 };
        assert_eq!(haversine_distance(&point, &point), 0.0);
    }

    #[test]
    fn test_travel_time_at_30_kmh() {
        assert!((travel_time_minutes(15.0, 30.0) - 30.0).abs() < 1e-9);
        assert_eq!(travel_time_minutes(15.0, 0.0), 0.0);
    }

    #[test]
    fn test_validate_rejects_missing_and_null_island() {
        assert!(validate_coordinates(None, Some(14.0)).is_none());
        assert!(validate_coordinates(Some(50.0), None).is_none());
        assert!(validate_coordinates(Some(0.0), Some(0.0)).is_none());
        assert!(validate_coordinates(Some(91.0), Some(14.0)).is_none());
        assert!(validate_coordinates(Some(f64::NAN), Some(14.0)).is_none());
    }

    #[test]
    fn test_validate_normalizes_longitude() {
        let c = validate_coordinates(Some(10.0), Some(190.0)).unwrap();
        assert!((c.lng - (-170.0)).abs() < 1e-9);
        assert_eq!(normalize_longitude(180.0), 180.0);
        assert_eq!(normalize_longitude(-180.0), -180.0);
        assert_eq!(normalize_longitude(14.2), 14.2);
        assert_eq!(normalize_longitude(-190.0), 170.0);
    }

    #[test]
    fn test_storage_order_is_lng_lat() {
        let p = prague();
        let stored = to_storage(&p);
        assert_eq!(stored, [14.4378, 50.0755]);
        assert_eq!(to_display(stored), p);
    }

    #[test]
    fn test_format_helpers() {
        assert_eq!(format_distance(0.0), "0.0 km");
        assert_eq!(format_distance(12.345), "12.3 km");
        assert_eq!(format_duration(0.0), "0h 0min");
        assert_eq!(format_duration(155.0), "2h 35min");
    }

    #[test]
    fn test_colors() {
        assert_eq!(priority_color(Priority::Critical), "#dc2626");
        assert_eq!(status_color("OPEN"), "#2563eb");
        assert_eq!(status_color("something-else"), "#64748b");
        assert!(is_closed_status("Cancelled"));
        assert!(!is_closed_status("open"));
    }

    fn coords() -> impl Strategy<Value = Coordinates> {
        (-89.9f64..89.9, -179.9f64..179.9).prop_map(|(lat, lng)| Coordinates { lat, lng })
    }

    proptest! {
        #[test]
        fn prop_haversine_is_symmetric(a in coords(), b in coords()) {
            let ab = haversine_distance(&a, &b);
            let ba = haversine_distance(&b, &a);
            prop_assert!((ab - ba).abs() < 1e-9);
        }

        #[test]
        fn prop_haversine_identity_is_zero(a in coords()) {
            prop_assert_eq!(haversine_distance(&a, &a), 0.0);
        }

        #[test]
        fn prop_validation_keeps_in_range_coordinates(
            lat in -90.0f64..=90.0,
            lng in -180.0f64..=180.0,
        ) {
            prop_assume!(lat != 0.0 || lng != 0.0);
            prop_assert_eq!(validate_coordinates(Some(lat), Some(lng)), Some(Coordinates { lat, lng }));
        }

        #[test]
        fn prop_display_storage_round_trip(a in coords()) {
            prop_assert_eq!(to_display(to_storage(&a)), a);
        }
    }
}

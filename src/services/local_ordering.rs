//! Local ordering heuristic
//!
//! Two passes, both network-free:
//! - `order_stops` picks a visiting order (nearest neighbour from the depot,
//!   priority then stop id as tie-breaks).
//! - `estimate_cost` walks the stops in their current order and produces a
//!   conservative distance/time estimate. It never reorders.

use crate::defaults::{ASSUMED_SPEED_KMH, STOP_OVERHEAD_MINUTES};
use crate::services::geo::{self, haversine_distance};
use crate::types::{Coordinates, ServiceStop};

/// Distances closer than this are treated as equal when ordering
const DISTANCE_TIE_EPSILON_KM: f64 = 1e-9;

#[derive(Debug, Clone, Copy)]
pub struct CostParams {
    pub speed_kmh: f64,
    pub stop_overhead_minutes: f64,
}

impl Default for CostParams {
    fn default() -> Self {
        Self {
            speed_kmh: ASSUMED_SPEED_KMH,
            stop_overhead_minutes: STOP_OVERHEAD_MINUTES,
        }
    }
}

/// Numeric cost estimate of a route
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct RouteCost {
    pub distance_km: f64,
    pub travel_minutes: f64,
    pub overhead_minutes: f64,
    pub service_minutes: f64,
}

impl RouteCost {
    pub fn zero() -> Self {
        Self::default()
    }

    pub fn total_minutes(&self) -> f64 {
        self.travel_minutes + self.overhead_minutes + self.service_minutes
    }

    pub fn distance_label(&self) -> String {
        geo::format_distance(self.distance_km)
    }

    pub fn time_label(&self) -> String {
        geo::format_duration(self.total_minutes())
    }
}

/// Estimate cost with the default speed and overhead
pub fn estimate_cost(stops: &[ServiceStop]) -> RouteCost {
    estimate_cost_with(stops, CostParams::default())
}

/// Walk geocoded stops pairwise in their current order.
///
/// With fewer than two geocoded stops there is nothing to walk and the
/// estimate is zero.
pub fn estimate_cost_with(stops: &[ServiceStop], params: CostParams) -> RouteCost {
    let points: Vec<Coordinates> = stops
        .iter()
        .filter(|s| s.has_real_coordinates)
        .map(|s| s.coordinates)
        .collect();

    if points.len() < 2 {
        return RouteCost::zero();
    }

    let mut cost = RouteCost::zero();
    for pair in points.windows(2) {
        let leg_km = haversine_distance(&pair[0], &pair[1]);
        cost.distance_km += leg_km;
        cost.travel_minutes += geo::travel_time_minutes(leg_km, params.speed_kmh);
        cost.overhead_minutes += params.stop_overhead_minutes;
    }

    // Service time counts for every stop, geocoded or not
    cost.service_minutes = stops.iter().map(|s| s.service_minutes()).sum();

    cost
}

/// Order stops by nearest neighbour starting at `depot`.
///
/// Ties on distance go to the higher priority, then the smaller stop id.
/// Stops without real coordinates keep their relative order and are placed
/// after the geocoded ones. `visit_order` is reassigned (1-based).
pub fn order_stops(stops: Vec<ServiceStop>, depot: &Coordinates) -> Vec<ServiceStop> {
    let (mut pending, ungeocoded): (Vec<ServiceStop>, Vec<ServiceStop>) =
        stops.into_iter().partition(|s| s.has_real_coordinates);

    let mut ordered = Vec::with_capacity(pending.len() + ungeocoded.len());
    let mut current = *depot;

    while !pending.is_empty() {
        let mut best_idx = 0;
        let mut best_dist = haversine_distance(&current, &pending[0].coordinates);

        for (i, candidate) in pending.iter().enumerate().skip(1) {
            let dist = haversine_distance(&current, &candidate.coordinates);
            let better = if dist < best_dist - DISTANCE_TIE_EPSILON_KM {
                true
            } else if (dist - best_dist).abs() <= DISTANCE_TIE_EPSILON_KM {
                let best = &pending[best_idx];
                (candidate.priority.rank(), &candidate.id) < (best.priority.rank(), &best.id)
            } else {
                false
            };
            if better {
                best_idx = i;
                best_dist = dist;
            }
        }

        let next = pending.remove(best_idx);
        current = next.coordinates;
        ordered.push(next);
    }

    ordered.extend(ungeocoded);
    assign_visit_order(&mut ordered);
    ordered
}

/// Number stops 1..n in their current order
pub fn assign_visit_order(stops: &mut [ServiceStop]) {
    for (i, stop) in stops.iter_mut().enumerate() {
        stop.visit_order = Some((i + 1) as u32);
    }
}

//! Stop & route data builder
//!
//! Pure transform from upstream service-order rows to `Route[]`. Identical
//! input always yields identical grouping and stop order.

use std::collections::HashMap;

use crate::defaults::{
    DEFAULT_FALLBACK_ORIGIN, DEFAULT_SERVICE_HOURS, PENDING_ORDERS_NAME,
    UNASSIGNED_TECHNICIAN_NAME,
};
use crate::services::geo;
use crate::services::local_ordering::{estimate_cost, order_stops};
use crate::types::{Coordinates, Route, RouteKey, ServiceOrderRow, ServiceStop};

#[derive(Debug, Clone, Copy)]
pub struct BuilderOptions {
    /// Coordinate for stops without a geocoded address; also the depot of
    /// the ordering pass
    pub fallback_origin: Coordinates,
}

impl Default for BuilderOptions {
    fn default() -> Self {
        Self {
            fallback_origin: DEFAULT_FALLBACK_ORIGIN,
        }
    }
}

/// Map one upstream row to a stop
pub fn row_to_stop(row: &ServiceOrderRow, options: &BuilderOptions) -> ServiceStop {
    let real = geo::validate_coordinates(row.latitude, row.longitude);

    ServiceStop {
        id: ServiceStop::stop_id_for(row.id),
        service_order_id: row.id,
        ticket_id: row.ticket_id,
        client_name: row.client_name.clone(),
        address: row.address.clone(),
        priority: row.priority,
        status: row.status.clone(),
        service_type: row
            .service_type
            .clone()
            .unwrap_or_else(|| "service".to_string()),
        technician_id: row.technician_id,
        scheduled_date: row.scheduled_date,
        estimated_hours: row
            .estimated_hours
            .filter(|h| h.is_finite() && *h >= 0.0)
            .unwrap_or(DEFAULT_SERVICE_HOURS),
        coordinates: real.unwrap_or(options.fallback_origin),
        has_real_coordinates: real.is_some(),
        visit_order: None,
        priority_color: geo::priority_color(row.priority).to_string(),
        status_color: geo::status_color(&row.status).to_string(),
    }
}

/// Compute metrics and flags for a route whose stops are already in order
pub fn finalize_route(
    id: u32,
    key: RouteKey,
    technician_name: String,
    stops: Vec<ServiceStop>,
) -> Route {
    let cost = estimate_cost(&stops);
    let all_geocoded = !stops.is_empty() && stops.iter().all(|s| s.has_real_coordinates);
    let can_optimize = all_geocoded && stops.len() >= 2;

    let mut route = Route {
        id,
        technician_id: key.technician_id,
        service_date: key.service_date,
        technician_name,
        total_distance_km: 0.0,
        total_minutes: 0,
        total_distance: String::new(),
        total_time: String::new(),
        stops,
        all_geocoded,
        can_optimize,
        is_optimized: false,
        optimization_method: None,
        geometry: Vec::new(),
    };
    set_metrics(&mut route, cost.distance_km, cost.total_minutes());
    route
}

/// Overwrite a route's numeric metrics and their display labels
pub fn set_metrics(route: &mut Route, distance_km: f64, minutes: f64) {
    let minutes = minutes.max(0.0);
    route.total_distance_km = distance_km.max(0.0);
    route.total_minutes = minutes.round() as u32;
    route.total_distance = geo::format_distance(distance_km);
    route.total_time = geo::format_duration(minutes);
}

struct Group {
    key: RouteKey,
    technician_name: Option<String>,
    stops: Vec<ServiceStop>,
}

/// Build the route projection from upstream rows
pub fn build_routes(rows: &[ServiceOrderRow], options: &BuilderOptions) -> Vec<Route> {
    let mut groups: Vec<Group> = Vec::new();
    let mut index: HashMap<String, usize> = HashMap::new();
    let mut all_stops: Vec<ServiceStop> = Vec::new();

    for row in rows.iter().filter(|r| !geo::is_closed_status(&r.status)) {
        let stop = row_to_stop(row, options);
        let key = RouteKey::new(row.technician_id, row.scheduled_date);

        let slot = *index.entry(key.group_key()).or_insert_with(|| {
            groups.push(Group {
                key,
                technician_name: None,
                stops: Vec::new(),
            });
            groups.len() - 1
        });

        let group = &mut groups[slot];
        if group.technician_name.is_none() {
            group.technician_name = row
                .technician_name
                .as_ref()
                .filter(|n| !n.trim().is_empty())
                .cloned();
        }
        all_stops.push(stop.clone());
        group.stops.push(stop);
    }

    if groups.is_empty() {
        // Heterogeneous leftovers cannot be routed as one
        let mut route = finalize_route(
            1,
            RouteKey::new(None, None),
            PENDING_ORDERS_NAME.to_string(),
            all_stops,
        );
        route.can_optimize = false;
        return vec![route];
    }

    // Stable: equal dates keep first-encounter order
    groups.sort_by_key(|g| g.key.sort_date());

    groups
        .into_iter()
        .enumerate()
        .map(|(i, group)| {
            let stops = order_stops(group.stops, &options.fallback_origin);
            let name = group
                .technician_name
                .unwrap_or_else(|| UNASSIGNED_TECHNICIAN_NAME.to_string());
            finalize_route((i + 1) as u32, group.key, name, stops)
        })
        .collect()
}

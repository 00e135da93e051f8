//! Route optimization use cases
//!
//! Every entry point goes through the `OptimizationController` first, then
//! the routing gateway (or the local estimate for manual reorders), then
//! writes through to the route store.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::NaiveDate;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::services::concurrency::{GateError, OptimizationController};
use crate::services::route_builder::set_metrics;
use crate::services::route_store::{apply_order, recompute_locally, RouteStore};
use crate::services::routing::{FallbackPolicy, RoutingError, RoutingGateway};
use crate::types::{
    BatchOptimizeProgress, BatchOptimizeReport, BatchRouteFailure, OptimizationMethod,
    OptimizeRouteResponse, ReorderRouteResponse, Route, RouteOptimizationRecord,
};

#[derive(Debug, Clone, PartialEq, Error)]
pub enum OptimizeError {
    #[error("route has {found} geocoded stops, at least 2 are required")]
    NoGeocodedStops { found: usize },
    #[error("route {0} is already being optimized")]
    RouteBusy(u32),
    #[error("optimize all is running")]
    BatchRunning,
    #[error("route {0} not found")]
    RouteNotFound(u32),
    #[error("{0}")]
    ProvidersExhausted(String),
    #[error("invalid reorder: {0}")]
    InvalidReorder(String),
}

impl OptimizeError {
    /// Stable error code for response envelopes
    pub fn code(&self) -> &'static str {
        match self {
            OptimizeError::NoGeocodedStops { .. } => "NO_GEOCODED_STOPS",
            OptimizeError::RouteBusy(_) => "ROUTE_BUSY",
            OptimizeError::BatchRunning => "BATCH_RUNNING",
            OptimizeError::RouteNotFound(_) => "ROUTE_NOT_FOUND",
            OptimizeError::ProvidersExhausted(_) => "PROVIDERS_EXHAUSTED",
            OptimizeError::InvalidReorder(_) => "INVALID_REORDER",
        }
    }
}

impl From<GateError> for OptimizeError {
    fn from(err: GateError) -> Self {
        match err {
            GateError::RouteBusy(id) => OptimizeError::RouteBusy(id),
            GateError::BatchRunning => OptimizeError::BatchRunning,
        }
    }
}

impl From<RoutingError> for OptimizeError {
    fn from(err: RoutingError) -> Self {
        match err {
            RoutingError::NoGeocodedStops { found } => OptimizeError::NoGeocodedStops { found },
            exhausted @ RoutingError::ProvidersExhausted(_) => {
                OptimizeError::ProvidersExhausted(exhausted.to_string())
            }
        }
    }
}

const NOT_PERSISTABLE_WARNING: &str =
    "Route has no technician or service date; the new order is kept for this session only";

/// Outcome of writing a route through to the store
struct WriteOutcome {
    persisted: bool,
    warning: Option<String>,
}

pub struct RouteOptimizer {
    gateway: Arc<RoutingGateway>,
    store: Arc<dyn RouteStore>,
    controller: OptimizationController,
}

impl RouteOptimizer {
    pub fn new(
        gateway: Arc<RoutingGateway>,
        store: Arc<dyn RouteStore>,
        controller: OptimizationController,
    ) -> Self {
        Self {
            gateway,
            store,
            controller,
        }
    }

    /// Whether an optimize or reorder of `route` would be rejected now
    pub fn is_busy(&self, route: &Route) -> bool {
        self.controller.is_busy(route.key())
    }

    /// Optimize one route. Exhausting every provider degrades to the local
    /// estimate, so this only fails on a precondition or a busy route.
    pub async fn optimize(&self, route: &Route) -> Result<OptimizeRouteResponse, OptimizeError> {
        let _guard = self.controller.try_begin_route(route.id, route.key())?;
        self.optimize_claimed(route, FallbackPolicy::LocalEstimate).await
    }

    async fn optimize_claimed(
        &self,
        route: &Route,
        policy: FallbackPolicy,
    ) -> Result<OptimizeRouteResponse, OptimizeError> {
        let found = route.geocoded_count();
        if found < 2 {
            warn!("Route {} has {} geocoded stops, not optimizing", route.id, found);
            return Err(OptimizeError::NoGeocodedStops { found });
        }

        let result = self.gateway.route(route, policy).await?;
        let method = result.provider.unwrap_or(OptimizationMethod::Local);

        let mut optimized = route.clone();
        set_metrics(&mut optimized, result.distance_km, result.duration_minutes);
        optimized.geometry = result.geometry.clone();
        optimized.optimization_method = Some(method);

        let outcome = self.write_through(&optimized, method).await;
        optimized.is_optimized = outcome.persisted;

        info!(
            "Route {} optimized via {} ({}, {})",
            route.id,
            method.as_str(),
            optimized.total_distance,
            optimized.total_time
        );

        Ok(OptimizeRouteResponse {
            route: optimized,
            result,
            persisted: outcome.persisted,
            warning: outcome.warning,
        })
    }

    /// Optimize every eligible route of `date`, one after another.
    ///
    /// Eligible means `can_optimize && !is_optimized`. A route whose provider
    /// chain is exhausted is counted as failed; the batch always continues.
    pub async fn optimize_all(
        &self,
        routes: &[Route],
        date: NaiveDate,
        progress_tx: Option<&mpsc::UnboundedSender<BatchOptimizeProgress>>,
    ) -> Result<BatchOptimizeReport, OptimizeError> {
        let batch = self.controller.try_begin_batch()?;

        let eligible: Vec<&Route> = routes
            .iter()
            .filter(|r| r.can_optimize && !r.is_optimized && r.service_date == Some(date))
            .collect();

        info!("Optimizing {} routes for {}", eligible.len(), date);

        let mut report = BatchOptimizeReport {
            date,
            attempted: eligible.len() as u32,
            optimized: 0,
            failures: Vec::new(),
            not_persisted: Vec::new(),
        };

        for (i, route) in eligible.iter().enumerate() {
            let outcome = match self.controller.begin_route_in_batch(&batch, route.id, route.key()) {
                Ok(_guard) => self.optimize_claimed(route, FallbackPolicy::ProvidersOnly).await,
                Err(e) => Err(e.into()),
            };

            match outcome {
                Ok(response) => {
                    report.optimized += 1;
                    if !response.persisted {
                        report.not_persisted.push(route.id);
                    }
                }
                Err(e) => {
                    warn!("Route {} failed in optimize all: {}", route.id, e);
                    report.failures.push(BatchRouteFailure {
                        route_id: route.id,
                        technician_name: route.technician_name.clone(),
                        error: e.to_string(),
                    });
                }
            }

            if let Some(tx) = progress_tx {
                let _ = tx.send(BatchOptimizeProgress {
                    date,
                    processed: (i + 1) as u32,
                    total: report.attempted,
                    optimized: report.optimized,
                    last_route_id: Some(route.id),
                });
            }
        }

        info!("Optimize all for {}: {}", date, report.summary());
        Ok(report)
    }

    /// Apply an operator's order. No routing provider is involved; metrics
    /// and geometry are straight-line estimates.
    pub async fn reorder(
        &self,
        route: &Route,
        stop_ids: &[String],
    ) -> Result<ReorderRouteResponse, OptimizeError> {
        validate_permutation(route, stop_ids)?;
        let _guard = self.controller.try_begin_route(route.id, route.key())?;

        let mut reordered = route.clone();
        apply_order(&mut reordered, stop_ids);
        recompute_locally(&mut reordered);
        reordered.optimization_method = Some(OptimizationMethod::Manual);

        let outcome = self.write_through(&reordered, OptimizationMethod::Manual).await;
        reordered.is_optimized = outcome.persisted;

        Ok(ReorderRouteResponse {
            route: reordered,
            persisted: outcome.persisted,
            warning: outcome.warning,
        })
    }

    async fn write_through(&self, route: &Route, method: OptimizationMethod) -> WriteOutcome {
        let Some((technician_id, route_date)) = route.key().persistable() else {
            warn!("Route {} ({}) cannot be persisted", route.id, route.key());
            return WriteOutcome {
                persisted: false,
                warning: Some(NOT_PERSISTABLE_WARNING.to_string()),
            };
        };

        let record = RouteOptimizationRecord::from_route(
            technician_id,
            route_date,
            route,
            route.geometry.clone(),
            route.total_distance_km,
            route.total_minutes as f64,
            method,
        );

        match self.store.upsert(&record).await {
            Ok(()) => WriteOutcome {
                persisted: true,
                warning: None,
            },
            Err(e) => {
                warn!("Failed to persist route {}: {}", route.id, e);
                WriteOutcome {
                    persisted: false,
                    warning: Some(format!(
                        "Route was optimized but not saved ({}); a reload may lose it",
                        e
                    )),
                }
            }
        }
    }
}

/// `stop_ids` must name every stop of the route exactly once
fn validate_permutation(route: &Route, stop_ids: &[String]) -> Result<(), OptimizeError> {
    if stop_ids.len() != route.stops.len() {
        return Err(OptimizeError::InvalidReorder(format!(
            "expected {} stop ids, got {}",
            route.stops.len(),
            stop_ids.len()
        )));
    }

    let known: HashSet<&str> = route.stops.iter().map(|s| s.id.as_str()).collect();
    let mut seen = HashSet::new();
    for id in stop_ids {
        if !known.contains(id.as_str()) {
            return Err(OptimizeError::InvalidReorder(format!("unknown stop {}", id)));
        }
        if !seen.insert(id.as_str()) {
            return Err(OptimizeError::InvalidReorder(format!("duplicate stop {}", id)));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::geo;
    use crate::services::route_builder::{build_routes, BuilderOptions};
    use crate::services::route_store::testing::FailingRouteStore;
    use crate::services::route_store::InMemoryRouteStore;
    use crate::services::routing::testing::ScriptedProvider;
    use crate::services::routing::RoutingProvider;
    use crate::types::{Coordinates, Priority, ServiceOrderRow};
    use std::time::Duration;
    use uuid::Uuid;

    fn date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 3, 1).unwrap()
    }

    fn row(n: u128, tech: Option<u128>, coords: Option<(f64, f64)>) -> ServiceOrderRow {
        ServiceOrderRow {
            id: Uuid::from_u128(n),
            ticket_id: Uuid::from_u128(n + 1000),
            client_name: format!("Client {}", n),
            address: format!("Street {}", n),
            priority: Priority::Medium,
            status: "open".to_string(),
            service_type: None,
            technician_id: tech.map(Uuid::from_u128),
            technician_name: tech.map(|t| format!("Tech {}", t)),
            scheduled_date: Some(date()),
            estimated_hours: Some(1.0),
            latitude: coords.map(|c| c.0),
            longitude: coords.map(|c| c.1),
        }
    }

    fn providers(
        primary: Arc<ScriptedProvider>,
        secondary: Arc<ScriptedProvider>,
    ) -> Arc<RoutingGateway> {
        let chain: Vec<Arc<dyn RoutingProvider>> = vec![primary, secondary];
        Arc::new(RoutingGateway::new(chain, Duration::from_millis(200)))
    }

    fn mapbox_down_osrm_up() -> (Arc<ScriptedProvider>, Arc<ScriptedProvider>) {
        (
            Arc::new(ScriptedProvider::failing("mapbox", OptimizationMethod::Mapbox)),
            Arc::new(ScriptedProvider::succeeding("osrm", OptimizationMethod::Osrm)),
        )
    }

    #[tokio::test]
    async fn test_primary_down_secondary_up_persists_osrm() {
        let routes = build_routes(
            &[
                row(1, Some(7), Some((50.05, 14.40))),
                row(2, Some(7), Some((50.10, 14.50))),
            ],
            &BuilderOptions::default(),
        );
        let route = &routes[0];
        assert!(route.can_optimize);

        let (primary, secondary) = mapbox_down_osrm_up();
        let store = Arc::new(InMemoryRouteStore::new());
        let optimizer = RouteOptimizer::new(
            providers(primary, secondary),
            store.clone(),
            OptimizationController::new(),
        );

        let response = optimizer.optimize(route).await.unwrap();

        assert!(response.persisted);
        assert!(response.warning.is_none());
        assert!(response.route.is_optimized);
        assert_eq!(response.result.provider, Some(OptimizationMethod::Osrm));

        let record = store
            .load_latest(Uuid::from_u128(7), date())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.optimization_method, OptimizationMethod::Osrm);
        assert_eq!(record.distance_km, 12.5);
        assert_eq!(record.duration_minutes, 21);
        assert_eq!(record.waypoints_order.len(), 2);
        // Stored geometry stays in provider order
        assert_eq!(record.geometry[0], [14.40, 50.05]);
        assert_eq!(
            geo::to_display(record.geometry[0]),
            Coordinates { lat: 50.05, lng: 14.40 }
        );
    }

    #[tokio::test]
    async fn test_one_geocoded_stop_is_rejected_without_writes() {
        let routes = build_routes(
            &[row(1, Some(7), Some((50.05, 14.40))), row(2, Some(7), None)],
            &BuilderOptions::default(),
        );
        let route = &routes[0];
        assert!(!route.can_optimize);

        let (primary, secondary) = mapbox_down_osrm_up();
        let store = Arc::new(InMemoryRouteStore::new());
        let optimizer = RouteOptimizer::new(
            providers(primary.clone(), secondary),
            store.clone(),
            OptimizationController::new(),
        );

        let err = optimizer.optimize(route).await.unwrap_err();
        assert_eq!(err, OptimizeError::NoGeocodedStops { found: 1 });
        assert_eq!(err.code(), "NO_GEOCODED_STOPS");
        assert!(store.is_empty());
        assert_eq!(primary.call_count(), 0);
    }

    #[tokio::test]
    async fn test_all_providers_down_still_returns_local_route() {
        let routes = build_routes(
            &[
                row(1, Some(7), Some((50.05, 14.40))),
                row(2, Some(7), Some((50.10, 14.50))),
            ],
            &BuilderOptions::default(),
        );
        let gateway = providers(
            Arc::new(ScriptedProvider::failing("mapbox", OptimizationMethod::Mapbox)),
            Arc::new(ScriptedProvider::failing("osrm", OptimizationMethod::Osrm)),
        );
        let store = Arc::new(InMemoryRouteStore::new());
        let optimizer = RouteOptimizer::new(gateway, store.clone(), OptimizationController::new());

        let response = optimizer.optimize(&routes[0]).await.unwrap();
        assert_eq!(response.result.provider, Some(OptimizationMethod::Local));
        assert_eq!(response.route.optimization_method, Some(OptimizationMethod::Local));
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_store_failure_returns_result_with_warning() {
        let routes = build_routes(
            &[
                row(1, Some(7), Some((50.05, 14.40))),
                row(2, Some(7), Some((50.10, 14.50))),
            ],
            &BuilderOptions::default(),
        );
        let (primary, secondary) = mapbox_down_osrm_up();
        let store = Arc::new(FailingRouteStore::default());
        let optimizer = RouteOptimizer::new(
            providers(primary, secondary),
            store.clone(),
            OptimizationController::new(),
        );

        let response = optimizer.optimize(&routes[0]).await.unwrap();
        assert!(!response.persisted);
        assert!(!response.route.is_optimized);
        assert!(response.warning.unwrap().contains("not saved"));
        assert_eq!(response.route.total_distance_km, 12.5);
        assert_eq!(*store.attempts.lock(), 1);
    }

    #[tokio::test]
    async fn test_optimize_rejected_while_route_in_flight() {
        let routes = build_routes(
            &[
                row(1, Some(7), Some((50.05, 14.40))),
                row(2, Some(7), Some((50.10, 14.50))),
            ],
            &BuilderOptions::default(),
        );
        let (primary, secondary) = mapbox_down_osrm_up();
        let controller = OptimizationController::new();
        let optimizer = RouteOptimizer::new(
            providers(primary, secondary),
            Arc::new(InMemoryRouteStore::new()),
            controller.clone(),
        );

        let _held = controller.try_begin_route(routes[0].id, routes[0].key()).unwrap();
        assert!(optimizer.is_busy(&routes[0]));
        let err = optimizer.optimize(&routes[0]).await.unwrap_err();
        assert_eq!(err, OptimizeError::RouteBusy(routes[0].id));
        assert_eq!(err.code(), "ROUTE_BUSY");
    }

    #[tokio::test]
    async fn test_reorder_without_technician_is_not_persisted() {
        let routes = build_routes(
            &[
                row(1, None, Some((50.05, 14.40))),
                row(2, None, Some((50.10, 14.50))),
                row(3, None, Some((50.20, 14.60))),
            ],
            &BuilderOptions::default(),
        );
        let route = &routes[0];
        let mut new_order = route.stop_ids();
        new_order.reverse();

        let (primary, secondary) = mapbox_down_osrm_up();
        let store = Arc::new(InMemoryRouteStore::new());
        let optimizer = RouteOptimizer::new(
            providers(primary.clone(), secondary.clone()),
            store.clone(),
            OptimizationController::new(),
        );

        let response = optimizer.reorder(route, &new_order).await.unwrap();

        assert_eq!(response.route.stop_ids(), new_order);
        assert!(!response.persisted);
        assert_eq!(response.warning.as_deref(), Some(NOT_PERSISTABLE_WARNING));
        assert!(store.is_empty());
        // Manual reorders never reach a provider
        assert_eq!(primary.call_count() + secondary.call_count(), 0);
    }

    #[tokio::test]
    async fn test_reorder_with_key_upserts_manual_straight_lines() {
        let routes = build_routes(
            &[
                row(1, Some(7), Some((50.05, 14.40))),
                row(2, Some(7), Some((50.10, 14.50))),
                row(3, Some(7), Some((50.20, 14.60))),
            ],
            &BuilderOptions::default(),
        );
        let route = &routes[0];
        let mut new_order = route.stop_ids();
        new_order.swap(0, 2);

        let (primary, secondary) = mapbox_down_osrm_up();
        let store = Arc::new(InMemoryRouteStore::new());
        let optimizer =
            RouteOptimizer::new(providers(primary, secondary), store.clone(), OptimizationController::new());

        let response = optimizer.reorder(route, &new_order).await.unwrap();
        assert!(response.persisted);

        let record = store.load_latest(Uuid::from_u128(7), date()).await.unwrap().unwrap();
        assert_eq!(record.optimization_method, OptimizationMethod::Manual);
        let stored_order: Vec<String> = record.waypoints_order.iter().map(|w| w.stop_id.clone()).collect();
        assert_eq!(stored_order, new_order);
        // Geometry is the stop coordinates themselves, [lng, lat]
        let expected: Vec<[f64; 2]> = response
            .route
            .stops
            .iter()
            .map(|s| geo::to_storage(&s.coordinates))
            .collect();
        assert_eq!(record.geometry, expected);
    }

    #[tokio::test]
    async fn test_reorder_rejects_non_permutations() {
        let routes = build_routes(
            &[
                row(1, Some(7), Some((50.05, 14.40))),
                row(2, Some(7), Some((50.10, 14.50))),
            ],
            &BuilderOptions::default(),
        );
        let route = &routes[0];
        let (primary, secondary) = mapbox_down_osrm_up();
        let optimizer = RouteOptimizer::new(
            providers(primary, secondary),
            Arc::new(InMemoryRouteStore::new()),
            OptimizationController::new(),
        );

        let ids = route.stop_ids();
        let duplicate = vec![ids[0].clone(), ids[0].clone()];
        let unknown = vec![ids[0].clone(), "stop-x".to_string()];
        let short = vec![ids[0].clone()];

        for bad in [duplicate, unknown, short] {
            let err = optimizer.reorder(route, &bad).await.unwrap_err();
            assert_eq!(err.code(), "INVALID_REORDER");
        }
    }

    #[tokio::test]
    async fn test_optimize_all_counts_failed_route_and_continues() {
        // Three technicians, two geocoded stops each, same day
        let rows = vec![
            row(1, Some(1), Some((50.05, 14.40))),
            row(2, Some(1), Some((50.10, 14.50))),
            row(3, Some(2), Some((49.20, 16.60))),
            row(4, Some(2), Some((49.25, 16.65))),
            row(5, Some(3), Some((49.80, 18.20))),
            row(6, Some(3), Some((49.85, 18.25))),
        ];
        let routes = build_routes(&rows, &BuilderOptions::default());
        assert_eq!(routes.len(), 3);

        let (primary, secondary) = mapbox_down_osrm_up();
        // The second route's chain is fully exhausted
        let second: Vec<Coordinates> = routes[1].geocoded_stops().map(|s| s.coordinates).collect();
        secondary.refuse_waypoints(second);

        let store = Arc::new(InMemoryRouteStore::new());
        let optimizer = RouteOptimizer::new(
            providers(primary, secondary.clone()),
            store.clone(),
            OptimizationController::new(),
        );

        let (tx, mut rx) = mpsc::unbounded_channel();
        let report = optimizer.optimize_all(&routes, date(), Some(&tx)).await.unwrap();
        drop(tx);

        assert_eq!(report.summary(), "2 of 3 routes optimized");
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].route_id, routes[1].id);
        assert!(report.not_persisted.is_empty());

        // Strictly sequential: one provider call per route, in route order
        assert_eq!(secondary.call_count(), 3);

        assert_eq!(store.len(), 2);
        assert!(store
            .load_latest(Uuid::from_u128(2), date())
            .await
            .unwrap()
            .is_none());

        let mut processed = Vec::new();
        while let Some(p) = rx.recv().await {
            processed.push((p.processed, p.last_route_id));
        }
        assert_eq!(
            processed,
            vec![
                (1, Some(routes[0].id)),
                (2, Some(routes[1].id)),
                (3, Some(routes[2].id)),
            ]
        );
    }

    #[tokio::test]
    async fn test_optimize_all_skips_ineligible_routes() {
        let other_day = NaiveDate::from_ymd_opt(2024, 3, 2).unwrap();
        let mut rows = vec![
            row(1, Some(1), Some((50.05, 14.40))),
            row(2, Some(1), Some((50.10, 14.50))),
            row(3, Some(2), Some((49.20, 16.60))),
            row(4, Some(2), None),
            row(5, Some(3), Some((49.80, 18.20))),
            row(6, Some(3), Some((49.85, 18.25))),
        ];
        rows[4].scheduled_date = Some(other_day);
        rows[5].scheduled_date = Some(other_day);

        let mut routes = build_routes(&rows, &BuilderOptions::default());
        routes[0].is_optimized = true;

        let (primary, secondary) = mapbox_down_osrm_up();
        let optimizer = RouteOptimizer::new(
            providers(primary, secondary.clone()),
            Arc::new(InMemoryRouteStore::new()),
            OptimizationController::new(),
        );

        let report = optimizer.optimize_all(&routes, date(), None).await.unwrap();
        assert_eq!(report.attempted, 0);
        assert_eq!(report.summary(), "0 of 0 routes optimized");
        assert_eq!(secondary.call_count(), 0);
    }

    #[tokio::test]
    async fn test_single_optimize_blocked_during_batch() {
        let routes = build_routes(
            &[
                row(1, Some(7), Some((50.05, 14.40))),
                row(2, Some(7), Some((50.10, 14.50))),
            ],
            &BuilderOptions::default(),
        );
        let (primary, secondary) = mapbox_down_osrm_up();
        let controller = OptimizationController::new();
        let optimizer = RouteOptimizer::new(
            providers(primary, secondary),
            Arc::new(InMemoryRouteStore::new()),
            controller.clone(),
        );

        let _batch = controller.try_begin_batch().unwrap();
        assert_eq!(
            optimizer.optimize(&routes[0]).await.unwrap_err(),
            OptimizeError::BatchRunning
        );
        assert_eq!(
            optimizer.optimize_all(&routes, date(), None).await.unwrap_err(),
            OptimizeError::BatchRunning
        );
    }
}

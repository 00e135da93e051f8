//! Persistence & reconciliation of accepted route orders
//!
//! One record per (technician, date). Writes are upserts on that pair, so
//! repeating a write replaces the previous order, geometry and method.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use chrono::NaiveDate;
use parking_lot::Mutex;
use sqlx::PgPool;
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::db::queries::route_optimization;
use crate::services::geo;
use crate::services::local_ordering::{assign_visit_order, estimate_cost};
use crate::services::route_builder::set_metrics;
use crate::types::{Route, RouteOptimizationRecord};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("route store unavailable: {0}")]
    Unavailable(#[source] anyhow::Error),
    #[error("route store rejected the record: {0}")]
    Rejected(String),
}

impl From<anyhow::Error> for StoreError {
    fn from(err: anyhow::Error) -> Self {
        StoreError::Unavailable(err)
    }
}

/// Durable storage of accepted route orders
#[async_trait]
pub trait RouteStore: Send + Sync {
    /// Insert or replace the record for its (technician, date) key
    async fn upsert(&self, record: &RouteOptimizationRecord) -> Result<(), StoreError>;

    /// Most recent record for the key
    async fn load_latest(
        &self,
        technician_id: Uuid,
        route_date: NaiveDate,
    ) -> Result<Option<RouteOptimizationRecord>, StoreError>;

    /// Records for several keys at once. Missing keys are simply absent.
    async fn load_many(
        &self,
        keys: &[(Uuid, NaiveDate)],
    ) -> Result<Vec<RouteOptimizationRecord>, StoreError> {
        let mut records = Vec::new();
        for &(technician_id, route_date) in keys {
            if let Some(record) = self.load_latest(technician_id, route_date).await? {
                records.push(record);
            }
        }
        Ok(records)
    }
}

/// Postgres-backed store
pub struct PgRouteStore {
    pool: PgPool,
}

impl PgRouteStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl RouteStore for PgRouteStore {
    async fn upsert(&self, record: &RouteOptimizationRecord) -> Result<(), StoreError> {
        route_optimization::upsert_route_optimization(&self.pool, record).await?;
        debug!(
            "Stored {} order for technician {} on {}",
            record.optimization_method.as_str(),
            record.technician_id,
            record.route_date
        );
        Ok(())
    }

    async fn load_latest(
        &self,
        technician_id: Uuid,
        route_date: NaiveDate,
    ) -> Result<Option<RouteOptimizationRecord>, StoreError> {
        let mut records =
            route_optimization::list_route_optimizations(&self.pool, &[technician_id], &[route_date])
                .await?;
        records.sort_by_key(|r| r.updated_at);
        Ok(records.pop())
    }

    async fn load_many(
        &self,
        keys: &[(Uuid, NaiveDate)],
    ) -> Result<Vec<RouteOptimizationRecord>, StoreError> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let (technician_ids, route_dates): (Vec<Uuid>, Vec<NaiveDate>) = keys.iter().copied().unzip();
        Ok(route_optimization::list_route_optimizations(&self.pool, &technician_ids, &route_dates).await?)
    }
}

/// Process-local store, used when no database is configured and in tests
#[derive(Default)]
pub struct InMemoryRouteStore {
    records: Mutex<HashMap<(Uuid, NaiveDate), RouteOptimizationRecord>>,
}

impl InMemoryRouteStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }
}

#[async_trait]
impl RouteStore for InMemoryRouteStore {
    async fn upsert(&self, record: &RouteOptimizationRecord) -> Result<(), StoreError> {
        if record.waypoints_order.len() != record.ticket_ids.len() {
            return Err(StoreError::Rejected(
                "ticket ids must be parallel to waypoints".to_string(),
            ));
        }
        self.records
            .lock()
            .insert((record.technician_id, record.route_date), record.clone());
        Ok(())
    }

    async fn load_latest(
        &self,
        technician_id: Uuid,
        route_date: NaiveDate,
    ) -> Result<Option<RouteOptimizationRecord>, StoreError> {
        Ok(self.records.lock().get(&(technician_id, route_date)).cloned())
    }
}

/// Put the route's stops in `order` (stop ids).
///
/// Listed stops come first in the given order; stops the order does not
/// mention keep their current relative order after them. Unknown ids are
/// ignored. Returns true when the stop set matched `order` exactly.
pub fn apply_order(route: &mut Route, order: &[String]) -> bool {
    let position: HashMap<&str, usize> = order
        .iter()
        .enumerate()
        .map(|(i, id)| (id.as_str(), i))
        .collect();

    let current: HashSet<&str> = route.stops.iter().map(|s| s.id.as_str()).collect();
    let listed: HashSet<&str> = order.iter().map(String::as_str).collect();
    let identical = current == listed && order.len() == route.stops.len();

    let stale = listed.difference(&current).count();
    if stale > 0 {
        debug!("Dropping {} stale entries from stored order of route {}", stale, route.id);
    }

    // Stable: unlisted stops share one key and keep their order
    route
        .stops
        .sort_by_key(|s| position.get(s.id.as_str()).copied().unwrap_or(usize::MAX));
    assign_visit_order(&mut route.stops);

    identical
}

/// Recompute straight-line metrics and geometry for the current order
pub fn recompute_locally(route: &mut Route) {
    let cost = estimate_cost(&route.stops);
    set_metrics(route, cost.distance_km, cost.total_minutes());
    let points: Vec<_> = route.geocoded_stops().map(|s| s.coordinates).collect();
    route.geometry = geo::straight_line_geometry(&points);
}

/// Merge a persisted record into a freshly built route
pub fn reconcile(mut route: Route, record: &RouteOptimizationRecord) -> Route {
    let order: Vec<String> = record
        .waypoints_order
        .iter()
        .map(|w| w.stop_id.clone())
        .collect();

    if apply_order(&mut route, &order) {
        set_metrics(&mut route, record.distance_km, record.duration_minutes as f64);
        route.geometry = record.geometry.clone();
    } else {
        warn!(
            "Stops of route {} changed since its {} order was stored, recomputing metrics",
            route.key(),
            record.optimization_method.as_str()
        );
        recompute_locally(&mut route);
    }

    route.is_optimized = true;
    route.optimization_method = Some(record.optimization_method);
    route
}

//! Current routes projection
//!
//! Holds the upstream service-order rows and the `Route[]` built from them.
//! Every change (new rows, optimization, reorder, geocoding) ends in a full
//! rebuild; readers get an `Arc` snapshot and never see a partial rebuild.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::NaiveDate;
use parking_lot::{Mutex, RwLock};
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tracing::{info, warn};

use crate::services::geocoding::{GeocodeBatchReport, GeocodingCoordinator};
use crate::services::optimizer::{OptimizeError, RouteOptimizer};
use crate::services::route_builder::{build_routes, BuilderOptions};
use crate::services::route_store::{apply_order, reconcile, recompute_locally, RouteStore};
use crate::types::{
    BatchOptimizeProgress, BatchOptimizeReport, GeocodeItem, GeocodeProgress, OptimizationMethod,
    OptimizeRouteResponse, ReorderRouteResponse, Route, RouteKey, RouteOptimizationRecord,
    ServiceOrderRow,
};

pub struct RoutePlanner {
    options: BuilderOptions,
    rows: RwLock<Vec<ServiceOrderRow>>,
    routes: RwLock<Arc<Vec<Route>>>,
    /// Held across a whole rebuild so a slow one cannot install stale rows
    rebuild: AsyncMutex<()>,
    /// Manual orders that could not be persisted, by route group key
    session_orders: Mutex<HashMap<String, Vec<String>>>,
    store: Arc<dyn RouteStore>,
    optimizer: RouteOptimizer,
    geocoding: GeocodingCoordinator,
}

impl RoutePlanner {
    pub fn new(
        options: BuilderOptions,
        store: Arc<dyn RouteStore>,
        optimizer: RouteOptimizer,
        geocoding: GeocodingCoordinator,
    ) -> Self {
        Self {
            options,
            rows: RwLock::new(Vec::new()),
            routes: RwLock::new(Arc::new(Vec::new())),
            rebuild: AsyncMutex::new(()),
            session_orders: Mutex::new(HashMap::new()),
            store,
            optimizer,
            geocoding,
        }
    }

    /// Replace the upstream rows and rebuild
    pub async fn load(&self, rows: Vec<ServiceOrderRow>) -> Arc<Vec<Route>> {
        info!("Loading {} service orders", rows.len());
        *self.rows.write() = rows;
        self.reload().await
    }

    /// Rebuild routes from the current rows, then merge persisted records and
    /// session-only orders
    pub async fn reload(&self) -> Arc<Vec<Route>> {
        let _rebuild = self.rebuild.lock().await;
        let rows = self.rows.read().clone();
        let built = build_routes(&rows, &self.options);

        let keys: Vec<(_, _)> = built.iter().filter_map(|r| r.key().persistable()).collect();
        let records: HashMap<_, RouteOptimizationRecord> = match self.store.load_many(&keys).await {
            Ok(records) => records
                .into_iter()
                .map(|r| ((r.technician_id, r.route_date), r))
                .collect(),
            Err(e) => {
                warn!("Could not load stored route orders, showing computed ones: {}", e);
                HashMap::new()
            }
        };

        let session = self.session_orders.lock().clone();

        let routes: Vec<Route> = built
            .into_iter()
            .map(|route| {
                let mut route = match route.key().persistable().and_then(|k| records.get(&k)) {
                    Some(record) => reconcile(route, record),
                    None => route,
                };
                if let Some(order) = session.get(&route.key().group_key()) {
                    apply_order(&mut route, order);
                    recompute_locally(&mut route);
                    route.optimization_method = Some(OptimizationMethod::Manual);
                }
                route
            })
            .collect();

        let routes = Arc::new(routes);
        *self.routes.write() = routes.clone();
        routes
    }

    pub fn routes(&self) -> Arc<Vec<Route>> {
        self.routes.read().clone()
    }

    pub fn route(&self, route_id: u32) -> Result<Route, OptimizeError> {
        self.routes
            .read()
            .iter()
            .find(|r| r.id == route_id)
            .cloned()
            .ok_or(OptimizeError::RouteNotFound(route_id))
    }

    /// Ids of routes an optimize or reorder would currently reject
    pub fn busy_route_ids(&self) -> Vec<u32> {
        self.routes
            .read()
            .iter()
            .filter(|r| self.optimizer.is_busy(r))
            .map(|r| r.id)
            .collect()
    }

    pub async fn optimize_route(&self, route_id: u32) -> Result<OptimizeRouteResponse, OptimizeError> {
        let route = self.route(route_id)?;
        let response = self.optimizer.optimize(&route).await?;
        if response.persisted {
            self.forget_session_order(&route.key());
            self.reload().await;
        }
        Ok(response)
    }

    pub async fn optimize_all(
        &self,
        date: NaiveDate,
        progress_tx: Option<&mpsc::UnboundedSender<BatchOptimizeProgress>>,
    ) -> Result<BatchOptimizeReport, OptimizeError> {
        let routes = self.routes();
        let report = self.optimizer.optimize_all(&routes, date, progress_tx).await?;
        self.reload().await;
        Ok(report)
    }

    pub async fn reorder_route(
        &self,
        route_id: u32,
        stop_ids: Vec<String>,
    ) -> Result<ReorderRouteResponse, OptimizeError> {
        let route = self.route(route_id)?;
        let response = self.optimizer.reorder(&route, &stop_ids).await?;

        let key = route.key();
        if response.persisted {
            self.forget_session_order(&key);
        } else {
            info!("Keeping order of route {} for this session", key);
            self.session_orders.lock().insert(key.group_key(), stop_ids);
        }
        self.reload().await;
        Ok(response)
    }

    fn forget_session_order(&self, key: &RouteKey) {
        self.session_orders.lock().remove(&key.group_key());
    }

    /// Stops of the route that still need coordinates
    pub fn geocode_items(&self, route_id: u32) -> Result<Vec<GeocodeItem>, OptimizeError> {
        let route = self.route(route_id)?;
        Ok(route
            .stops
            .iter()
            .filter(|s| !s.has_real_coordinates)
            .map(|s| GeocodeItem {
                stop_id: s.id.clone(),
                service_order_id: s.service_order_id,
                address: s.address.clone(),
            })
            .collect())
    }

    /// Geocode the given items, write the coordinates back into the rows and
    /// rebuild so the new stops go through clustering again.
    pub async fn geocode(
        &self,
        items: Vec<GeocodeItem>,
        progress_tx: Option<&mpsc::UnboundedSender<GeocodeProgress>>,
    ) -> GeocodeBatchReport {
        let report = self.geocoding.run(items, progress_tx).await;

        if !report.resolved.is_empty() {
            let mut rows = self.rows.write();
            for (item, coordinates) in &report.resolved {
                if let Some(row) = rows.iter_mut().find(|r| r.id == item.service_order_id) {
                    row.latitude = Some(coordinates.lat);
                    row.longitude = Some(coordinates.lng);
                }
            }
        }

        self.reload().await;
        report
    }

    /// Geocode every stop of the route that lacks coordinates
    pub async fn geocode_route(
        &self,
        route_id: u32,
        progress_tx: Option<&mpsc::UnboundedSender<GeocodeProgress>>,
    ) -> Result<GeocodeBatchReport, OptimizeError> {
        let items = self.geocode_items(route_id)?;
        Ok(self.geocode(items, progress_tx).await)
    }
}

//! Routing provider gateway
//!
//! Refines a route's path and travel time through external providers tried
//! strictly in sequence (primary, then secondary), with a local straight-line
//! estimate as the last resort.
//!
//! Geometry crossing this boundary is always `[lng, lat]` (provider order).

mod mapbox;
mod osrm;
mod polyline;

pub use mapbox::{MapboxClient, MapboxConfig};
pub use osrm::{OsrmClient, OsrmConfig};
pub use polyline::decode_polyline;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::services::geo;
use crate::services::local_ordering::estimate_cost;
use crate::types::{Coordinates, OptimizationMethod, Route, RoutingResult};

/// Path returned by one provider
#[derive(Debug, Clone, PartialEq)]
pub struct ProviderRoute {
    /// [lng, lat] pairs
    pub geometry: Vec<[f64; 2]>,
    pub distance_km: f64,
    pub duration_minutes: f64,
}

/// Why a single provider attempt failed
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ProviderError {
    #[error("provider unavailable: {0}")]
    Unavailable(String),
    #[error("provider returned an empty geometry")]
    EmptyGeometry,
    #[error("provider did not answer within {0:?}")]
    Timeout(Duration),
    #[error("malformed provider response: {0}")]
    Malformed(String),
    #[error("provider accepts at most {max} waypoints, got {got}")]
    TooManyWaypoints { max: usize, got: usize },
}

/// One failed attempt in the fallback chain
#[derive(Debug, Clone, PartialEq)]
pub struct ProviderFailure {
    pub provider: String,
    pub error: ProviderError,
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum RoutingError {
    #[error("route has {found} geocoded stops, at least 2 are required")]
    NoGeocodedStops { found: usize },
    #[error("all routing providers failed ({})", describe_failures(.0))]
    ProvidersExhausted(Vec<ProviderFailure>),
}

fn describe_failures(failures: &[ProviderFailure]) -> String {
    if failures.is_empty() {
        return "none configured".to_string();
    }
    failures
        .iter()
        .map(|f| format!("{}: {}", f.provider, f.error))
        .collect::<Vec<_>>()
        .join("; ")
}

/// What to do once every external provider failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FallbackPolicy {
    /// Degrade to the local straight-line estimate
    LocalEstimate,
    /// Report the failure
    ProvidersOnly,
}

/// External routing service
#[async_trait]
pub trait RoutingProvider: Send + Sync {
    /// Road-following path through `waypoints`, visited in the given order
    async fn route(&self, waypoints: &[Coordinates]) -> Result<ProviderRoute, ProviderError>;

    /// Method recorded when this provider's result is accepted
    fn method(&self) -> OptimizationMethod;

    /// Get service name for logging
    fn name(&self) -> &str;
}

/// Ordered fallback chain of routing providers
pub struct RoutingGateway {
    providers: Vec<Arc<dyn RoutingProvider>>,
    attempt_timeout: Duration,
}

impl RoutingGateway {
    pub fn new(providers: Vec<Arc<dyn RoutingProvider>>, attempt_timeout: Duration) -> Self {
        Self {
            providers,
            attempt_timeout,
        }
    }

    pub fn provider_names(&self) -> Vec<String> {
        self.providers.iter().map(|p| p.name().to_string()).collect()
    }

    /// Refine the route's path, keeping its current stop order.
    ///
    /// Only geocoded stops are sent. The result geometry is `[lng, lat]`.
    pub async fn route(
        &self,
        route: &Route,
        policy: FallbackPolicy,
    ) -> Result<RoutingResult, RoutingError> {
        let waypoints: Vec<Coordinates> = route.geocoded_stops().map(|s| s.coordinates).collect();
        if waypoints.len() < 2 {
            return Err(RoutingError::NoGeocodedStops {
                found: waypoints.len(),
            });
        }

        let mut failures = Vec::new();
        for provider in &self.providers {
            debug!(
                "Requesting route {} from {} with {} waypoints",
                route.id,
                provider.name(),
                waypoints.len()
            );
            match self.attempt(provider.as_ref(), &waypoints).await {
                Ok(path) => {
                    info!(
                        "Route {} refined by {}: {:.1} km, {:.0} min",
                        route.id,
                        provider.name(),
                        path.distance_km,
                        path.duration_minutes
                    );
                    return Ok(RoutingResult {
                        geometry: path.geometry,
                        distance_km: path.distance_km,
                        duration_minutes: path.duration_minutes,
                        provider: Some(provider.method()),
                    });
                }
                Err(error) => {
                    warn!(
                        "Routing provider {} failed for route {}: {}. Trying next strategy.",
                        provider.name(),
                        route.id,
                        error
                    );
                    failures.push(ProviderFailure {
                        provider: provider.name().to_string(),
                        error,
                    });
                }
            }
        }

        match policy {
            FallbackPolicy::LocalEstimate => {
                warn!("All routing providers failed for route {}. Using straight lines.", route.id);
                Ok(local_estimate(route, &waypoints))
            }
            FallbackPolicy::ProvidersOnly => Err(RoutingError::ProvidersExhausted(failures)),
        }
    }

    async fn attempt(
        &self,
        provider: &dyn RoutingProvider,
        waypoints: &[Coordinates],
    ) -> Result<ProviderRoute, ProviderError> {
        let path = tokio::time::timeout(self.attempt_timeout, provider.route(waypoints))
            .await
            .map_err(|_| ProviderError::Timeout(self.attempt_timeout))??;

        if path.geometry.is_empty() {
            return Err(ProviderError::EmptyGeometry);
        }
        Ok(path)
    }
}

/// Straight lines between the stops with the heuristic's estimate
fn local_estimate(route: &Route, waypoints: &[Coordinates]) -> RoutingResult {
    let cost = estimate_cost(&route.stops);
    RoutingResult {
        geometry: geo::straight_line_geometry(waypoints),
        distance_km: cost.distance_km,
        duration_minutes: cost.total_minutes(),
        provider: Some(OptimizationMethod::Local),
    }
}

/// Build the provider chain from configuration: Mapbox (when a token is
/// configured) before OSRM.
pub fn create_routing_providers(config: &Config) -> Result<Vec<Arc<dyn RoutingProvider>>> {
    let mut providers: Vec<Arc<dyn RoutingProvider>> = Vec::new();
    let timeout_seconds = config.routing_timeout_secs;

    if let Some(token) = &config.mapbox_token {
        let mapbox = MapboxClient::new(MapboxConfig {
            base_url: config.mapbox_base_url.clone(),
            access_token: token.clone(),
            timeout_seconds,
            ..Default::default()
        })?;
        info!("Mapbox routing enabled at {}", config.mapbox_base_url);
        providers.push(Arc::new(mapbox));
    }

    if let Some(url) = &config.osrm_url {
        let osrm = OsrmClient::new(OsrmConfig {
            base_url: url.clone(),
            timeout_seconds,
            ..Default::default()
        })?;
        info!("OSRM routing enabled at {}", url);
        providers.push(Arc::new(osrm));
    }

    if providers.is_empty() {
        warn!("No routing provider configured, routes will use local estimates only");
    }

    Ok(providers)
}


#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;
    use crate::services::route_builder::{build_routes, BuilderOptions};
    use crate::types::{Priority, ServiceOrderRow};
    use chrono::NaiveDate;
    use uuid::Uuid;

    fn route_with(coords: &[Option<(f64, f64)>]) -> Route {
        let rows: Vec<ServiceOrderRow> = coords
            .iter()
            .enumerate()
            .map(|(i, c)| ServiceOrderRow {
                id: Uuid::from_u128(i as u128 + 1),
                ticket_id: Uuid::from_u128(i as u128 + 100),
                client_name: format!("Client {}", i),
                address: format!("Street {}", i),
                priority: Priority::High,
                status: "open".to_string(),
                service_type: None,
                technician_id: Some(Uuid::from_u128(7)),
                technician_name: Some("Tech".to_string()),
                scheduled_date: NaiveDate::from_ymd_opt(2024, 3, 1),
                estimated_hours: Some(1.0),
                latitude: c.map(|c| c.0),
                longitude: c.map(|c| c.1),
            })
            .collect();
        build_routes(&rows, &BuilderOptions::default()).remove(0)
    }

    fn gateway(providers: Vec<Arc<dyn RoutingProvider>>) -> RoutingGateway {
        RoutingGateway::new(providers, Duration::from_millis(200))
    }

    #[tokio::test]
    async fn test_primary_success_skips_secondary() {
        let primary = Arc::new(ScriptedProvider::succeeding("mapbox", OptimizationMethod::Mapbox));
        let secondary = Arc::new(ScriptedProvider::succeeding("osrm", OptimizationMethod::Osrm));
        let gw = gateway(vec![primary.clone(), secondary.clone()]);

        let route = route_with(&[Some((50.05, 14.40)), Some((50.10, 14.50))]);
        let result = gw.route(&route, FallbackPolicy::LocalEstimate).await.unwrap();

        assert_eq!(result.provider, Some(OptimizationMethod::Mapbox));
        assert_eq!(primary.call_count(), 1);
        assert_eq!(secondary.call_count(), 0);
    }

    #[tokio::test]
    async fn test_primary_failure_falls_back_to_secondary() {
        let primary = Arc::new(ScriptedProvider::failing("mapbox", OptimizationMethod::Mapbox));
        let secondary = Arc::new(ScriptedProvider::succeeding("osrm", OptimizationMethod::Osrm));
        let gw = gateway(vec![primary.clone(), secondary.clone()]);

        let route = route_with(&[Some((50.05, 14.40)), Some((50.10, 14.50))]);
        let result = gw.route(&route, FallbackPolicy::LocalEstimate).await.unwrap();

        assert_eq!(result.provider, Some(OptimizationMethod::Osrm));
        assert_eq!(result.distance_km, 12.5);
        assert_eq!(primary.call_count(), 1);
        assert_eq!(secondary.call_count(), 1);
    }

    #[tokio::test]
    async fn test_empty_geometry_triggers_fallback() {
        let empty = Arc::new(ScriptedProvider::new(
            "mapbox",
            OptimizationMethod::Mapbox,
            Script::Succeed(ProviderRoute {
                geometry: vec![],
                distance_km: 1.0,
                duration_minutes: 1.0,
            }),
        ));
        let secondary = Arc::new(ScriptedProvider::succeeding("osrm", OptimizationMethod::Osrm));
        let gw = gateway(vec![empty, secondary]);

        let route = route_with(&[Some((50.05, 14.40)), Some((50.10, 14.50))]);
        let result = gw.route(&route, FallbackPolicy::LocalEstimate).await.unwrap();
        assert_eq!(result.provider, Some(OptimizationMethod::Osrm));
    }

    #[tokio::test]
    async fn test_hanging_provider_times_out() {
        let hanging = Arc::new(ScriptedProvider::new("mapbox", OptimizationMethod::Mapbox, Script::Hang));
        let secondary = Arc::new(ScriptedProvider::succeeding("osrm", OptimizationMethod::Osrm));
        let gw = RoutingGateway::new(vec![hanging, secondary], Duration::from_millis(20));

        let route = route_with(&[Some((50.05, 14.40)), Some((50.10, 14.50))]);
        let result = gw.route(&route, FallbackPolicy::LocalEstimate).await.unwrap();
        assert_eq!(result.provider, Some(OptimizationMethod::Osrm));
    }

    #[tokio::test]
    async fn test_exhausted_chain_uses_straight_lines() {
        let gw = gateway(vec![
            Arc::new(ScriptedProvider::failing("mapbox", OptimizationMethod::Mapbox)),
            Arc::new(ScriptedProvider::failing("osrm", OptimizationMethod::Osrm)),
        ]);

        let route = route_with(&[Some((50.05, 14.40)), Some((50.10, 14.50))]);
        let result = gw.route(&route, FallbackPolicy::LocalEstimate).await.unwrap();

        assert_eq!(result.provider, Some(OptimizationMethod::Local));
        // Raw stop coordinates, [lng, lat], in route order
        let expected: Vec<[f64; 2]> = route.stops.iter().map(|s| geo::to_storage(&s.coordinates)).collect();
        assert_eq!(result.geometry, expected);
        assert!((result.distance_km - route.total_distance_km).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_exhausted_chain_reports_failures_when_local_disabled() {
        let gw = gateway(vec![
            Arc::new(ScriptedProvider::failing("mapbox", OptimizationMethod::Mapbox)),
            Arc::new(ScriptedProvider::failing("osrm", OptimizationMethod::Osrm)),
        ]);
        let route = route_with(&[Some((50.05, 14.40)), Some((50.10, 14.50))]);

        match gw.route(&route, FallbackPolicy::ProvidersOnly).await {
            Err(RoutingError::ProvidersExhausted(failures)) => {
                assert_eq!(failures.len(), 2);
                assert_eq!(failures[0].provider, "mapbox");
                assert_eq!(failures[1].provider, "osrm");
            }
            other => panic!("expected exhausted chain, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_precondition_rejected_before_any_call() {
        let primary = Arc::new(ScriptedProvider::succeeding("mapbox", OptimizationMethod::Mapbox));
        let gw = gateway(vec![primary.clone()]);

        let route = route_with(&[Some((50.05, 14.40)), None]);
        let result = gw.route(&route, FallbackPolicy::LocalEstimate).await;

        assert_eq!(result, Err(RoutingError::NoGeocodedStops { found: 1 }));
        assert_eq!(primary.call_count(), 0);
    }

    #[tokio::test]
    async fn test_only_geocoded_stops_are_sent_in_route_order() {
        let primary = Arc::new(ScriptedProvider::succeeding("mapbox", OptimizationMethod::Mapbox));
        let gw = gateway(vec![primary.clone()]);

        let route = route_with(&[Some((50.05, 14.40)), None, Some((50.10, 14.50))]);
        gw.route(&route, FallbackPolicy::LocalEstimate).await.unwrap();

        let sent = &primary.calls()[0];
        let expected: Vec<Coordinates> = route.geocoded_stops().map(|s| s.coordinates).collect();
        assert_eq!(sent, &expected);
        assert_eq!(sent.len(), 2);
    }

    #[tokio::test]
    async fn test_result_geometry_is_lng_lat_and_converts_for_display() {
        let gw = gateway(vec![Arc::new(ScriptedProvider::succeeding(
            "mapbox",
            OptimizationMethod::Mapbox,
        ))]);
        let route = route_with(&[Some((50.05, 14.40)), Some((50.10, 14.50))]);
        let result = gw.route(&route, FallbackPolicy::LocalEstimate).await.unwrap();

        // Provider order: first value is the longitude
        assert_eq!(result.geometry[0], [14.40, 50.05]);
        let display = geo::to_display(result.geometry[0]);
        assert_eq!(display, Coordinates { lat: 50.05, lng: 14.40 });
        assert_eq!(geo::to_storage(&display), result.geometry[0]);
    }

    #[test]
    fn test_exhausted_message_lists_providers() {
        let err = RoutingError::ProvidersExhausted(vec![ProviderFailure {
            provider: "osrm".to_string(),
            error: ProviderError::EmptyGeometry,
        }]);
        assert_eq!(
            err.to_string(),
            "all routing providers failed (osrm: provider returned an empty geometry)"
        );
    }
}

//! OSRM route service client

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use tracing::debug;

use super::{decode_polyline, ProviderError, ProviderRoute, RoutingProvider};
use crate::types::{Coordinates, OptimizationMethod};

#[derive(Debug, Clone)]
pub struct OsrmConfig {
    pub base_url: String,
    pub profile: String,
    pub timeout_seconds: u64,
}

impl Default for OsrmConfig {
    fn default() -> Self {
        Self {
            base_url: "https://router.project-osrm.org".to_string(),
            profile: "driving".to_string(),
            timeout_seconds: 15,
        }
    }
}

pub struct OsrmClient {
    client: Client,
    config: OsrmConfig,
}

impl OsrmClient {
    pub fn new(config: OsrmConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(config.timeout_seconds))
            .build()
            .context("Failed to create OSRM HTTP client")?;

        Ok(Self { client, config })
    }

    fn route_url(&self, waypoints: &[Coordinates]) -> String {
        let coords = waypoints
            .iter()
            .map(|c| format!("{:.6},{:.6}", c.lng, c.lat))
            .collect::<Vec<_>>()
            .join(";");

        format!(
            "{}/route/v1/{}/{}?overview=full&geometries=polyline6",
            self.config.base_url.trim_end_matches('/'),
            self.config.profile,
            coords
        )
    }
}

#[derive(Debug, Deserialize)]
struct OsrmRouteResponse {
    code: String,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    routes: Vec<OsrmRoute>,
}

#[derive(Debug, Deserialize)]
struct OsrmRoute {
    geometry: String,
    distance: f64,
    duration: f64,
}

fn parse_route(body: &str) -> Result<ProviderRoute, ProviderError> {
    let response: OsrmRouteResponse =
        serde_json::from_str(body).map_err(|e| ProviderError::Malformed(e.to_string()))?;

    if response.code != "Ok" {
        return Err(ProviderError::Unavailable(match response.message {
            Some(message) => format!("{}: {}", response.code, message),
            None => response.code,
        }));
    }

    let route = response
        .routes
        .into_iter()
        .next()
        .ok_or(ProviderError::EmptyGeometry)?;

    Ok(ProviderRoute {
        geometry: decode_polyline(&route.geometry, 6)?,
        distance_km: route.distance / 1000.0,
        duration_minutes: route.duration / 60.0,
    })
}

#[async_trait]
impl RoutingProvider for OsrmClient {
    async fn route(&self, waypoints: &[Coordinates]) -> Result<ProviderRoute, ProviderError> {
        debug!("Requesting OSRM route for {} waypoints", waypoints.len());

        let response = self
            .client
            .get(self.route_url(waypoints))
            .send()
            .await
            .map_err(|e| ProviderError::Unavailable(e.to_string()))?;

        // OSRM reports NoRoute and friends with a 400 and a JSON body
        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| ProviderError::Unavailable(e.to_string()))?;

        if status.is_server_error() {
            return Err(ProviderError::Unavailable(format!("HTTP {}", status)));
        }

        parse_route(&body)
    }

    fn method(&self) -> OptimizationMethod {
        OptimizationMethod::Osrm
    }

    fn name(&self) -> &str {
        "osrm"
    }
}

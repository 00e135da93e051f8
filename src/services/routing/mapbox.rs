//! Mapbox Directions client
//!
//! API documentation:
//! https://docs.mapbox.com/api/navigation/directions/

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use tracing::debug;

use super::{decode_polyline, ProviderError, ProviderRoute, RoutingProvider};
use crate::types::{Coordinates, OptimizationMethod};

/// Directions API accepts at most this many coordinates per request
const MAX_WAYPOINTS: usize = 25;

#[derive(Debug, Clone)]
pub struct MapboxConfig {
    /// Base URL, e.g. "https://api.mapbox.com"
    pub base_url: String,
    pub access_token: String,
    /// Routing profile ("driving", "driving-traffic", ...)
    pub profile: String,
    pub timeout_seconds: u64,
}

impl Default for MapboxConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.mapbox.com".to_string(),
            access_token: String::new(),
            profile: "driving".to_string(),
            timeout_seconds: 15,
        }
    }
}

pub struct MapboxClient {
    client: Client,
    config: MapboxConfig,
}

impl MapboxClient {
    pub fn new(config: MapboxConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(config.timeout_seconds))
            .build()
            .context("Failed to create Mapbox HTTP client")?;

        Ok(Self { client, config })
    }

    /// Directions URL for the waypoints, coordinates as `lng,lat`
    fn directions_url(&self, waypoints: &[Coordinates]) -> String {
        let coords = waypoints
            .iter()
            .map(|c| format!("{:.6},{:.6}", c.lng, c.lat))
            .collect::<Vec<_>>()
            .join(";");

        format!(
            "{}/directions/v5/mapbox/{}/{}?geometries=polyline6&overview=full&access_token={}",
            self.config.base_url.trim_end_matches('/'),
            self.config.profile,
            coords,
            urlencoding::encode(&self.config.access_token)
        )
    }
}

#[derive(Debug, Deserialize)]
struct DirectionsResponse {
    code: String,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    routes: Vec<DirectionsRoute>,
}

#[derive(Debug, Deserialize)]
struct DirectionsRoute {
    geometry: String,
    /// Meters
    distance: f64,
    /// Seconds
    duration: f64,
}

fn parse_directions(body: &str) -> Result<ProviderRoute, ProviderError> {
    let response: DirectionsResponse =
        serde_json::from_str(body).map_err(|e| ProviderError::Malformed(e.to_string()))?;

    if response.code != "Ok" {
        let detail = response.message.unwrap_or_default();
        return Err(ProviderError::Unavailable(format!("{} {}", response.code, detail).trim().to_string()));
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
impl RoutingProvider for MapboxClient {
    async fn route(&self, waypoints: &[Coordinates]) -> Result<ProviderRoute, ProviderError> {
        if waypoints.len() > MAX_WAYPOINTS {
            return Err(ProviderError::TooManyWaypoints {
                max: MAX_WAYPOINTS,
                got: waypoints.len(),
            });
        }

        debug!("Requesting Mapbox directions for {} waypoints", waypoints.len());

        let response = self
            .client
            .get(self.directions_url(waypoints))
            .send()
            .await
            .map_err(|e| ProviderError::Unavailable(e.without_url().to_string()))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| ProviderError::Unavailable(e.without_url().to_string()))?;

        if !status.is_success() {
            return Err(ProviderError::Unavailable(format!("HTTP {}", status)));
        }

        parse_directions(&body)
    }

    fn method(&self) -> OptimizationMethod {
        OptimizationMethod::Mapbox
    }

    fn name(&self) -> &str {
        "mapbox"
    }
}

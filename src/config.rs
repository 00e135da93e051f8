//! Configuration management

use std::str::FromStr;

use anyhow::{self, Context, Result};

use crate::defaults::{DEFAULT_FALLBACK_ORIGIN, DEFAULT_ROUTING_TIMEOUT_SECS};
use crate::services::geo::validate_coordinates;
use crate::types::Coordinates;

const DEFAULT_NATS_URL: &str = "nats://localhost:4222";
const DEFAULT_MAPBOX_BASE_URL: &str = "https://api.mapbox.com";
const DEFAULT_OSRM_URL: &str = "https://router.project-osrm.org";
const DEFAULT_DB_MAX_CONNECTIONS: u32 = 10;

/// Application configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// NATS server URL
    pub nats_url: String,

    /// Optional NATS credentials, only used when both are set
    pub nats_user: Option<String>,
    pub nats_password: Option<String>,

    /// PostgreSQL connection string. Without it route orders are kept in
    /// memory for the life of the process.
    pub database_url: Option<String>,

    pub db_max_connections: u32,

    /// Mapbox access token; the primary routing provider is disabled without it
    pub mapbox_token: Option<String>,

    pub mapbox_base_url: String,

    /// OSRM server URL (None disables the secondary provider)
    pub osrm_url: Option<String>,

    /// Per-attempt timeout for routing providers
    pub routing_timeout_secs: u64,

    /// Coordinate for stops without a geocoded address
    pub fallback_origin: Coordinates,

    pub logs_dir: String,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        // Load .env file if present
        dotenvy::dotenv().ok();

        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build the configuration from any key lookup
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        // Blank values count as unset
        let var = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let nats_url = var("NATS_URL").unwrap_or_else(|| DEFAULT_NATS_URL.to_string());

        let database_url = var("DATABASE_URL");

        let db_max_connections = parse_number("DB_MAX_CONNECTIONS", var("DB_MAX_CONNECTIONS"))?
            .unwrap_or(DEFAULT_DB_MAX_CONNECTIONS);
        if db_max_connections == 0 {
            anyhow::bail!("DB_MAX_CONNECTIONS must be at least 1");
        }

        let mapbox_base_url = var("MAPBOX_BASE_URL").unwrap_or_else(|| DEFAULT_MAPBOX_BASE_URL.to_string());

        // An explicitly empty OSRM_URL turns the provider off
        let osrm_url = match lookup("OSRM_URL") {
            None => Some(DEFAULT_OSRM_URL.to_string()),
            Some(url) if url.trim().is_empty() => None,
            Some(url) => Some(url.trim().to_string()),
        };

        let routing_timeout_secs = parse_number("ROUTING_TIMEOUT_SECS", var("ROUTING_TIMEOUT_SECS"))?
            .unwrap_or(DEFAULT_ROUTING_TIMEOUT_SECS);
        if routing_timeout_secs == 0 {
            anyhow::bail!("ROUTING_TIMEOUT_SECS must be at least 1");
        }

        let fallback_origin = match (var("FALLBACK_ORIGIN_LAT"), var("FALLBACK_ORIGIN_LNG")) {
            (None, None) => DEFAULT_FALLBACK_ORIGIN,
            (lat, lng) => {
                let lat = parse_number::<f64>("FALLBACK_ORIGIN_LAT", lat)?;
                let lng = parse_number::<f64>("FALLBACK_ORIGIN_LNG", lng)?;
                validate_coordinates(lat, lng).context(
                    "FALLBACK_ORIGIN_LAT and FALLBACK_ORIGIN_LNG must both be set to a valid coordinate",
                )?
            }
        };

        Ok(Self {
            nats_url,
            nats_user: var("NATS_USER"),
            nats_password: var("NATS_PASSWORD"),
            database_url,
            db_max_connections,
            mapbox_token: var("MAPBOX_ACCESS_TOKEN"),
            mapbox_base_url,
            osrm_url,
            routing_timeout_secs,
            fallback_origin,
            logs_dir: var("LOGS_DIR").unwrap_or_else(|| "../logs".to_string()),
        })
    }

    pub fn require_database_url(&self) -> Result<&str> {
        self.database_url
            .as_deref()
            .context("DATABASE_URL must be set")
    }
}

fn parse_number<T: FromStr>(key: &str, value: Option<String>) -> Result<Option<T>> {
    match value {
        None => Ok(None),
        Some(raw) => match raw.parse::<T>() {
            Ok(n) => Ok(Some(n)),
            Err(_) => anyhow::bail!("{} must be a number, got '{}'", key, raw),
        },
    }
}

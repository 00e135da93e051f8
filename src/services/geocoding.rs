//! Geocoding of stops that lack real coordinates
//!
//! The external geocoder is only ever reached through `Geocoder`. Production
//! uses `RateLimitedNominatimGeocoder` (minimum interval between requests and
//! a circuit breaker); tests and development use `MockGeocoder`.
//!
//! Configuration via GEOCODER_BACKEND env variable:
//! - "mock" → MockGeocoder
//! - "nominatim" → RateLimitedNominatimGeocoder

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

use crate::services::nominatim::NominatimClient;
use crate::types::{Coordinates, GeocodeItem, GeocodeProgress};

/// Geocoder trait - abstraction for all geocoding implementations
#[async_trait]
pub trait Geocoder: Send + Sync {
    /// Resolve a free-form address. Returns None if nothing matched.
    async fn geocode(&self, address: &str) -> Result<Option<GeocodingResult>>;

    fn name(&self) -> &'static str;
}

#[derive(Debug, Clone)]
pub struct GeocodingResult {
    pub coordinates: Coordinates,
    pub display_name: String,
}

// ==========================================================================
// MockGeocoder
// ==========================================================================

/// Deterministic fake coordinates derived from the address hash
pub struct MockGeocoder;

impl MockGeocoder {
    pub fn new() -> Self {
        Self
    }

    /// Coordinates inside a box around the default service area
    fn hash_to_coordinates(address: &str) -> Coordinates {
        use std::collections::hash_map::DefaultHasher;
        use std::hash::{Hash, Hasher};

        let mut hasher = DefaultHasher::new();
        address.trim().to_lowercase().hash(&mut hasher);
        let hash = hasher.finish();

        const LAT_MIN: f64 = 49.0;
        const LAT_MAX: f64 = 50.5;
        const LNG_MIN: f64 = 13.0;
        const LNG_MAX: f64 = 17.5;

        let lat_normalized = ((hash >> 32) as f64) / (u32::MAX as f64);
        let lng_normalized = ((hash & 0xFFFF_FFFF) as f64) / (u32::MAX as f64);

        Coordinates {
            lat: LAT_MIN + lat_normalized * (LAT_MAX - LAT_MIN),
            lng: LNG_MIN + lng_normalized * (LNG_MAX - LNG_MIN),
        }
    }
}

impl Default for MockGeocoder {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Geocoder for MockGeocoder {
    async fn geocode(&self, address: &str) -> Result<Option<GeocodingResult>> {
        if address.trim().is_empty() {
            return Ok(None);
        }
        Ok(Some(GeocodingResult {
            coordinates: Self::hash_to_coordinates(address),
            display_name: address.to_string(),
        }))
    }

    fn name(&self) -> &'static str {
        "mock"
    }
}

// ==========================================================================
// RateLimiter
// ==========================================================================

/// Enforces a minimum interval between calls
pub struct RateLimiter {
    last_call: Mutex<Option<Instant>>,
    min_interval: Duration,
}

impl RateLimiter {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            last_call: Mutex::new(None),
            min_interval,
        }
    }

    /// Wait until it's safe to make another call
    pub async fn wait(&self) {
        // Held across the sleep so concurrent callers queue up in order
        let mut last = self.last_call.lock().await;

        if let Some(last_time) = *last {
            let elapsed = last_time.elapsed();
            if elapsed < self.min_interval {
                tokio::time::sleep(self.min_interval - elapsed).await;
            }
        }

        *last = Some(Instant::now());
    }
}

// ==========================================================================
// CircuitBreaker
// ==========================================================================

/// Stops calls to a failing service until it had time to recover
pub struct CircuitBreaker {
    failure_count: AtomicU32,
    threshold: u32,
    last_failure: parking_lot::Mutex<Option<Instant>>,
    recovery_time: Duration,
}

impl CircuitBreaker {
    pub fn new(threshold: u32, recovery_time: Duration) -> Self {
        Self {
            failure_count: AtomicU32::new(0),
            threshold,
            last_failure: parking_lot::Mutex::new(None),
            recovery_time,
        }
    }

    /// Open means calls are rejected. Past the recovery time one retry is
    /// let through (half-open).
    pub fn is_open(&self) -> bool {
        if self.failure_count.load(Ordering::Relaxed) < self.threshold {
            return false;
        }
        match *self.last_failure.lock() {
            Some(last_time) => last_time.elapsed() < self.recovery_time,
            None => true,
        }
    }

    pub fn record_failure(&self) {
        self.failure_count.fetch_add(1, Ordering::Relaxed);
        *self.last_failure.lock() = Some(Instant::now());
    }

    /// Resets the failure count
    pub fn record_success(&self) {
        self.failure_count.store(0, Ordering::Relaxed);
    }
}

// ==========================================================================
// RateLimitedNominatimGeocoder
// ==========================================================================

/// Nominatim allows 1 req/s
const DEFAULT_RATE_LIMIT_MS: u64 = 1500;
const DEFAULT_CIRCUIT_BREAKER_THRESHOLD: u32 = 3;
const DEFAULT_CIRCUIT_BREAKER_RECOVERY_SECS: u64 = 300;
const DEFAULT_NOMINATIM_URL: &str = "https://nominatim.openstreetmap.org";

/// Nominatim client behind a rate limiter and a circuit breaker
pub struct RateLimitedNominatimGeocoder {
    client: NominatimClient,
    rate_limiter: RateLimiter,
    pub(crate) circuit_breaker: CircuitBreaker,
}

impl RateLimitedNominatimGeocoder {
    pub fn with_config(
        base_url: &str,
        country_codes: &str,
        rate_limit_interval: Duration,
        circuit_breaker_threshold: u32,
        circuit_breaker_recovery: Duration,
    ) -> Result<Self> {
        Ok(Self {
            client: NominatimClient::new(base_url, country_codes)?,
            rate_limiter: RateLimiter::new(rate_limit_interval),
            circuit_breaker: CircuitBreaker::new(circuit_breaker_threshold, circuit_breaker_recovery),
        })
    }

    /// Create from environment variables
    pub fn from_env() -> Result<Self> {
        let base_url =
            std::env::var("NOMINATIM_BASE_URL").unwrap_or_else(|_| DEFAULT_NOMINATIM_URL.to_string());
        let country_codes = std::env::var("NOMINATIM_COUNTRY_CODES").unwrap_or_default();

        let rate_limit_ms = env_number("NOMINATIM_RATE_LIMIT_MS", DEFAULT_RATE_LIMIT_MS);
        let cb_threshold = env_number("NOMINATIM_CB_THRESHOLD", DEFAULT_CIRCUIT_BREAKER_THRESHOLD);
        let cb_recovery_secs =
            env_number("NOMINATIM_CB_RECOVERY_SECS", DEFAULT_CIRCUIT_BREAKER_RECOVERY_SECS);

        Self::with_config(
            &base_url,
            &country_codes,
            Duration::from_millis(rate_limit_ms),
            cb_threshold,
            Duration::from_secs(cb_recovery_secs),
        )
    }
}

fn env_number<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

#[async_trait]
impl Geocoder for RateLimitedNominatimGeocoder {
    async fn geocode(&self, address: &str) -> Result<Option<GeocodingResult>> {
        if self.circuit_breaker.is_open() {
            warn!("Circuit breaker is open, rejecting geocoding request");
            anyhow::bail!("Geocoding service temporarily unavailable (circuit breaker open)");
        }

        self.rate_limiter.wait().await;

        match self.client.search(address).await {
            Ok(found) => {
                // No match is not a service failure
                self.circuit_breaker.record_success();
                Ok(found.map(|m| GeocodingResult {
                    coordinates: m.coordinates,
                    display_name: m.display_name,
                }))
            }
            Err(e) => {
                self.circuit_breaker.record_failure();
                Err(e)
            }
        }
    }

    fn name(&self) -> &'static str {
        "nominatim"
    }
}

/// Create geocoder based on GEOCODER_BACKEND environment variable
///
/// - `GEOCODER_BACKEND`: "mock" or "nominatim" (default: "mock")
/// - `NOMINATIM_BASE_URL`: Nominatim API URL (default: public OSM)
/// - `NOMINATIM_COUNTRY_CODES`: optional `countrycodes` filter
/// - `NOMINATIM_RATE_LIMIT_MS`: minimum interval between requests (default: 1500)
/// - `NOMINATIM_CB_THRESHOLD`: circuit breaker failure threshold (default: 3)
/// - `NOMINATIM_CB_RECOVERY_SECS`: circuit breaker recovery time (default: 300)
pub fn create_geocoder() -> Result<Arc<dyn Geocoder>> {
    let backend = std::env::var("GEOCODER_BACKEND").unwrap_or_else(|_| "mock".to_string());
    geocoder_for_backend(&backend)
}

fn geocoder_for_backend(backend: &str) -> Result<Arc<dyn Geocoder>> {
    match backend {
        "mock" => {
            info!("Using MockGeocoder");
            Ok(Arc::new(MockGeocoder::new()))
        }
        "nominatim" => {
            info!("Using RateLimitedNominatimGeocoder");
            Ok(Arc::new(RateLimitedNominatimGeocoder::from_env()?))
        }
        other => {
            warn!("Unknown GEOCODER_BACKEND '{}', using mock", other);
            Ok(Arc::new(MockGeocoder::new()))
        }
    }
}

// ==========================================================================
// GeocodingCoordinator
// ==========================================================================

/// Outcome of one geocoding batch
#[derive(Debug, Clone, Default)]
pub struct GeocodeBatchReport {
    pub resolved: Vec<(GeocodeItem, Coordinates)>,
    /// Not resolved, still eligible for a retry
    pub failed: Vec<GeocodeItem>,
}

impl GeocodeBatchReport {
    pub fn progress(&self) -> GeocodeProgress {
        GeocodeProgress {
            in_progress: false,
            completed_count: self.resolved.len() as u32,
            failed_count: self.failed.len() as u32,
            total_count: (self.resolved.len() + self.failed.len()) as u32,
        }
    }
}

/// Resolves a batch of addresses one at a time and reports aggregate progress
pub struct GeocodingCoordinator {
    geocoder: Arc<dyn Geocoder>,
}

impl GeocodingCoordinator {
    pub fn new(geocoder: Arc<dyn Geocoder>) -> Self {
        Self { geocoder }
    }

    /// Geocode every item. A failed address never aborts the batch.
    ///
    /// Progress is sent once at start, after every item, and a final time
    /// with `in_progress = false`. Counts only ever grow.
    pub async fn run(
        &self,
        items: Vec<GeocodeItem>,
        progress_tx: Option<&mpsc::UnboundedSender<GeocodeProgress>>,
    ) -> GeocodeBatchReport {
        let mut progress = GeocodeProgress::started(items.len() as u32);
        let mut report = GeocodeBatchReport::default();
        emit(progress_tx, progress);

        info!(
            "Geocoding {} addresses with {}",
            items.len(),
            self.geocoder.name()
        );

        for item in items {
            match self.geocoder.geocode(&item.address).await {
                Ok(Some(result)) => {
                    debug!(
                        "Geocoded {} -> {:?} ({})",
                        item.stop_id, result.coordinates, result.display_name
                    );
                    progress.completed_count += 1;
                    report.resolved.push((item, result.coordinates));
                }
                Ok(None) => {
                    warn!("No geocoding match for stop {} ({})", item.stop_id, item.address);
                    progress.failed_count += 1;
                    report.failed.push(item);
                }
                Err(e) => {
                    warn!("Geocoding failed for stop {}: {}", item.stop_id, e);
                    progress.failed_count += 1;
                    report.failed.push(item);
                }
            }
            emit(progress_tx, progress);
        }

        progress.in_progress = false;
        emit(progress_tx, progress);

        info!(
            "Geocoding finished: {} of {} resolved",
            progress.completed_count, progress.total_count
        );
        report
    }
}

fn emit(tx: Option<&mpsc::UnboundedSender<GeocodeProgress>>, progress: GeocodeProgress) {
    if let Some(tx) = tx {
        // Receiver gone means nobody is watching any more
        let _ = tx.send(progress);
    }
}

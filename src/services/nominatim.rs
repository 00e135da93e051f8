//! Nominatim geocoding client

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::services::geo;
use crate::types::Coordinates;

/// Nominatim API response
#[derive(Debug, Deserialize)]
pub struct NominatimResult {
    pub lat: String,
    pub lon: String,
    pub display_name: String,
}

/// A resolved address
#[derive(Debug, Clone, PartialEq)]
pub struct NominatimMatch {
    pub coordinates: Coordinates,
    pub display_name: String,
}

/// Nominatim geocoding client
pub struct NominatimClient {
    base_url: String,
    /// Comma separated ISO codes passed as `countrycodes`, empty for worldwide
    country_codes: String,
    client: reqwest::Client,
}

impl NominatimClient {
    pub fn new(base_url: &str, country_codes: &str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("fieldroute-worker/", env!("CARGO_PKG_VERSION")))
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            country_codes: country_codes.to_string(),
            client,
        })
    }

    fn search_url(&self, address: &str) -> String {
        let mut url = format!(
            "{}/search?q={}&format=json&limit=1",
            self.base_url,
            urlencoding::encode(address)
        );
        if !self.country_codes.is_empty() {
            url.push_str("&countrycodes=");
            url.push_str(&urlencoding::encode(&self.country_codes));
        }
        url
    }

    /// Resolve a free-form address. `Ok(None)` when nothing matched.
    pub async fn search(&self, address: &str) -> Result<Option<NominatimMatch>> {
        let response = self
            .client
            .get(self.search_url(address))
            .send()
            .await
            .context("Failed to send geocoding request")?;

        let status = response.status();
        if status.is_server_error() || status.as_u16() == 429 {
            anyhow::bail!("Nominatim returned {}", status);
        }
        if !status.is_success() {
            return Ok(None);
        }

        let results: Vec<NominatimResult> = response
            .json()
            .await
            .context("Failed to parse geocoding response")?;

        first_match(results)
    }
}

fn first_match(results: Vec<NominatimResult>) -> Result<Option<NominatimMatch>> {
    let Some(result) = results.into_iter().next() else {
        return Ok(None);
    };

    let lat: f64 = result.lat.parse().context("Invalid latitude")?;
    let lng: f64 = result.lon.parse().context("Invalid longitude")?;

    Ok(geo::validate_coordinates(Some(lat), Some(lng)).map(|coordinates| NominatimMatch {
        coordinates,
        display_name: result.display_name,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_search_url_encodes_address() {
        let client = NominatimClient::new("http://localhost:8080/", "cz,sk").unwrap();
        assert_eq!(
            client.search_url("Václavské náměstí 1, Praha"),
            "http://localhost:8080/search?q=V%C3%A1clavsk%C3%A9%20n%C3%A1m%C4%9Bst%C3%AD%201%2C%20Praha&format=json&limit=1&countrycodes=cz%2Csk"
        );
    }

    #[test]
    fn test_search_url_without_country_filter() {
        let client = NominatimClient::new("http://localhost:8080", "").unwrap();
        assert_eq!(
            client.search_url("Main St"),
            "http://localhost:8080/search?q=Main%20St&format=json&limit=1"
        );
    }

    #[test]
    fn test_first_match_parses_strings() {
        let results: Vec<NominatimResult> = serde_json::from_str(
            r#"[{"lat":"50.0810","lon":"14.4280","display_name":"Wenceslas Square"}]"#,
        )
        .unwrap();
        let m = first_match(results).unwrap().unwrap();
        assert_eq!(m.coordinates, Coordinates { lat: 50.081, lng: 14.428 });
        assert_eq!(m.display_name, "Wenceslas Square");
    }

    #[test]
    fn test_first_match_empty_and_invalid() {
        assert!(first_match(vec![]).unwrap().is_none());

        let bad = vec![NominatimResult {
            lat: "north".to_string(),
            lon: "14.0".to_string(),
            display_name: String::new(),
        }];
        assert!(first_match(bad).is_err());

        let null_island = vec![NominatimResult {
            lat: "0".to_string(),
            lon: "0".to_string(),
            display_name: String::new(),
        }];
        assert!(first_match(null_island).unwrap().is_none());
    }

    // Hits the public Nominatim API
    #[tokio::test]
    #[ignore]
    async fn test_search_prague() {
        let client = NominatimClient::new("https://nominatim.openstreetmap.org", "cz").unwrap();
        let result = client.search("Václavské náměstí, 110 00 Praha").await.unwrap().unwrap();
        assert!((result.coordinates.lat - 50.08).abs() < 0.1);
        assert!((result.coordinates.lng - 14.43).abs() < 0.1);
    }
}

//! OpenStreetMap Nominatim search API adapter.
//!
//! Nominatim's usage policy allows one request per second and requires an
//! identifying User-Agent.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info};

use super::Geocoder;
use crate::core::{BiasContext, GeocodeResult};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Configuration for the Nominatim client
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NominatimConfig {
    pub base_url: String,
    pub user_agent: String,
    /// Requests per second
    pub rate_limit: f64,
}

impl Default for NominatimConfig {
    fn default() -> Self {
        Self {
            base_url: "https://nominatim.openstreetmap.org".to_string(),
            user_agent: concat!("scanpipe/", env!("CARGO_PKG_VERSION")).to_string(),
            rate_limit: 1.0,
        }
    }
}

/// One search hit; Nominatim returns coordinates as strings
#[derive(Debug, Deserialize)]
struct SearchHit {
    lat: String,
    lon: String,
    #[serde(default)]
    importance: Option<f64>,
    #[serde(default)]
    display_name: Option<String>,
}

/// Spaces requests at least `interval` apart
struct RateLimiter {
    interval: Duration,
    last: Mutex<Option<Instant>>,
}

impl RateLimiter {
    fn new(per_second: f64) -> Self {
        // Rates too small to express as an interval disable the limiter
        let interval = if per_second > 0.0 {
            Duration::try_from_secs_f64(1.0 / per_second).unwrap_or(Duration::ZERO)
        } else {
            Duration::ZERO
        };
        Self {
            interval,
            last: Mutex::new(None),
        }
    }

    async fn acquire(&self) {
        let mut last = self.last.lock().await;
        if let Some(previous) = *last {
            let ready_at = previous + self.interval;
            if Instant::now() < ready_at {
                tokio::time::sleep_until(ready_at).await;
            }
        }
        *last = Some(Instant::now());
    }
}

/// Nominatim geocoding client
pub struct NominatimGeocoder {
    config: NominatimConfig,
    client: reqwest::Client,
    limiter: RateLimiter,
}

impl NominatimGeocoder {
    pub fn new(config: NominatimConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .user_agent(config.user_agent.clone())
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self {
            limiter: RateLimiter::new(config.rate_limit),
            config,
            client,
        })
    }

    fn search_url(&self) -> String {
        format!("{}/search", self.config.base_url.trim_end_matches('/'))
    }

    /// Query text with the bias appended, most specific first
    fn full_query(query: &str, bias: &BiasContext) -> String {
        let mut parts = vec![query.trim()];
        if let Some(city) = bias.city.as_deref() {
            parts.push(city);
        }
        if let Some(state) = bias.state.as_deref() {
            parts.push(state);
        }
        parts.push(&bias.country);
        parts.join(", ")
    }

    fn parse_hits(hits: Vec<SearchHit>) -> Result<Option<GeocodeResult>> {
        let Some(best) = hits.into_iter().next() else {
            return Ok(None);
        };

        let latitude: f64 = best.lat.parse().context("Invalid latitude in response")?;
        let longitude: f64 = best.lon.parse().context("Invalid longitude in response")?;

        Ok(Some(GeocodeResult {
            latitude: Some(latitude),
            longitude: Some(longitude),
            confidence: Some(best.importance.unwrap_or(0.5).min(1.0)),
            formatted_address: best.display_name,
        }))
    }
}

#[async_trait]
impl Geocoder for NominatimGeocoder {
    fn name(&self) -> &str {
        "nominatim"
    }

    async fn geocode(&self, query: &str, bias: &BiasContext) -> Result<Option<GeocodeResult>> {
        self.limiter.acquire().await;

        let full_query = Self::full_query(query, bias);
        debug!(query = %full_query, "Querying Nominatim");

        let response = self
            .client
            .get(self.search_url())
            .query(&[
                ("q", full_query.as_str()),
                ("format", "json"),
                ("addressdetails", "1"),
                ("limit", "1"),
                ("countrycodes", bias.country.as_str()),
            ])
            .send()
            .await
            .context("Failed to reach Nominatim")?
            .error_for_status()
            .context("Nominatim returned an error status")?;

        let hits: Vec<SearchHit> = response
            .json()
            .await
            .context("Failed to parse Nominatim response")?;

        let result = Self::parse_hits(hits)?;
        if let Some(found) = &result {
            info!(
                query = %query,
                latitude = ?found.latitude,
                longitude = ?found.longitude,
                "Geocoded location"
            );
        }
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_query_appends_bias() {
        let bias = BiasContext::new(Some("Springfield"), Some("IL"));
        assert_eq!(
            NominatimGeocoder::full_query(" 5th and Main ", &bias),
            "5th and Main, Springfield, IL, us"
        );
        assert_eq!(
            NominatimGeocoder::full_query("Main", &BiasContext::default()),
            "Main, us"
        );
    }

    #[test]
    fn test_parse_hits() {
        let hits: Vec<SearchHit> = serde_json::from_str(
            r#"[{"lat": "39.7817", "lon": "-89.6501", "importance": 1.4, "display_name": "Springfield, IL"}]"#,
        )
        .unwrap();

        let result = NominatimGeocoder::parse_hits(hits).unwrap().unwrap();
        assert_eq!(result.latitude, Some(39.7817));
        assert_eq!(result.confidence, Some(1.0));
        assert_eq!(result.formatted_address.as_deref(), Some("Springfield, IL"));

        assert!(NominatimGeocoder::parse_hits(Vec::new()).unwrap().is_none());
    }

    #[test]
    fn test_search_url() {
        let geocoder = NominatimGeocoder::new(NominatimConfig {
            base_url: "http://localhost:8080/".to_string(),
            ..Default::default()
        })
        .unwrap();
        assert_eq!(geocoder.search_url(), "http://localhost:8080/search");
    }

    #[tokio::test]
    async fn test_rate_limiter_spaces_requests() {
        let limiter = RateLimiter::new(1.0);
        let start = Instant::now();

        limiter.acquire().await;
        limiter.acquire().await;

        assert!(Instant::now() - start >= Duration::from_secs(1));
    }

    #[test]
    fn test_rate_limiter_tiny_rate_disables_spacing() {
        assert_eq!(RateLimiter::new(1e-300).interval, Duration::ZERO);
        assert_eq!(RateLimiter::new(0.0).interval, Duration::ZERO);
        assert_eq!(RateLimiter::new(4.0).interval, Duration::from_millis(250));
    }
}

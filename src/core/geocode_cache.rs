//! Content-addressed cache of geocoding results.
//!
//! A hit bumps `hit_count` and `last_hit_at` in the same statement that
//! reads the entry. `expires_at` is only ever set by `store`, so popular
//! entries still age out and pick up upstream corrections. Expired rows are
//! left for the `geocode_cache` retention policy.

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::adapters::Geocoder;
use crate::domain::saturating_add;
use crate::store::{from_millis, to_millis, Database, StoreError};

pub const DEFAULT_TTL_DAYS: i64 = 90;
pub const DEFAULT_COUNTRY: &str = "us";

/// Region a query is resolved in
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BiasContext {
    pub city: Option<String>,
    pub state: Option<String>,
    #[serde(default = "default_country")]
    pub country: String,
}

fn default_country() -> String {
    DEFAULT_COUNTRY.to_string()
}

impl Default for BiasContext {
    fn default() -> Self {
        Self {
            city: None,
            state: None,
            country: default_country(),
        }
    }
}

impl BiasContext {
    pub fn new(city: Option<&str>, state: Option<&str>) -> Self {
        Self {
            city: city.map(str::to_string),
            state: state.map(str::to_string),
            ..Default::default()
        }
    }
}

/// What the external geocoder resolved a query to
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GeocodeResult {
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub confidence: Option<f64>,
    pub formatted_address: Option<String>,
}

impl GeocodeResult {
    pub fn has_coordinates(&self) -> bool {
        self.latitude.is_some() && self.longitude.is_some()
    }
}

/// A stored cache row
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CacheEntry {
    pub key: String,
    pub query_text: String,
    pub bias: BiasContext,
    pub result: GeocodeResult,
    pub hit_count: u64,
    pub last_hit_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CacheLookup {
    Hit(CacheEntry),
    /// Absent or expired; `key` is what `store` will write under
    Miss { key: String },
}

impl CacheLookup {
    pub fn is_hit(&self) -> bool {
        matches!(self, Self::Hit(_))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub live_entries: u64,
    pub expired_entries: u64,
    pub total_hits: u64,
}

/// Trim, lower-case and collapse internal whitespace
pub fn normalize_query(query: &str) -> String {
    query
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// Hex SHA-256 of `"{query}|{city}|{state}|{country}"`, all normalized
pub fn cache_key(query: &str, bias: &BiasContext) -> String {
    let material = format!(
        "{}|{}|{}|{}",
        normalize_query(query),
        bias.city.as_deref().unwrap_or("").trim().to_lowercase(),
        bias.state.as_deref().unwrap_or("").trim().to_lowercase(),
        bias.country.trim().to_lowercase(),
    );
    hex::encode(Sha256::digest(material.as_bytes()))
}

const ENTRY_COLUMNS: &str = "query_hash, query_text, bias_city, bias_state, bias_country, \
    latitude, longitude, confidence, formatted_address, hit_count, last_hit_at, created_at, expires_at";

fn entry_from_row(row: &Row<'_>) -> rusqlite::Result<CacheEntry> {
    Ok(CacheEntry {
        key: row.get(0)?,
        query_text: row.get(1)?,
        bias: BiasContext {
            city: row.get(2)?,
            state: row.get(3)?,
            country: row.get::<_, Option<String>>(4)?.unwrap_or_else(default_country),
        },
        result: GeocodeResult {
            latitude: row.get(5)?,
            longitude: row.get(6)?,
            confidence: row.get(7)?,
            formatted_address: row.get(8)?,
        },
        hit_count: row.get::<_, i64>(9)?.max(0) as u64,
        last_hit_at: row.get::<_, Option<i64>>(10)?.map(from_millis),
        created_at: from_millis(row.get(11)?),
        expires_at: from_millis(row.get(12)?),
    })
}

#[derive(Clone)]
pub struct GeocodeCache {
    db: Database,
    ttl: Duration,
}

impl GeocodeCache {
    pub fn new(db: Database) -> Self {
        Self::with_ttl(db, Duration::days(DEFAULT_TTL_DAYS))
    }

    pub fn with_ttl(db: Database, ttl: Duration) -> Self {
        Self { db, ttl }
    }

    pub fn lookup(&self, query: &str, bias: &BiasContext) -> Result<CacheLookup, StoreError> {
        self.lookup_at(query, bias, Utc::now())
    }

    /// Live entry (`now <= expires_at`) counts a hit; anything else is a miss
    pub fn lookup_at(
        &self,
        query: &str,
        bias: &BiasContext,
        now: DateTime<Utc>,
    ) -> Result<CacheLookup, StoreError> {
        let key = cache_key(query, bias);

        let entry = self.db.with_conn::<_, StoreError, _>(|conn| {
            Ok(conn
                .query_row(
                    &format!(
                        "UPDATE geocode_cache SET hit_count = hit_count + 1, last_hit_at = ?1
                         WHERE query_hash = ?2 AND expires_at >= ?1
                         RETURNING {}",
                        ENTRY_COLUMNS
                    ),
                    params![to_millis(now), key],
                    entry_from_row,
                )
                .optional()?)
        })?;

        Ok(match entry {
            Some(entry) => {
                debug!(key = %entry.key, hit_count = entry.hit_count, "Geocode cache hit");
                CacheLookup::Hit(entry)
            }
            None => {
                debug!(key = %key, "Geocode cache miss");
                CacheLookup::Miss { key }
            }
        })
    }

    pub fn store(
        &self,
        query: &str,
        bias: &BiasContext,
        result: &GeocodeResult,
    ) -> Result<CacheEntry, StoreError> {
        self.store_at(query, bias, result, Utc::now())
    }

    /// Upsert; an existing entry gets the new result and a fresh expiry
    pub fn store_at(
        &self,
        query: &str,
        bias: &BiasContext,
        result: &GeocodeResult,
        now: DateTime<Utc>,
    ) -> Result<CacheEntry, StoreError> {
        let key = cache_key(query, bias);
        let expires_at = saturating_add(now, self.ttl);

        self.db.with_conn(|conn| {
            let entry = conn.query_row(
                &format!(
                    "INSERT INTO geocode_cache (
                        query_hash, query_text, bias_city, bias_state, bias_country,
                        latitude, longitude, confidence, formatted_address,
                        hit_count, last_hit_at, created_at, expires_at
                     ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, 0, NULL, ?10, ?11)
                     ON CONFLICT(query_hash) DO UPDATE SET
                        latitude = excluded.latitude,
                        longitude = excluded.longitude,
                        confidence = excluded.confidence,
                        formatted_address = excluded.formatted_address,
                        expires_at = excluded.expires_at
                     RETURNING {}",
                    ENTRY_COLUMNS
                ),
                params![
                    key,
                    query.trim(),
                    bias.city,
                    bias.state,
                    bias.country,
                    result.latitude,
                    result.longitude,
                    result.confidence,
                    result.formatted_address,
                    to_millis(now),
                    to_millis(expires_at),
                ],
                entry_from_row,
            )?;
            Ok(entry)
        })
    }

    pub fn stats(&self) -> Result<CacheStats, StoreError> {
        self.stats_at(Utc::now())
    }

    pub fn stats_at(&self, now: DateTime<Utc>) -> Result<CacheStats, StoreError> {
        self.db.with_conn(|conn| {
            let (live, expired, hits): (i64, i64, i64) = conn.query_row(
                "SELECT
                    COALESCE(SUM(CASE WHEN expires_at >= ?1 THEN 1 ELSE 0 END), 0),
                    COALESCE(SUM(CASE WHEN expires_at < ?1 THEN 1 ELSE 0 END), 0),
                    COALESCE(SUM(hit_count), 0)
                 FROM geocode_cache",
                [to_millis(now)],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )?;
            Ok(CacheStats {
                live_entries: live as u64,
                expired_entries: expired as u64,
                total_hits: hits as u64,
            })
        })
    }
}

/// Result of a cache-fronted resolve
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Resolved {
    pub result: Option<GeocodeResult>,
    pub cached: bool,
}

/// Cache in front of an external geocoder.
///
/// The database is never locked while the geocoder is working.
pub struct CachedGeocoder<G: Geocoder> {
    cache: GeocodeCache,
    geocoder: G,
}

impl<G: Geocoder> CachedGeocoder<G> {
    pub fn new(cache: GeocodeCache, geocoder: G) -> Self {
        Self { cache, geocoder }
    }

    pub async fn resolve(&self, query: &str, bias: &BiasContext) -> Result<Resolved> {
        let cache = self.cache.clone();
        let (q, b) = (query.to_string(), bias.clone());
        let lookup = tokio::task::spawn_blocking(move || cache.lookup(&q, &b))
            .await
            .context("Geocode cache lookup task failed")?
            .context("Geocode cache lookup failed")?;

        if let CacheLookup::Hit(entry) = lookup {
            return Ok(Resolved {
                result: Some(entry.result),
                cached: true,
            });
        }

        let result = self
            .geocoder
            .geocode(query, bias)
            .await
            .with_context(|| format!("{} failed to geocode {:?}", self.geocoder.name(), query))?;

        if let Some(found) = result.as_ref().filter(|r| r.has_coordinates()) {
            let cache = self.cache.clone();
            let (q, b, r) = (query.to_string(), bias.clone(), found.clone());
            tokio::task::spawn_blocking(move || cache.store(&q, &b, &r))
                .await
                .context("Geocode cache store task failed")?
                .context("Geocode cache store failed")?;
        }

        Ok(Resolved {
            result,
            cached: false,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::TimeZone;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_normalize_and_key() {
        assert_eq!(normalize_query("  123   Main\tSt "), "123 main st");

        let bias = BiasContext::new(Some("Springfield"), Some("IL"));
        assert_eq!(
            cache_key("123 Main St", &bias),
            cache_key(" 123  MAIN st", &BiasContext::new(Some("springfield"), Some("il")))
        );
        assert_ne!(cache_key("123 Main St", &bias), cache_key("123 Main St", &BiasContext::default()));
        assert_eq!(cache_key("x", &bias).len(), 64);
    }

    #[test]
    fn test_store_overwrites_and_extends() {
        let cache = GeocodeCache::new(Database::open_in_memory().unwrap());
        let bias = BiasContext::default();
        let t0 = Utc.with_ymd_and_hms(2026, 10, 1, 0, 0, 0).unwrap();

        let first = GeocodeResult {
            latitude: Some(1.0),
            longitude: Some(2.0),
            ..Default::default()
        };
        cache.store_at("Elm St", &bias, &first, t0).unwrap();
        cache.lookup_at("Elm St", &bias, t0).unwrap();

        let second = GeocodeResult {
            latitude: Some(3.0),
            longitude: Some(4.0),
            ..Default::default()
        };
        let entry = cache
            .store_at("elm st", &bias, &second, t0 + Duration::days(10))
            .unwrap();

        assert_eq!(entry.result.latitude, Some(3.0));
        assert_eq!(entry.expires_at, t0 + Duration::days(100));
        assert_eq!(entry.hit_count, 1);
    }

    #[test]
    fn test_stats() {
        let cache = GeocodeCache::with_ttl(Database::open_in_memory().unwrap(), Duration::days(1));
        let bias = BiasContext::default();
        let t0 = Utc.with_ymd_and_hms(2026, 10, 1, 0, 0, 0).unwrap();

        cache.store_at("a", &bias, &GeocodeResult::default(), t0).unwrap();
        cache
            .store_at("b", &bias, &GeocodeResult::default(), t0 + Duration::days(5))
            .unwrap();
        cache.lookup_at("b", &bias, t0 + Duration::days(5)).unwrap();

        let stats = cache.stats_at(t0 + Duration::days(5)).unwrap();
        assert_eq!(
            stats,
            CacheStats {
                live_entries: 1,
                expired_entries: 1,
                total_hits: 1
            }
        );
    }

    struct CountingGeocoder {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Geocoder for CountingGeocoder {
        fn name(&self) -> &str {
            "counting"
        }

        async fn geocode(&self, _query: &str, _bias: &BiasContext) -> Result<Option<GeocodeResult>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(Some(GeocodeResult {
                latitude: Some(39.78),
                longitude: Some(-89.65),
                confidence: Some(0.6),
                formatted_address: Some("Main St, Springfield".to_string()),
            }))
        }
    }

    #[tokio::test]
    async fn test_cached_geocoder_calls_out_once() {
        let cache = GeocodeCache::new(Database::open_in_memory().unwrap());
        let geocoder = CachedGeocoder::new(
            cache,
            CountingGeocoder {
                calls: AtomicUsize::new(0),
            },
        );
        let bias = BiasContext::new(Some("Springfield"), Some("IL"));

        let first = geocoder.resolve("Main St", &bias).await.unwrap();
        let second = geocoder.resolve("main  st", &bias).await.unwrap();

        assert!(!first.cached);
        assert!(second.cached);
        assert_eq!(first.result, second.result);
        assert_eq!(geocoder.geocoder.calls.load(Ordering::SeqCst), 1);
    }
}

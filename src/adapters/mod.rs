//! Adapter interfaces for external systems.
//!
//! Adapters wrap slow external services. They are always called outside any
//! database transaction.

pub mod nominatim;

use anyhow::Result;
use async_trait::async_trait;

use crate::core::{BiasContext, GeocodeResult};

pub use nominatim::{NominatimConfig, NominatimGeocoder};

/// Trait for external geocoding services
#[async_trait]
pub trait Geocoder: Send + Sync {
    /// Human-readable adapter name
    fn name(&self) -> &str;

    /// Resolve free text to a location; `Ok(None)` when nothing matched
    async fn geocode(&self, query: &str, bias: &BiasContext) -> Result<Option<GeocodeResult>>;
}

//! Core pipeline logic.
//!
//! This module contains:
//! - StateMachine: validated status transitions with an audit log
//! - RecordStore: time-partitioned call records and record-level stages
//! - PartitionManager: idempotent partition creation and upkeep
//! - Reclaimer: stuck, exhausted and stalled work recovery
//! - RetentionEngine: per-table cleanup with partition drops
//! - GeocodeCache: TTL cache in front of an external geocoder
//! - LocationExtractor: place mentions in transcript text
//! - StageRunner, Monitor, MaintenanceScheduler: workers and operations

pub mod geocode_cache;
pub mod location_extractor;
pub mod monitor;
pub mod partitions;
pub mod reclaimer;
pub mod record_store;
pub mod retention;
pub mod retry;
pub mod scheduler;
pub mod state_machine;
pub mod worker;

// Re-export commonly used types
pub use geocode_cache::{
    cache_key, normalize_query, BiasContext, CacheEntry, CacheLookup, CacheStats, CachedGeocoder,
    GeocodeCache, GeocodeResult, Resolved,
};
pub use location_extractor::{
    ExtractedLocation, GeocodedLocation, LocationExtractor, LocationKind, LocationMention,
    DEFAULT_CONTEXT_WINDOW,
};
pub use monitor::{ErrorPattern, Monitor, MonitorError, PartitionHealth, PipelineStats};
pub use partitions::{
    lookahead_horizon, EnsurePartition, EnsuredPartition, MaintenanceReport, PartitionError,
    PartitionManager,
};
pub use reclaimer::{ReclaimError, Reclaimer, StuckItem, StuckReason};
pub use record_store::{RecordStore, RecordStoreError};
pub use retention::{RetentionEngine, RetentionError};
pub use retry::Backoff;
pub use scheduler::{Job, MaintenanceScheduler, SchedulerHandle, SchedulerSettings};
pub use state_machine::{AdvanceError, AppliedTransition, StateMachine};
pub use worker::{StageHandler, StageReport, StageRunner};

//! scanpipe - Partitioned call store and processing pipeline
//!
//! The storage and coordination core of a radio scanner ingestion pipeline:
//! calls are fetched from a feed, downloaded, transcribed and indexed by
//! independent workers that coordinate only through one SQLite database.
//!
//! # Architecture
//!
//! - Every record has a processing state moved only by validated transitions
//! - Retries are bounded; exhausted records wait for a resurrection cooldown
//! - Time-series tables are split into period partitions created on demand
//! - Retention drops fully expired partitions instead of deleting row by row
//!
//! # Modules
//!
//! - `adapters`: External services (Nominatim geocoding)
//! - `core`: State machine, record store, partitions, reclaimer, retention
//! - `domain`: Data structures (Status, Record, Partition, RetentionPolicy)
//! - `store`: SQLite connection, schema and table catalog
//! - `cli`: Command-line interface
//!
//! # Usage
//!
//! ```bash
//! # Create the database and current partitions
//! scanpipe init
//!
//! # Ingest calls from the feed
//! scanpipe ingest --input calls.json
//!
//! # Run periodic maintenance
//! scanpipe run
//! ```

pub mod adapters;
pub mod cli;
pub mod config;
pub mod core;
pub mod domain;
pub mod store;

// Re-export main types at crate root for convenience
pub use core::{
    Backoff, GeocodeCache, MaintenanceScheduler, Monitor, PartitionManager, Reclaimer, RecordStore,
    RetentionEngine, StateMachine,
};
pub use domain::{NewRecord, ProcessingState, Record, RetentionPolicy, Status};
pub use store::Database;

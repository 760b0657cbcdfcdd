//! Domain types for the scanner pipeline.
//!
//! This module contains the core data structures:
//! - Record: an ingested call and its record-level stage
//! - State: pipeline status, transition rules, retry accounting
//! - Partition: time periods, bounds and partition naming
//! - Retention: per-table retention policies and cleanup reports

pub mod partition;
pub mod record;
pub mod retention;
pub mod state;

// Re-export commonly used types
pub use partition::{
    partition_name, saturating_add, saturating_sub, EnsureOutcome, Partition, PartitionBounds,
    PeriodKind,
};
pub use record::{
    ApiCallMetric, InsertOutcome, NewRecord, ProcessingStage, Record, RecordError, SystemLogEntry,
};
pub use retention::{CleanupReport, PolicyOutcome, RetentionPolicy};
pub use state::{
    validate, InvalidTransition, ProcessingState, Status, Transition, TransitionRecord,
    DEFAULT_MAX_RETRIES,
};

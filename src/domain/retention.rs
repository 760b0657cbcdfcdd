//! Retention policy and cleanup report types.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use super::partition::saturating_sub;

/// How long rows of one table are kept
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetentionPolicy {
    pub table_name: String,
    pub retention_days: u32,
    pub partition_column: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub last_cleanup_at: Option<DateTime<Utc>>,
}

fn default_enabled() -> bool {
    true
}

impl RetentionPolicy {
    pub fn new(table_name: &str, retention_days: u32, partition_column: &str) -> Self {
        Self {
            table_name: table_name.to_string(),
            retention_days,
            partition_column: partition_column.to_string(),
            enabled: true,
            last_cleanup_at: None,
        }
    }

    /// Rows with `partition_column` strictly before this instant are expired.
    /// A window reaching past the calendar keeps everything.
    pub fn cutoff(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        saturating_sub(now, Duration::days(i64::from(self.retention_days)))
    }
}

/// What one policy's cleanup did
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyOutcome {
    pub table_name: String,
    pub cutoff: DateTime<Utc>,
    pub rows_deleted: u64,
    pub partitions_dropped: Vec<String>,
    pub duration_ms: u64,
    /// Set when the policy failed; its transaction was rolled back
    pub error: Option<String>,
}

impl PolicyOutcome {
    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }
}

/// Result of one `cleanup` pass over all enabled policies
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CleanupReport {
    pub outcomes: Vec<PolicyOutcome>,
}

impl CleanupReport {
    pub fn total_rows_deleted(&self) -> u64 {
        self.outcomes.iter().map(|o| o.rows_deleted).sum()
    }

    pub fn failures(&self) -> impl Iterator<Item = &PolicyOutcome> {
        self.outcomes.iter().filter(|o| !o.succeeded())
    }

    pub fn outcome(&self, table: &str) -> Option<&PolicyOutcome> {
        self.outcomes.iter().find(|o| o.table_name == table)
    }
}

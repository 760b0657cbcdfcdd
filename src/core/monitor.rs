//! Read-only pipeline statistics.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use rusqlite::params;
use serde::Serialize;
use thiserror::Error;
use tracing::instrument;

use crate::core::geocode_cache::{CacheStats, GeocodeCache};
use crate::core::partitions::{lookahead_horizon, PartitionError, PartitionManager};
use crate::core::reclaimer::{ReclaimError, Reclaimer, StuckItem};
use crate::domain::Status;
use crate::store::{Database, StoreError, PARTITIONED_TABLES};

/// Error prefixes are grouped on this many characters
const ERROR_PREFIX_LEN: usize = 100;
const TOP_ERROR_PATTERNS: usize = 10;

#[derive(Debug, Error)]
pub enum MonitorError {
    #[error(transparent)]
    Partition(#[from] PartitionError),

    #[error(transparent)]
    Reclaim(#[from] ReclaimError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PartitionHealth {
    pub table: String,
    pub partition_count: usize,
    /// Some partition contains the current instant
    pub covers_now: bool,
    /// Some partition contains the maintenance horizon
    pub lookahead_ok: bool,
    /// End of the latest partition
    pub covered_until: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorPattern {
    pub prefix: String,
    pub count: u64,
}

/// Snapshot of pipeline health
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PipelineStats {
    pub collected_at: DateTime<Utc>,
    pub status_counts: BTreeMap<Status, u64>,
    pub oldest_stuck: Option<StuckItem>,
    pub partitions: Vec<PartitionHealth>,
    pub error_patterns: Vec<ErrorPattern>,
    pub geocode_cache: CacheStats,
}

impl PipelineStats {
    pub fn total_records(&self) -> u64 {
        self.status_counts.values().sum()
    }

    /// Tables missing the current or a look-ahead partition
    pub fn unhealthy_tables(&self) -> impl Iterator<Item = &PartitionHealth> {
        self.partitions
            .iter()
            .filter(|p| !p.covers_now || !p.lookahead_ok)
    }
}

#[derive(Clone)]
pub struct Monitor {
    db: Database,
    partitions: PartitionManager,
    reclaimer: Reclaimer,
    cache: GeocodeCache,
    stuck_after_hours: u32,
}

impl Monitor {
    pub fn new(db: Database, stuck_after_hours: u32) -> Self {
        Self {
            partitions: PartitionManager::new(db.clone()),
            reclaimer: Reclaimer::new(db.clone()),
            cache: GeocodeCache::new(db.clone()),
            db,
            stuck_after_hours,
        }
    }

    pub fn collect(&self) -> Result<PipelineStats, MonitorError> {
        self.collect_at(Utc::now())
    }

    #[instrument(skip(self))]
    pub fn collect_at(&self, now: DateTime<Utc>) -> Result<PipelineStats, MonitorError> {
        let status_counts = self.status_counts()?;
        let oldest_stuck = self
            .reclaimer
            .find_stuck_at(self.stuck_after_hours, now)?
            .into_iter()
            .max_by_key(|item| item.age_seconds);

        let mut partitions = Vec::with_capacity(PARTITIONED_TABLES.len());
        for table in PARTITIONED_TABLES {
            let registered = self.partitions.list_partitions(table.name)?;
            let horizon = lookahead_horizon(table, now);
            partitions.push(PartitionHealth {
                table: table.name.to_string(),
                partition_count: registered.len(),
                covers_now: registered.iter().any(|p| p.bounds.contains(now)),
                lookahead_ok: registered.iter().any(|p| p.bounds.contains(horizon)),
                covered_until: registered.iter().map(|p| p.bounds.end).max(),
            });
        }

        Ok(PipelineStats {
            collected_at: now,
            status_counts,
            oldest_stuck,
            partitions,
            error_patterns: self.error_patterns()?,
            geocode_cache: self.cache.stats_at(now)?,
        })
    }

    fn status_counts(&self) -> Result<BTreeMap<Status, u64>, StoreError> {
        let mut counts: BTreeMap<Status, u64> = Status::ALL.iter().map(|s| (*s, 0)).collect();

        let rows = self.db.with_conn::<_, StoreError, _>(|conn| {
            let mut stmt =
                conn.prepare("SELECT status, COUNT(*) FROM processing_state GROUP BY status")?;
            let rows = stmt.query_map([], |row| Ok((row.get::<_, Status>(0)?, row.get::<_, i64>(1)?)))?;
            Ok(rows.collect::<Result<Vec<_>, _>>()?)
        })?;

        for (status, count) in rows {
            counts.insert(status, count.max(0) as u64);
        }
        Ok(counts)
    }

    fn error_patterns(&self) -> Result<Vec<ErrorPattern>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT substr(last_error, 1, ?1) AS prefix, COUNT(*) AS n
                 FROM processing_state
                 WHERE status = ?2 AND last_error IS NOT NULL
                 GROUP BY prefix
                 ORDER BY n DESC, prefix
                 LIMIT ?3",
            )?;
            let rows = stmt.query_map(
                params![ERROR_PREFIX_LEN as i64, Status::Error, TOP_ERROR_PATTERNS as i64],
                |row| {
                    Ok(ErrorPattern {
                        prefix: row.get(0)?,
                        count: row.get::<_, i64>(1)?.max(0) as u64,
                    })
                },
            )?;
            Ok(rows.collect::<Result<Vec<_>, _>>()?)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{RecordStore, StateMachine};
    use crate::domain::NewRecord;
    use chrono::TimeZone;

    #[test]
    fn test_collect_counts_and_errors() {
        let db = Database::open_in_memory().unwrap();
        let now = Utc.with_ymd_and_hms(2026, 10, 18, 12, 0, 0).unwrap();
        let records = RecordStore::new(db.clone());
        let machine = StateMachine::new(db.clone());

        for uid in ["g-1", "g-2", "g-3"] {
            records
                .insert_record_at(&NewRecord::new(uid, now, "https://example.org/a.m4a"), now)
                .unwrap();
        }
        machine
            .advance_at("g-1", Status::Error, Some("HTTP 404 Not Found"), now)
            .unwrap();
        machine
            .advance_at("g-2", Status::Error, Some("HTTP 404 Not Found"), now)
            .unwrap();

        let stats = Monitor::new(db, 24).collect_at(now).unwrap();

        assert_eq!(stats.status_counts[&Status::Queued], 1);
        assert_eq!(stats.status_counts[&Status::Error], 2);
        assert_eq!(stats.status_counts[&Status::Indexed], 0);
        assert_eq!(stats.total_records(), 3);
        assert_eq!(
            stats.error_patterns,
            vec![ErrorPattern {
                prefix: "HTTP 404 Not Found".to_string(),
                count: 2
            }]
        );
        assert!(stats.oldest_stuck.is_none());
    }

    #[test]
    fn test_partition_health() {
        let db = Database::open_in_memory().unwrap();
        let now = Utc.with_ymd_and_hms(2026, 10, 18, 12, 0, 0).unwrap();
        let monitor = Monitor::new(db.clone(), 24);

        let before = monitor.collect_at(now).unwrap();
        assert_eq!(before.unhealthy_tables().count(), PARTITIONED_TABLES.len());

        PartitionManager::new(db).maintain_partitions_at(now).unwrap();
        let after = monitor.collect_at(now).unwrap();
        assert_eq!(after.unhealthy_tables().count(), 0);

        let calls = after.partitions.iter().find(|p| p.table == "calls").unwrap();
        assert_eq!(calls.partition_count, 2);
        assert_eq!(
            calls.covered_until,
            Some(Utc.with_ymd_and_hms(2026, 12, 1, 0, 0, 0).unwrap())
        );

        let json = serde_json::to_value(&after).unwrap();
        assert_eq!(json["status_counts"]["queued"], 0);
    }
}

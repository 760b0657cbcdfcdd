//! Policy-driven deletion of aged rows.
//!
//! Each policy runs in its own immediate transaction. For partitioned tables
//! whose policy column is the partition column, partitions that end at or
//! before the cutoff are dropped whole; the partition straddling the cutoff
//! gets a row delete.

use std::time::Instant;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Transaction, TransactionBehavior};
use thiserror::Error;
use tracing::{error, info, warn};

use crate::domain::{CleanupReport, PolicyOutcome, RetentionPolicy};
use crate::store::schema::{is_valid_identifier, partitioned_table, plain_table, PartitionedTable};
use crate::store::{from_millis, quote_identifier, to_millis, Database, StoreError};

#[derive(Debug, Error)]
pub enum RetentionError {
    #[error("Table {0} is not eligible for retention")]
    UnknownTable(String),

    #[error("Table {table} has no time column {column}")]
    UnknownColumn { table: String, column: String },

    #[error("No retention policy for table {0}")]
    PolicyNotFound(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl From<rusqlite::Error> for RetentionError {
    fn from(err: rusqlite::Error) -> Self {
        Self::Store(StoreError::from(err))
    }
}

/// Where a policy's rows live
#[derive(Debug, Clone, Copy)]
enum Target {
    Partitioned(&'static PartitionedTable),
    Plain(&'static str),
}

fn resolve_target(policy: &RetentionPolicy) -> Result<Target, RetentionError> {
    for name in [&policy.table_name, &policy.partition_column] {
        if !is_valid_identifier(name) {
            return Err(StoreError::InvalidIdentifier(name.clone()).into());
        }
    }

    let unknown_column = || RetentionError::UnknownColumn {
        table: policy.table_name.clone(),
        column: policy.partition_column.clone(),
    };

    if let Some(table) = partitioned_table(&policy.table_name) {
        if !table.has_column(&policy.partition_column) {
            return Err(unknown_column());
        }
        return Ok(Target::Partitioned(table));
    }

    let (name, columns) = plain_table(&policy.table_name)
        .ok_or_else(|| RetentionError::UnknownTable(policy.table_name.clone()))?;
    if !columns.contains(&policy.partition_column.as_str()) {
        return Err(unknown_column());
    }
    Ok(Target::Plain(name))
}

fn policy_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RetentionPolicy> {
    Ok(RetentionPolicy {
        table_name: row.get(0)?,
        retention_days: row.get(1)?,
        partition_column: row.get(2)?,
        enabled: row.get(3)?,
        last_cleanup_at: row.get::<_, Option<i64>>(4)?.map(from_millis),
    })
}

const POLICY_COLUMNS: &str = "table_name, retention_days, partition_column, enabled, last_cleanup_at";

/// Rows deleted and partitions dropped by one policy
#[derive(Debug, Default)]
struct Applied {
    rows_deleted: u64,
    partitions_dropped: Vec<String>,
}

#[derive(Clone)]
pub struct RetentionEngine {
    db: Database,
}

impl RetentionEngine {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub fn policies(&self) -> Result<Vec<RetentionPolicy>, RetentionError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM retention_policies ORDER BY table_name",
                POLICY_COLUMNS
            ))?;
            let rows = stmt.query_map([], policy_from_row)?;
            Ok(rows.collect::<Result<Vec<_>, _>>()?)
        })
    }

    pub fn policy(&self, table: &str) -> Result<Option<RetentionPolicy>, RetentionError> {
        self.db.with_conn(|conn| {
            let policy = conn
                .query_row(
                    &format!("SELECT {} FROM retention_policies WHERE table_name = ?1", POLICY_COLUMNS),
                    [table],
                    policy_from_row,
                )
                .optional()?;
            Ok(policy)
        })
    }

    /// Create or replace a policy; `last_cleanup_at` is kept
    pub fn upsert_policy(&self, policy: &RetentionPolicy) -> Result<(), RetentionError> {
        resolve_target(policy)?;
        self.db.with_conn::<_, RetentionError, _>(|conn| {
            conn.execute(
                "INSERT INTO retention_policies (table_name, retention_days, partition_column, enabled)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(table_name) DO UPDATE SET
                    retention_days = excluded.retention_days,
                    partition_column = excluded.partition_column,
                    enabled = excluded.enabled",
                params![
                    policy.table_name,
                    policy.retention_days,
                    policy.partition_column,
                    policy.enabled
                ],
            )?;
            Ok(())
        })?;
        info!(table = %policy.table_name, days = policy.retention_days, "Saved retention policy");
        Ok(())
    }

    /// Insert policies for tables that have none yet; returns how many were added
    pub fn seed_policies(&self, defaults: &[RetentionPolicy]) -> Result<usize, RetentionError> {
        for policy in defaults {
            resolve_target(policy)?;
        }
        self.db.with_conn(|conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let mut added = 0;
            for policy in defaults {
                added += tx.execute(
                    "INSERT OR IGNORE INTO retention_policies
                        (table_name, retention_days, partition_column, enabled)
                     VALUES (?1, ?2, ?3, ?4)",
                    params![
                        policy.table_name,
                        policy.retention_days,
                        policy.partition_column,
                        policy.enabled
                    ],
                )?;
            }
            tx.commit()?;
            Ok(added)
        })
    }

    pub fn set_enabled(&self, table: &str, enabled: bool) -> Result<(), RetentionError> {
        let updated = self.db.with_conn::<_, RetentionError, _>(|conn| {
            Ok(conn.execute(
                "UPDATE retention_policies SET enabled = ?1 WHERE table_name = ?2",
                params![enabled, table],
            )?)
        })?;
        if updated == 0 {
            return Err(RetentionError::PolicyNotFound(table.to_string()));
        }
        Ok(())
    }

    pub fn cleanup(&self) -> Result<CleanupReport, RetentionError> {
        self.cleanup_at(Utc::now())
    }

    /// Apply every enabled policy; one policy failing does not stop the rest
    pub fn cleanup_at(&self, now: DateTime<Utc>) -> Result<CleanupReport, RetentionError> {
        let policies = self.policies()?;
        let mut report = CleanupReport::default();

        for policy in policies.into_iter().filter(|p| p.enabled) {
            let cutoff = policy.cutoff(now);
            let started = Instant::now();
            let result = self.apply_policy(&policy, cutoff, now);
            let duration_ms = started.elapsed().as_millis() as u64;

            let outcome = match result {
                Ok(applied) => {
                    info!(
                        table = %policy.table_name,
                        rows_deleted = applied.rows_deleted,
                        partitions_dropped = applied.partitions_dropped.len(),
                        duration_ms,
                        "Retention cleanup finished"
                    );
                    PolicyOutcome {
                        table_name: policy.table_name.clone(),
                        cutoff,
                        rows_deleted: applied.rows_deleted,
                        partitions_dropped: applied.partitions_dropped,
                        duration_ms,
                        error: None,
                    }
                }
                Err(err) => {
                    error!(table = %policy.table_name, error = %err, "Retention cleanup failed");
                    PolicyOutcome {
                        table_name: policy.table_name.clone(),
                        cutoff,
                        rows_deleted: 0,
                        partitions_dropped: Vec::new(),
                        duration_ms,
                        error: Some(err.to_string()),
                    }
                }
            };
            report.outcomes.push(outcome);
        }

        Ok(report)
    }

    fn apply_policy(
        &self,
        policy: &RetentionPolicy,
        cutoff: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Applied, RetentionError> {
        let target = resolve_target(policy)?;
        let column = quote_identifier(&policy.partition_column)?;
        let cutoff_ms = to_millis(cutoff);

        self.db.with_conn(|conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

            let applied = match target {
                Target::Plain(table) => {
                    let deleted = tx.execute(
                        &format!("DELETE FROM {} WHERE {} < ?1", quote_identifier(table)?, column),
                        [cutoff_ms],
                    )?;
                    Applied {
                        rows_deleted: deleted as u64,
                        ..Default::default()
                    }
                }
                Target::Partitioned(table) => {
                    let by_partition_column = policy.partition_column == table.partition_column;
                    prune_partitions(&tx, table, &column, cutoff_ms, by_partition_column)?
                }
            };

            tx.execute(
                "UPDATE retention_policies SET last_cleanup_at = ?1 WHERE table_name = ?2",
                params![to_millis(now), policy.table_name],
            )?;
            tx.commit()?;
            Ok(applied)
        })
    }
}

fn prune_partitions(
    tx: &Transaction<'_>,
    table: &'static PartitionedTable,
    column: &str,
    cutoff_ms: i64,
    by_partition_column: bool,
) -> Result<Applied, RetentionError> {
    let partitions: Vec<(String, i64, i64)> = {
        let mut stmt = tx.prepare(
            "SELECT name, period_start, period_end FROM partitions
             WHERE parent_table = ?1 ORDER BY period_start",
        )?;
        let rows = stmt.query_map([table.name], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))?;
        rows.collect::<Result<Vec<_>, _>>()?
    };

    let mut applied = Applied::default();
    for (name, start, end) in partitions {
        let partition = quote_identifier(&name)?;

        if by_partition_column && end <= cutoff_ms {
            // Fast path: everything in here is past retention
            delete_dependents(tx, table, &partition, None)?;
            let rows: i64 = tx.query_row(&format!("SELECT COUNT(*) FROM {}", partition), [], |r| r.get(0))?;
            tx.execute_batch(&format!("DROP TABLE IF EXISTS {}", partition))?;
            tx.execute("DELETE FROM partitions WHERE name = ?1", [&name])?;
            applied.rows_deleted += rows as u64;
            applied.partitions_dropped.push(name);
            continue;
        }

        if by_partition_column && start >= cutoff_ms {
            continue;
        }

        let filter = format!("{} < {}", column, cutoff_ms);
        delete_dependents(tx, table, &partition, Some(&filter))?;
        let deleted = tx.execute(&format!("DELETE FROM {} WHERE {}", partition, filter), [])?;
        applied.rows_deleted += deleted as u64;
    }

    if !applied.partitions_dropped.is_empty() {
        warn!(table = table.name, dropped = ?applied.partitions_dropped, "Dropped aged partitions");
    }
    Ok(applied)
}

/// Remove rows in dependent tables whose key is about to disappear
fn delete_dependents(
    conn: &Connection,
    table: &PartitionedTable,
    partition: &str,
    filter: Option<&str>,
) -> Result<(), RetentionError> {
    let key = quote_identifier(table.key_column)?;
    for (dependent, column) in table.dependents {
        let selection = match filter {
            Some(filter) => format!("SELECT {} FROM {} WHERE {}", key, partition, filter),
            None => format!("SELECT {} FROM {}", key, partition),
        };
        conn.execute(
            &format!(
                "DELETE FROM {} WHERE {} IN ({})",
                quote_identifier(dependent)?,
                quote_identifier(column)?,
                selection
            ),
            [],
        )?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_policy_validation() {
        let engine = RetentionEngine::new(Database::open_in_memory().unwrap());

        engine
            .upsert_policy(&RetentionPolicy::new("calls", 30, "started_at"))
            .unwrap();
        engine
            .upsert_policy(&RetentionPolicy::new("geocode_cache", 0, "expires_at"))
            .unwrap();

        assert!(matches!(
            engine.upsert_policy(&RetentionPolicy::new("users", 30, "created_at")),
            Err(RetentionError::UnknownTable(_))
        ));
        assert!(matches!(
            engine.upsert_policy(&RetentionPolicy::new("calls", 30, "recorded_at")),
            Err(RetentionError::UnknownColumn { .. })
        ));
        assert!(matches!(
            engine.upsert_policy(&RetentionPolicy::new("calls; DROP TABLE x", 30, "started_at")),
            Err(RetentionError::Store(StoreError::InvalidIdentifier(_)))
        ));
    }

    #[test]
    fn test_seed_does_not_overwrite() {
        let engine = RetentionEngine::new(Database::open_in_memory().unwrap());
        engine
            .upsert_policy(&RetentionPolicy::new("system_logs", 3, "logged_at"))
            .unwrap();

        let added = engine
            .seed_policies(&[
                RetentionPolicy::new("system_logs", 14, "logged_at"),
                RetentionPolicy::new("state_transitions", 30, "at"),
            ])
            .unwrap();
        assert_eq!(added, 1);
        assert_eq!(engine.policy("system_logs").unwrap().unwrap().retention_days, 3);
    }

    #[test]
    fn test_set_enabled() {
        let engine = RetentionEngine::new(Database::open_in_memory().unwrap());
        engine
            .upsert_policy(&RetentionPolicy::new("system_logs", 3, "logged_at"))
            .unwrap();

        engine.set_enabled("system_logs", false).unwrap();
        assert!(!engine.policy("system_logs").unwrap().unwrap().enabled);
        assert!(engine.cleanup().unwrap().outcomes.is_empty());

        assert!(matches!(
            engine.set_enabled("calls", true),
            Err(RetentionError::PolicyNotFound(_))
        ));
    }
}

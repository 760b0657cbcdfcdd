//! Partition manager: keeps time-bounded segments ahead of the data.
//!
//! Creation is idempotent. Racing creators all succeed; the registry insert
//! decides which one reports `Created`.

use chrono::{DateTime, Utc};
use rusqlite::{params, TransactionBehavior};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, instrument};

use crate::domain::{partition_name, EnsureOutcome, Partition, PartitionBounds, PeriodKind};
use crate::store::schema::{partitioned_table, PartitionDdl, PartitionedTable, PARTITIONED_TABLES};
use crate::store::{from_millis, to_millis, Database, StoreError};

/// Partition manager errors
#[derive(Debug, Error)]
pub enum PartitionError {
    #[error("Table {0} is not a partitioned table")]
    UnknownTable(String),

    #[error("Table {table} is partitioned by {expected}, not {requested}")]
    PeriodMismatch {
        table: String,
        expected: PeriodKind,
        requested: PeriodKind,
    },

    #[error("Invalid range: start {start} is after end {end}")]
    InvalidRange {
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    },

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Storage operations the manager needs
pub trait EnsurePartition {
    /// Create the partition of `table` covering `bounds` unless it exists
    fn create_partition(
        &self,
        table: &'static PartitionedTable,
        bounds: &PartitionBounds,
    ) -> Result<EnsureOutcome, StoreError>;

    /// Registered partitions of `table`, ordered by period start
    fn list_partitions(&self, table: &str) -> Result<Vec<Partition>, StoreError>;
}

impl EnsurePartition for Database {
    fn create_partition(
        &self,
        table: &'static PartitionedTable,
        bounds: &PartitionBounds,
    ) -> Result<EnsureOutcome, StoreError> {
        let ddl = PartitionDdl::new(table, *bounds);

        self.with_conn(|conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            for stmt in ddl.statements() {
                tx.execute_batch(&stmt)?;
            }
            let inserted = tx.execute(
                "INSERT OR IGNORE INTO partitions
                    (parent_table, period_start, period_end, period_kind, name, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    table.name,
                    to_millis(bounds.start),
                    to_millis(bounds.end),
                    table.period,
                    ddl.name,
                    to_millis(Utc::now()),
                ],
            )?;
            tx.commit()?;

            Ok(if inserted == 1 {
                EnsureOutcome::Created
            } else {
                EnsureOutcome::AlreadyExists
            })
        })
    }

    fn list_partitions(&self, table: &str) -> Result<Vec<Partition>, StoreError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT parent_table, name, period_kind, period_start, period_end, created_at
                 FROM partitions WHERE parent_table = ?1 ORDER BY period_start",
            )?;
            let rows = stmt.query_map([table], |row| {
                Ok(Partition {
                    parent_table: row.get(0)?,
                    name: row.get(1)?,
                    period: row.get(2)?,
                    bounds: PartitionBounds {
                        start: from_millis(row.get(3)?),
                        end: from_millis(row.get(4)?),
                    },
                    created_at: from_millis(row.get(5)?),
                })
            })?;
            Ok(rows.collect::<Result<Vec<_>, _>>()?)
        })
    }
}

/// Partition that is known to exist after an ensure call
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EnsuredPartition {
    pub name: String,
    pub bounds: PartitionBounds,
    pub outcome: EnsureOutcome,
}

/// What one maintenance pass did for one table
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MaintenanceReport {
    pub table: String,
    pub created: Vec<String>,
    pub already_existed: usize,
}

/// Creates partitions on demand and ahead of time
#[derive(Clone)]
pub struct PartitionManager<B: EnsurePartition = Database> {
    backend: B,
}

impl<B: EnsurePartition> PartitionManager<B> {
    pub fn new(backend: B) -> Self {
        Self { backend }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Ensure the `kind` partition of `table` containing `ts` exists
    #[instrument(skip(self), level = "debug")]
    pub fn ensure_partition(
        &self,
        table: &str,
        ts: DateTime<Utc>,
        kind: PeriodKind,
    ) -> Result<EnsuredPartition, PartitionError> {
        let catalog_entry = lookup(table, kind)?;
        self.ensure_in(catalog_entry, ts)
    }

    /// Ensure every period from the one containing `start` to the one
    /// containing `end`, both inclusive
    pub fn ensure_partitions_for_range(
        &self,
        table: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        kind: PeriodKind,
    ) -> Result<Vec<EnsuredPartition>, PartitionError> {
        if start > end {
            return Err(PartitionError::InvalidRange { start, end });
        }
        let catalog_entry = lookup(table, kind)?;

        let mut ensured = Vec::new();
        let mut cursor = kind.truncate(start);
        while cursor <= end {
            ensured.push(self.ensure_in(catalog_entry, cursor)?);
            cursor = kind.next_start(cursor);
        }
        Ok(ensured)
    }

    /// Cover "now" plus each table's lookahead
    pub fn maintain_partitions(&self) -> Result<Vec<MaintenanceReport>, PartitionError> {
        self.maintain_partitions_at(Utc::now())
    }

    pub fn maintain_partitions_at(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<MaintenanceReport>, PartitionError> {
        let mut reports = Vec::with_capacity(PARTITIONED_TABLES.len());

        for table in PARTITIONED_TABLES {
            let horizon = lookahead_horizon(table, now);
            let ensured = self.ensure_partitions_for_range(table.name, now, horizon, table.period)?;

            let mut report = MaintenanceReport {
                table: table.name.to_string(),
                ..Default::default()
            };
            for partition in ensured {
                match partition.outcome {
                    EnsureOutcome::Created => report.created.push(partition.name),
                    EnsureOutcome::AlreadyExists => report.already_existed += 1,
                }
            }
            if !report.created.is_empty() {
                info!(table = table.name, created = ?report.created, "Partition maintenance created partitions");
            }
            reports.push(report);
        }

        Ok(reports)
    }

    pub fn list_partitions(&self, table: &str) -> Result<Vec<Partition>, PartitionError> {
        if partitioned_table(table).is_none() {
            return Err(PartitionError::UnknownTable(table.to_string()));
        }
        Ok(self.backend.list_partitions(table)?)
    }

    fn ensure_in(
        &self,
        table: &'static PartitionedTable,
        ts: DateTime<Utc>,
    ) -> Result<EnsuredPartition, PartitionError> {
        let bounds = PartitionBounds::containing(ts, table.period);
        let name = partition_name(table.name, bounds.start);
        let outcome = self.backend.create_partition(table, &bounds)?;

        match outcome {
            EnsureOutcome::Created => info!(table = table.name, partition = %name, "Created partition"),
            EnsureOutcome::AlreadyExists => debug!(partition = %name, "Partition already exists"),
        }

        Ok(EnsuredPartition {
            name,
            bounds,
            outcome,
        })
    }
}

/// Start of the last period maintenance keeps ready for `table`
pub fn lookahead_horizon(table: &PartitionedTable, now: DateTime<Utc>) -> DateTime<Utc> {
    let mut horizon = table.period.truncate(now);
    for _ in 0..table.lookahead {
        horizon = table.period.next_start(horizon);
    }
    horizon
}

fn lookup(table: &str, kind: PeriodKind) -> Result<&'static PartitionedTable, PartitionError> {
    let catalog_entry =
        partitioned_table(table).ok_or_else(|| PartitionError::UnknownTable(table.to_string()))?;
    if catalog_entry.period != kind {
        return Err(PartitionError::PeriodMismatch {
            table: table.to_string(),
            expected: catalog_entry.period,
            requested: kind,
        });
    }
    Ok(catalog_entry)
}

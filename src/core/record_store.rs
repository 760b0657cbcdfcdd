//! Record store over the monthly `calls` partitions and the auxiliary
//! poller tables.
//!
//! Inserts ensure the covering partition first, outside the write
//! transaction, then write the record and its `queued` state together.

use chrono::{DateTime, Duration, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::core::partitions::{PartitionError, PartitionManager};
use crate::core::state_machine::insert_queued;
use crate::domain::{
    saturating_sub, ApiCallMetric, InsertOutcome, NewRecord, ProcessingStage, Record, RecordError,
    SystemLogEntry, DEFAULT_MAX_RETRIES,
};
use crate::store::schema::{API_CALL_METRICS, CALLS, SYSTEM_LOGS};
use crate::store::{from_millis, quote_identifier, to_millis, Database, StoreError};

/// Longest error text kept on a record
pub const MAX_ERROR_LEN: usize = 500;

/// Record store errors
#[derive(Debug, Error)]
pub enum RecordStoreError {
    #[error("Record not found: {0}")]
    NotFound(String),

    #[error(transparent)]
    Record(#[from] RecordError),

    #[error(transparent)]
    Partition(#[from] PartitionError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl From<rusqlite::Error> for RecordStoreError {
    fn from(err: rusqlite::Error) -> Self {
        Self::Store(StoreError::from(err))
    }
}

const RECORD_COLUMNS: &str = "call_uid, group_id, feed_id, tg_id, playlist_uuid, started_at, \
    ended_at, duration_ms, url, size_bytes, raw_json, processed, error, retry_count, \
    processing_stage, picked_at, last_attempt, fetched_at";

fn record_from_row(row: &Row<'_>) -> rusqlite::Result<Record> {
    let raw: String = row.get(10)?;
    let raw_json = serde_json::from_str(&raw)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(10, Type::Text, Box::new(e)))?;

    Ok(Record {
        call_uid: row.get(0)?,
        group_id: row.get(1)?,
        feed_id: row.get(2)?,
        tg_id: row.get(3)?,
        playlist_uuid: row.get(4)?,
        started_at: from_millis(row.get(5)?),
        ended_at: row.get::<_, Option<i64>>(6)?.map(from_millis),
        duration_ms: row.get(7)?,
        url: row.get(8)?,
        size_bytes: row.get(9)?,
        raw_json,
        processed: row.get(11)?,
        error: row.get(12)?,
        retry_count: row.get(13)?,
        processing_stage: row.get(14)?,
        picked_at: row.get::<_, Option<i64>>(15)?.map(from_millis),
        last_attempt: row.get::<_, Option<i64>>(16)?.map(from_millis),
        fetched_at: from_millis(row.get(17)?),
    })
}

/// Quoted names of the registered `calls` partitions
fn call_partitions(conn: &Connection, newest_first: bool) -> Result<Vec<String>, RecordStoreError> {
    let order = if newest_first { "DESC" } else { "ASC" };
    let mut stmt = conn.prepare(&format!(
        "SELECT name FROM partitions WHERE parent_table = ?1 ORDER BY period_start {}",
        order
    ))?;
    let names = stmt
        .query_map([CALLS.name], |row| row.get::<_, String>(0))?
        .collect::<Result<Vec<_>, _>>()?;

    let mut quoted = Vec::with_capacity(names.len());
    for name in names {
        quoted.push(quote_identifier(&name)?);
    }
    Ok(quoted)
}

/// Partition holding `call_uid` and the record's current stage
fn locate(
    conn: &Connection,
    call_uid: &str,
) -> Result<Option<(String, ProcessingStage)>, RecordStoreError> {
    for partition in call_partitions(conn, true)? {
        let stage: Option<ProcessingStage> = conn
            .query_row(
                &format!("SELECT processing_stage FROM {} WHERE call_uid = ?1", partition),
                [call_uid],
                |row| row.get(0),
            )
            .optional()?;
        if let Some(stage) = stage {
            return Ok(Some((partition, stage)));
        }
    }
    Ok(None)
}

fn truncate_error(error: &str) -> String {
    error.chars().take(MAX_ERROR_LEN).collect()
}

/// Durable, time-partitioned store of ingested calls
#[derive(Clone)]
pub struct RecordStore {
    db: Database,
    partitions: PartitionManager,
    max_retries: u32,
}

impl RecordStore {
    pub fn new(db: Database) -> Self {
        Self::with_max_retries(db, DEFAULT_MAX_RETRIES)
    }

    /// New records get `max_retries` as their retry budget
    pub fn with_max_retries(db: Database, max_retries: u32) -> Self {
        Self {
            partitions: PartitionManager::new(db.clone()),
            db,
            max_retries,
        }
    }

    pub fn partitions(&self) -> &PartitionManager {
        &self.partitions
    }

    pub fn insert_record(&self, record: &NewRecord) -> Result<InsertOutcome, RecordStoreError> {
        self.insert_record_at(record, Utc::now())
    }

    /// Insert a record and its `queued` state; duplicates are a no-op
    pub fn insert_record_at(
        &self,
        record: &NewRecord,
        now: DateTime<Utc>,
    ) -> Result<InsertOutcome, RecordStoreError> {
        let ensured =
            self.partitions
                .ensure_partition(CALLS.name, record.started_at, CALLS.period)?;
        let table = quote_identifier(&ensured.name)?;
        let raw_json = serde_json::to_string(&record.raw_json).map_err(StoreError::from)?;

        let outcome = self.db.with_conn::<_, RecordStoreError, _>(|conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

            // A uid whose start moved to another month still counts as known
            let known: bool = tx
                .query_row(
                    "SELECT 1 FROM processing_state WHERE call_uid = ?1",
                    [&record.call_uid],
                    |_| Ok(true),
                )
                .optional()?
                .unwrap_or(false);
            if known {
                return Ok(InsertOutcome::Duplicate);
            }

            let inserted = tx.execute(
                &format!(
                    "INSERT OR IGNORE INTO {} ({}) VALUES \
                     (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, 0, NULL, 0, ?12, NULL, NULL, ?13)",
                    table, RECORD_COLUMNS
                ),
                params![
                    record.call_uid,
                    record.group_id,
                    record.feed_id,
                    record.tg_id,
                    record.playlist_uuid,
                    to_millis(record.started_at),
                    record.ended_at.map(to_millis),
                    record.duration_ms,
                    record.url,
                    record.size_bytes,
                    raw_json,
                    ProcessingStage::Pending,
                    to_millis(now),
                ],
            )?;
            if inserted == 0 {
                return Ok(InsertOutcome::Duplicate);
            }

            insert_queued(&tx, &record.call_uid, self.max_retries, now)?;
            tx.commit()?;

            Ok(InsertOutcome::Inserted {
                partition: ensured.name.clone(),
            })
        })?;

        match &outcome {
            InsertOutcome::Inserted { partition } => {
                debug!(call_uid = %record.call_uid, partition = %partition, "Inserted record")
            }
            InsertOutcome::Duplicate => debug!(call_uid = %record.call_uid, "Duplicate record"),
        }
        Ok(outcome)
    }

    pub fn get_record(&self, call_uid: &str) -> Result<Option<Record>, RecordStoreError> {
        self.db.with_conn(|conn| {
            for partition in call_partitions(conn, true)? {
                let record = conn
                    .query_row(
                        &format!("SELECT {} FROM {} WHERE call_uid = ?1", RECORD_COLUMNS, partition),
                        [call_uid],
                        record_from_row,
                    )
                    .optional()?;
                if record.is_some() {
                    return Ok(record);
                }
            }
            Ok(None)
        })
    }

    pub fn claim_pending(&self, limit: usize) -> Result<Vec<Record>, RecordStoreError> {
        self.claim_pending_at(limit, Utc::now())
    }

    /// Take up to `limit` of the oldest error-free pending records and mark
    /// them `downloading`; claimed records are returned in their new stage
    pub fn claim_pending_at(
        &self,
        limit: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<Record>, RecordStoreError> {
        let claimed = self.db.with_conn::<_, RecordStoreError, _>(|conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let mut claimed = Vec::new();

            for partition in call_partitions(&tx, false)? {
                if claimed.len() >= limit {
                    break;
                }
                let remaining = (limit - claimed.len()) as i64;

                let mut stmt = tx.prepare(&format!(
                    "UPDATE {table} SET processing_stage = ?1, picked_at = ?2, last_attempt = ?2
                     WHERE call_uid IN (
                         SELECT call_uid FROM {table}
                         WHERE processing_stage = ?3 AND error IS NULL
                         ORDER BY fetched_at, call_uid LIMIT ?4
                     )
                     RETURNING {columns}",
                    table = partition,
                    columns = RECORD_COLUMNS
                ))?;
                let rows = stmt.query_map(
                    params![
                        ProcessingStage::Downloading,
                        to_millis(now),
                        ProcessingStage::Pending,
                        remaining
                    ],
                    record_from_row,
                )?;
                for record in rows {
                    claimed.push(record?);
                }
            }

            tx.commit()?;
            Ok(claimed)
        })?;

        if !claimed.is_empty() {
            info!(count = claimed.len(), "Claimed pending records");
        }
        Ok(claimed)
    }

    pub fn set_stage(
        &self,
        call_uid: &str,
        stage: ProcessingStage,
    ) -> Result<ProcessingStage, RecordStoreError> {
        self.set_stage_at(call_uid, stage, Utc::now())
    }

    /// Validated record-stage change; returns the previous stage
    pub fn set_stage_at(
        &self,
        call_uid: &str,
        stage: ProcessingStage,
        now: DateTime<Utc>,
    ) -> Result<ProcessingStage, RecordStoreError> {
        self.change_stage(call_uid, stage, now, StageUpdate::default())
    }

    /// Finished: store the final media location and set `processed`
    pub fn mark_completed(&self, call_uid: &str, url: &str) -> Result<(), RecordStoreError> {
        self.change_stage(
            call_uid,
            ProcessingStage::Completed,
            Utc::now(),
            StageUpdate {
                url: Some(url),
                ..Default::default()
            },
        )?;
        Ok(())
    }

    /// Failed: keep the (truncated) error and count the attempt
    pub fn mark_failed(&self, call_uid: &str, error: &str) -> Result<(), RecordStoreError> {
        self.change_stage(
            call_uid,
            ProcessingStage::Failed,
            Utc::now(),
            StageUpdate {
                error: Some(error),
                ..Default::default()
            },
        )?;
        Ok(())
    }

    fn change_stage(
        &self,
        call_uid: &str,
        stage: ProcessingStage,
        now: DateTime<Utc>,
        update: StageUpdate<'_>,
    ) -> Result<ProcessingStage, RecordStoreError> {
        let previous = self.db.with_conn::<_, RecordStoreError, _>(|conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let (partition, current) = locate(&tx, call_uid)?
                .ok_or_else(|| RecordStoreError::NotFound(call_uid.to_string()))?;

            if !current.can_move_to(stage) {
                return Err(RecordError::InvalidStage {
                    from: current,
                    to: stage,
                }
                .into());
            }

            let picked_at = stage.is_claimed().then(|| to_millis(now));
            let failed = stage == ProcessingStage::Failed;
            let error = update.error.map(truncate_error);

            tx.execute(
                &format!(
                    "UPDATE {} SET
                        processing_stage = ?1,
                        picked_at = ?2,
                        last_attempt = CASE WHEN ?2 IS NULL AND NOT ?3 THEN last_attempt ELSE ?4 END,
                        processed = ?5,
                        error = CASE WHEN ?3 THEN ?6 WHEN ?5 OR ?10 THEN NULL ELSE error END,
                        retry_count = retry_count + CASE WHEN ?3 THEN 1 ELSE 0 END,
                        url = COALESCE(?7, url)
                     WHERE call_uid = ?8 AND processing_stage = ?9",
                    partition
                ),
                params![
                    stage,
                    picked_at,
                    failed,
                    to_millis(now),
                    stage == ProcessingStage::Completed,
                    error,
                    update.url,
                    call_uid,
                    current,
                    // Back in the queue means claimable again
                    stage == ProcessingStage::Pending,
                ],
            )?;
            tx.commit()?;
            Ok(current)
        })?;

        if stage == ProcessingStage::Failed {
            warn!(call_uid, from = %previous, error = update.error.unwrap_or(""), "Record failed");
        } else {
            debug!(call_uid, from = %previous, to = %stage, "Record stage changed");
        }
        Ok(previous)
    }

    pub fn recover_stalled(&self, timeout: Duration) -> Result<Vec<String>, RecordStoreError> {
        self.recover_stalled_at(timeout, Utc::now())
    }

    /// Put records abandoned in `downloading`/`converting` for longer than
    /// `timeout` back to `pending`; returns their uids
    pub fn recover_stalled_at(
        &self,
        timeout: Duration,
        now: DateTime<Utc>,
    ) -> Result<Vec<String>, RecordStoreError> {
        let cutoff = to_millis(saturating_sub(now, timeout));

        let recovered = self.db.with_conn::<_, RecordStoreError, _>(|conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let mut recovered = Vec::new();

            for partition in call_partitions(&tx, false)? {
                let mut stmt = tx.prepare(&format!(
                    "UPDATE {} SET processing_stage = ?1, picked_at = NULL
                     WHERE processing_stage IN (?2, ?3) AND picked_at < ?4
                     RETURNING call_uid",
                    partition
                ))?;
                let rows = stmt.query_map(
                    params![
                        ProcessingStage::Pending,
                        ProcessingStage::Downloading,
                        ProcessingStage::Converting,
                        cutoff
                    ],
                    |row| row.get::<_, String>(0),
                )?;
                for uid in rows {
                    recovered.push(uid?);
                }
            }

            tx.commit()?;
            Ok(recovered)
        })?;

        if !recovered.is_empty() {
            warn!(count = recovered.len(), "Recovered stalled records");
        }
        Ok(recovered)
    }

    /// Persist one outbound feed request into the weekly metrics partitions
    pub fn record_api_call(&self, metric: &ApiCallMetric) -> Result<(), RecordStoreError> {
        let ensured = self.partitions.ensure_partition(
            API_CALL_METRICS.name,
            metric.recorded_at,
            API_CALL_METRICS.period,
        )?;
        let table = quote_identifier(&ensured.name)?;

        self.db.with_conn::<_, RecordStoreError, _>(|conn| {
            conn.execute(
                &format!(
                    "INSERT INTO {} (endpoint, status_code, duration_ms, response_size, error, recorded_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                    table
                ),
                params![
                    metric.endpoint,
                    metric.status_code,
                    metric.duration_ms,
                    metric.response_size,
                    metric.error,
                    to_millis(metric.recorded_at),
                ],
            )?;
            Ok(())
        })
    }

    /// Persist an operational log line into the daily log partitions
    pub fn log_system_event(&self, entry: &SystemLogEntry) -> Result<(), RecordStoreError> {
        let ensured =
            self.partitions
                .ensure_partition(SYSTEM_LOGS.name, entry.logged_at, SYSTEM_LOGS.period)?;
        let table = quote_identifier(&ensured.name)?;

        self.db.with_conn::<_, RecordStoreError, _>(|conn| {
            conn.execute(
                &format!(
                    "INSERT INTO {} (component, level, message, logged_at) VALUES (?1, ?2, ?3, ?4)",
                    table
                ),
                params![
                    entry.component,
                    entry.level,
                    entry.message,
                    to_millis(entry.logged_at),
                ],
            )?;
            Ok(())
        })
    }
}

/// Optional column changes riding along with a stage change
#[derive(Default)]
struct StageUpdate<'a> {
    error: Option<&'a str>,
    url: Option<&'a str>,
}

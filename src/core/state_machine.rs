//! Processing state machine backed by the `processing_state` table.
//!
//! Each transition is one immediate transaction: read the current status,
//! validate the edge, write guarded by `WHERE status = <observed>`, append
//! the audit row. Two workers racing on one record get exactly one success;
//! the other sees `Stale` (compare-and-set) or a fresh validation result.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};
use serde::Serialize;
use thiserror::Error;
use tracing::{info, instrument, warn};

use crate::domain::{validate, InvalidTransition, ProcessingState, Status, Transition, TransitionRecord};
use crate::store::{from_millis, to_millis, Database, StoreError};

/// Why a transition was not applied
#[derive(Debug, Error)]
pub enum AdvanceError {
    #[error("No processing state for record {0}")]
    NotFound(String),

    #[error(transparent)]
    InvalidTransition(#[from] InvalidTransition),

    #[error("Record {call_uid} is {actual}, expected {expected}")]
    Stale {
        call_uid: String,
        expected: Status,
        actual: Status,
    },

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl From<rusqlite::Error> for AdvanceError {
    fn from(err: rusqlite::Error) -> Self {
        Self::Store(StoreError::from(err))
    }
}

impl AdvanceError {
    /// Only races and storage failures are worth another attempt
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Stale { .. } | Self::Store(_))
    }
}

/// A transition that was written, for audit and logging
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AppliedTransition {
    pub call_uid: String,
    pub transition: Transition,
    pub retry_count: u32,
    pub last_error: Option<String>,
    pub at: DateTime<Utc>,
}

pub(crate) const STATE_COLUMNS: &str =
    "call_uid, status, retry_count, max_retries, last_error, created_at, updated_at";

pub(crate) fn state_from_row(row: &Row<'_>) -> rusqlite::Result<ProcessingState> {
    Ok(ProcessingState {
        call_uid: row.get(0)?,
        status: row.get(1)?,
        retry_count: row.get(2)?,
        max_retries: row.get(3)?,
        last_error: row.get(4)?,
        created_at: from_millis(row.get(5)?),
        updated_at: from_millis(row.get(6)?),
    })
}

/// Insert a `queued` state with a fresh retry budget.
///
/// Returns false if the record already has a state. Runs on the caller's
/// connection so it can share the record insert's transaction.
pub(crate) fn insert_queued(
    conn: &Connection,
    call_uid: &str,
    max_retries: u32,
    now: DateTime<Utc>,
) -> rusqlite::Result<bool> {
    let inserted = conn.execute(
        "INSERT OR IGNORE INTO processing_state
            (call_uid, status, retry_count, max_retries, last_error, created_at, updated_at)
         VALUES (?1, ?2, 0, ?3, NULL, ?4, ?4)",
        params![call_uid, Status::Queued, max_retries, to_millis(now)],
    )?;
    Ok(inserted == 1)
}

/// Validated status changes for pipeline records
#[derive(Clone)]
pub struct StateMachine {
    db: Database,
}

impl StateMachine {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Move `call_uid` to `to`, whatever its current status
    pub fn advance(
        &self,
        call_uid: &str,
        to: Status,
        error: Option<&str>,
    ) -> Result<AppliedTransition, AdvanceError> {
        self.advance_at(call_uid, to, error, Utc::now())
    }

    pub fn advance_at(
        &self,
        call_uid: &str,
        to: Status,
        error: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<AppliedTransition, AdvanceError> {
        self.apply(call_uid, None, to, error, now)
    }

    /// Compare-and-set: only applies if the record is still `expected`
    pub fn advance_from(
        &self,
        call_uid: &str,
        expected: Status,
        to: Status,
        error: Option<&str>,
    ) -> Result<AppliedTransition, AdvanceError> {
        self.advance_from_at(call_uid, expected, to, error, Utc::now())
    }

    pub fn advance_from_at(
        &self,
        call_uid: &str,
        expected: Status,
        to: Status,
        error: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<AppliedTransition, AdvanceError> {
        self.apply(call_uid, Some(expected), to, error, now)
    }

    #[instrument(skip(self, error), level = "debug")]
    fn apply(
        &self,
        call_uid: &str,
        expected: Option<Status>,
        to: Status,
        error: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<AppliedTransition, AdvanceError> {
        let applied = self.db.with_conn::<_, AdvanceError, _>(|conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

            let (current, retry_count, max_retries): (Status, u32, u32) = tx
                .query_row(
                    "SELECT status, retry_count, max_retries FROM processing_state WHERE call_uid = ?1",
                    [call_uid],
                    |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
                )
                .optional()?
                .ok_or_else(|| AdvanceError::NotFound(call_uid.to_string()))?;

            if let Some(expected) = expected {
                if current != expected {
                    return Err(AdvanceError::Stale {
                        call_uid: call_uid.to_string(),
                        expected,
                        actual: current,
                    });
                }
            }

            let transition = validate(current, to)?;
            let next_retry_count = transition.next_retry_count(retry_count, max_retries);

            let updated = tx.execute(
                "UPDATE processing_state
                 SET status = ?1, retry_count = ?2, last_error = ?3, updated_at = ?4
                 WHERE call_uid = ?5 AND status = ?6",
                params![to, next_retry_count, error, to_millis(now), call_uid, current],
            )?;
            if updated != 1 {
                return Err(AdvanceError::Stale {
                    call_uid: call_uid.to_string(),
                    expected: current,
                    actual: current,
                });
            }

            tx.execute(
                "INSERT INTO state_transitions (call_uid, from_status, to_status, retry_count, error, at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![call_uid, current, to, next_retry_count, error, to_millis(now)],
            )?;
            tx.commit()?;

            Ok(AppliedTransition {
                call_uid: call_uid.to_string(),
                transition,
                retry_count: next_retry_count,
                last_error: error.map(str::to_string),
                at: now,
            })
        })?;

        if applied.transition.to == Status::Error {
            warn!(
                call_uid,
                from = %applied.transition.from,
                retry_count = applied.retry_count,
                error = error.unwrap_or(""),
                "Record entered error"
            );
        } else {
            info!(
                call_uid,
                from = %applied.transition.from,
                to = %applied.transition.to,
                retry_count = applied.retry_count,
                "Advanced record"
            );
        }

        Ok(applied)
    }

    pub fn get(&self, call_uid: &str) -> Result<Option<ProcessingState>, StoreError> {
        self.db.with_conn(|conn| {
            let state = conn
                .query_row(
                    &format!("SELECT {} FROM processing_state WHERE call_uid = ?1", STATE_COLUMNS),
                    [call_uid],
                    state_from_row,
                )
                .optional()?;
            Ok(state)
        })
    }

    /// Audit log of one record, oldest first
    pub fn history(&self, call_uid: &str) -> Result<Vec<TransitionRecord>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT call_uid, from_status, to_status, retry_count, error, at
                 FROM state_transitions WHERE call_uid = ?1 ORDER BY id",
            )?;
            let rows = stmt.query_map([call_uid], |row| {
                Ok(TransitionRecord {
                    call_uid: row.get(0)?,
                    from: row.get(1)?,
                    to: row.get(2)?,
                    retry_count: row.get(3)?,
                    error: row.get(4)?,
                    at: from_millis(row.get(5)?),
                })
            })?;
            Ok(rows.collect::<Result<Vec<_>, _>>()?)
        })
    }

    /// States in `status`, least recently updated first
    pub fn list_in_status(
        &self,
        status: Status,
        limit: usize,
    ) -> Result<Vec<ProcessingState>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM processing_state WHERE status = ?1
                 ORDER BY updated_at, call_uid LIMIT ?2",
                STATE_COLUMNS
            ))?;
            let rows = stmt.query_map(params![status, limit as i64], state_from_row)?;
            Ok(rows.collect::<Result<Vec<_>, _>>()?)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn setup(call_uid: &str) -> (StateMachine, DateTime<Utc>) {
        let db = Database::open_in_memory().unwrap();
        let now = Utc.with_ymd_and_hms(2026, 10, 18, 8, 0, 0).unwrap();
        db.with_conn(|conn| insert_queued(conn, call_uid, 3, now).map_err(StoreError::from))
            .unwrap();
        (StateMachine::new(db), now)
    }

    #[test]
    fn test_happy_path() {
        let (machine, now) = setup("g-1");

        machine.advance_at("g-1", Status::Downloaded, None, now).unwrap();
        machine.advance_at("g-1", Status::Transcribed, None, now).unwrap();
        let applied = machine.advance_at("g-1", Status::Indexed, None, now).unwrap();

        assert_eq!(applied.transition.from, Status::Transcribed);
        assert_eq!(applied.retry_count, 0);

        let history = machine.history("g-1").unwrap();
        let path: Vec<_> = history.iter().map(|t| t.to).collect();
        assert_eq!(path, vec![Status::Downloaded, Status::Transcribed, Status::Indexed]);
    }

    #[test]
    fn test_rejected_transition_changes_nothing() {
        let (machine, now) = setup("g-1");

        let err = machine.advance_at("g-1", Status::Indexed, None, now).unwrap_err();
        assert!(matches!(err, AdvanceError::InvalidTransition(_)));
        assert!(!err.is_retryable());

        let state = machine.get("g-1").unwrap().unwrap();
        assert_eq!(state.status, Status::Queued);
        assert!(machine.history("g-1").unwrap().is_empty());
    }

    #[test]
    fn test_missing_record() {
        let (machine, _) = setup("g-1");
        let err = machine.advance("nope", Status::Downloaded, None).unwrap_err();
        assert!(matches!(err, AdvanceError::NotFound(ref id) if id == "nope"));
    }

    #[test]
    fn test_error_keeps_message_and_counts() {
        let (machine, now) = setup("g-1");

        let applied = machine
            .advance_at("g-1", Status::Error, Some("timeout"), now + Duration::minutes(1))
            .unwrap();
        assert_eq!(applied.retry_count, 1);

        let state = machine.get("g-1").unwrap().unwrap();
        assert_eq!(state.last_error.as_deref(), Some("timeout"));
        assert_eq!(state.updated_at, now + Duration::minutes(1));

        machine.advance_at("g-1", Status::Queued, None, now).unwrap();
        let state = machine.get("g-1").unwrap().unwrap();
        assert_eq!(state.retry_count, 1);
        assert_eq!(state.last_error, None);
    }

    #[test]
    fn test_compare_and_set() {
        let (machine, now) = setup("g-1");

        machine
            .advance_from_at("g-1", Status::Queued, Status::Downloaded, None, now)
            .unwrap();
        let err = machine
            .advance_from_at("g-1", Status::Queued, Status::Downloaded, None, now)
            .unwrap_err();

        match err {
            AdvanceError::Stale {
                expected, actual, ..
            } => {
                assert_eq!(expected, Status::Queued);
                assert_eq!(actual, Status::Downloaded);
            }
            other => panic!("expected Stale, got {other:?}"),
        }
    }

    #[test]
    fn test_list_in_status() {
        let (machine, _) = setup("g-1");
        assert_eq!(machine.list_in_status(Status::Queued, 10).unwrap().len(), 1);
        assert!(machine.list_in_status(Status::Error, 10).unwrap().is_empty());
    }
}

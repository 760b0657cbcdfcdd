//! Stuck-work detection and recovery.
//!
//! Nothing here bypasses the state machine: every status change goes through
//! `advance_from`, so a record a worker just moved is skipped as stale.

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info};

use crate::core::record_store::{RecordStore, RecordStoreError};
use crate::core::retry::Backoff;
use crate::core::state_machine::{state_from_row, AdvanceError, AppliedTransition, StateMachine, STATE_COLUMNS};
use crate::domain::{saturating_sub, ProcessingState, Status};
use crate::store::{to_millis, Database, StoreError};

#[derive(Debug, Error)]
pub enum ReclaimError {
    #[error(transparent)]
    Advance(#[from] AdvanceError),

    #[error(transparent)]
    Records(#[from] RecordStoreError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Why a record shows up in the stuck report
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StuckReason {
    /// In flight but not updated for too long
    Stalled,
    /// Out of automatic retries, needs triage
    Exhausted,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StuckItem {
    pub state: ProcessingState,
    pub reason: StuckReason,
    /// Seconds since the last update
    pub age_seconds: i64,
}

impl StuckItem {
    pub fn age(&self) -> Duration {
        Duration::seconds(self.age_seconds)
    }
}

#[derive(Clone)]
pub struct Reclaimer {
    db: Database,
    machine: StateMachine,
    records: RecordStore,
}

impl Reclaimer {
    pub fn new(db: Database) -> Self {
        Self {
            machine: StateMachine::new(db.clone()),
            records: RecordStore::new(db.clone()),
            db,
        }
    }

    pub fn find_stuck(&self, max_age_hours: u32) -> Result<Vec<StuckItem>, ReclaimError> {
        self.find_stuck_at(max_age_hours, Utc::now())
    }

    /// In-flight records idle for `max_age_hours` plus every exhausted
    /// record, oldest first
    pub fn find_stuck_at(
        &self,
        max_age_hours: u32,
        now: DateTime<Utc>,
    ) -> Result<Vec<StuckItem>, ReclaimError> {
        let cutoff = to_millis(saturating_sub(now, Duration::hours(i64::from(max_age_hours))));

        let states = self.db.with_conn::<_, StoreError, _>(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM processing_state
                 WHERE (status IN (?1, ?2, ?3) AND updated_at < ?4)
                    OR (status = ?5 AND retry_count >= max_retries)
                 ORDER BY updated_at, call_uid",
                STATE_COLUMNS
            ))?;
            let rows = stmt.query_map(
                rusqlite::params![
                    Status::Queued,
                    Status::Downloaded,
                    Status::Transcribed,
                    cutoff,
                    Status::Error
                ],
                state_from_row,
            )?;
            Ok(rows.collect::<Result<Vec<_>, _>>()?)
        })?;

        Ok(states
            .into_iter()
            .map(|state| StuckItem {
                reason: if state.status == Status::Error {
                    StuckReason::Exhausted
                } else {
                    StuckReason::Stalled
                },
                age_seconds: (now - state.updated_at).num_seconds(),
                state,
            })
            .collect())
    }

    pub fn resurrect(&self, max_age_days: u32) -> Result<Vec<AppliedTransition>, ReclaimError> {
        self.resurrect_at(max_age_days, Utc::now())
    }

    /// Give exhausted records untouched for `max_age_days` one more pass.
    ///
    /// The retry count is kept, so a record that fails again is exhausted
    /// at once and waits another full window.
    pub fn resurrect_at(
        &self,
        max_age_days: u32,
        now: DateTime<Utc>,
    ) -> Result<Vec<AppliedTransition>, ReclaimError> {
        let cutoff = saturating_sub(now, Duration::days(i64::from(max_age_days)));
        let candidates = self.exhausted_before(cutoff)?;

        let mut resurrected = Vec::new();
        for state in candidates {
            if let Some(applied) = self.requeue(&state.call_uid, now)? {
                resurrected.push(applied);
            }
        }

        if !resurrected.is_empty() {
            info!(count = resurrected.len(), max_age_days, "Resurrected exhausted records");
        }
        Ok(resurrected)
    }

    pub fn requeue_due(&self, backoff: &Backoff) -> Result<Vec<AppliedTransition>, ReclaimError> {
        self.requeue_due_at(backoff, Utc::now())
    }

    /// Automatic retry path: `error` records with budget left whose backoff
    /// has elapsed go back to `queued`
    pub fn requeue_due_at(
        &self,
        backoff: &Backoff,
        now: DateTime<Utc>,
    ) -> Result<Vec<AppliedTransition>, ReclaimError> {
        let retryable = self.db.with_conn::<_, StoreError, _>(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM processing_state
                 WHERE status = ?1 AND retry_count < max_retries
                 ORDER BY updated_at, call_uid",
                STATE_COLUMNS
            ))?;
            let rows = stmt.query_map([Status::Error], state_from_row)?;
            Ok(rows.collect::<Result<Vec<_>, _>>()?)
        })?;

        let mut requeued = Vec::new();
        for state in retryable {
            let due = state
                .updated_at
                .checked_add_signed(backoff.chrono_delay(state.retry_count))
                .map_or(false, |due| due <= now);
            if !due {
                continue;
            }
            if let Some(applied) = self.requeue(&state.call_uid, now)? {
                requeued.push(applied);
            }
        }

        if !requeued.is_empty() {
            info!(count = requeued.len(), "Requeued records after backoff");
        }
        Ok(requeued)
    }

    pub fn recover_stalled(&self, timeout: Duration) -> Result<Vec<String>, ReclaimError> {
        Ok(self.records.recover_stalled(timeout)?)
    }

    pub fn recover_stalled_at(
        &self,
        timeout: Duration,
        now: DateTime<Utc>,
    ) -> Result<Vec<String>, ReclaimError> {
        Ok(self.records.recover_stalled_at(timeout, now)?)
    }

    fn exhausted_before(&self, cutoff: DateTime<Utc>) -> Result<Vec<ProcessingState>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM processing_state
                 WHERE status = ?1 AND retry_count >= max_retries AND updated_at < ?2
                 ORDER BY updated_at, call_uid",
                STATE_COLUMNS
            ))?;
            let rows = stmt.query_map(rusqlite::params![Status::Error, to_millis(cutoff)], state_from_row)?;
            Ok(rows.collect::<Result<Vec<_>, _>>()?)
        })
    }

    /// `error -> queued` with the message cleared; `None` if someone else
    /// moved the record first
    fn requeue(
        &self,
        call_uid: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<AppliedTransition>, ReclaimError> {
        match self
            .machine
            .advance_from_at(call_uid, Status::Error, Status::Queued, None, now)
        {
            Ok(applied) => Ok(Some(applied)),
            Err(AdvanceError::Stale { actual, .. }) => {
                debug!(call_uid, %actual, "Skipping record that moved on");
                Ok(None)
            }
            Err(err) => Err(err.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::NewRecord;
    use chrono::TimeZone;

    fn day(d: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 10, d, 12, 0, 0).unwrap()
    }

    fn setup(uids: &[&str], now: DateTime<Utc>) -> (Reclaimer, StateMachine) {
        let db = Database::open_in_memory().unwrap();
        let store = RecordStore::new(db.clone());
        for uid in uids {
            store
                .insert_record_at(&NewRecord::new(*uid, now, "u"), now)
                .unwrap();
        }
        (Reclaimer::new(db.clone()), StateMachine::new(db))
    }

    #[test]
    fn test_requeue_waits_for_backoff() {
        let (reclaimer, machine) = setup(&["g-1"], day(1));
        machine
            .advance_at("g-1", Status::Error, Some("503"), day(1))
            .unwrap();

        let backoff = Backoff::default();
        // retry_count 1 -> 4s delay
        let early = reclaimer
            .requeue_due_at(&backoff, day(1) + Duration::seconds(3))
            .unwrap();
        assert!(early.is_empty());

        let due = reclaimer
            .requeue_due_at(&backoff, day(1) + Duration::seconds(4))
            .unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].retry_count, 1);
        assert_eq!(machine.get("g-1").unwrap().unwrap().status, Status::Queued);
    }

    #[test]
    fn test_requeue_skips_exhausted() {
        let (reclaimer, machine) = setup(&["g-1"], day(1));
        for _ in 0..2 {
            machine.advance_at("g-1", Status::Error, Some("x"), day(1)).unwrap();
            machine.advance_at("g-1", Status::Queued, None, day(1)).unwrap();
        }
        machine.advance_at("g-1", Status::Error, Some("x"), day(1)).unwrap();

        let requeued = reclaimer.requeue_due_at(&Backoff::default(), day(5)).unwrap();
        assert!(requeued.is_empty());

        let stuck = reclaimer.find_stuck_at(24, day(1)).unwrap();
        assert_eq!(stuck.len(), 1);
        assert_eq!(stuck[0].reason, StuckReason::Exhausted);
    }

    #[test]
    fn test_resurrect_respects_cooldown() {
        let (reclaimer, machine) = setup(&["g-1"], day(1));
        for _ in 0..3 {
            machine.advance_at("g-1", Status::Error, Some("x"), day(1)).unwrap();
            if machine.get("g-1").unwrap().unwrap().retry_count < 3 {
                machine.advance_at("g-1", Status::Queued, None, day(1)).unwrap();
            }
        }

        assert!(reclaimer.resurrect_at(7, day(5)).unwrap().is_empty());
        assert_eq!(reclaimer.resurrect_at(7, day(9)).unwrap().len(), 1);
    }

    #[test]
    fn test_windows_beyond_the_calendar_match_nothing() {
        let (reclaimer, machine) = setup(&["g-1"], day(1));
        for _ in 0..3 {
            machine.advance_at("g-1", Status::Error, Some("x"), day(1)).unwrap();
            if machine.get("g-1").unwrap().unwrap().retry_count < 3 {
                machine.advance_at("g-1", Status::Queued, None, day(1)).unwrap();
            }
        }

        assert!(reclaimer.resurrect_at(u32::MAX, day(18)).unwrap().is_empty());
        // Exhausted records are listed whatever the idle window
        let stuck = reclaimer.find_stuck_at(u32::MAX, day(18)).unwrap();
        assert_eq!(stuck.len(), 1);
        assert_eq!(stuck[0].reason, StuckReason::Exhausted);
    }
}

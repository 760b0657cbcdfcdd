//! Stage runners: move records from one pipeline status to the next.
//!
//! A runner picks a batch of records in its `from` status, runs the handler
//! outside any database transaction, then advances each record with a
//! compare-and-set. A record another worker moved in the meantime is skipped.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Serialize;
use tracing::{debug, info, instrument, warn};

use crate::core::state_machine::{AdvanceError, StateMachine};
use crate::domain::{validate, InvalidTransition, Status};

/// Work done for one pipeline stage (download, transcribe, index)
#[async_trait]
pub trait StageHandler: Send + Sync {
    /// Stage name for logs
    fn name(&self) -> &str;

    /// Status records are picked up in
    fn from_status(&self) -> Status;

    /// Status records move to on success
    fn to_status(&self) -> Status;

    /// Process one record. An error moves the record to `error`.
    async fn process(&self, call_uid: &str) -> Result<()>;
}

/// Counts for one batch
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StageReport {
    pub succeeded: usize,
    pub failed: usize,
    /// Moved by someone else while the handler ran
    pub skipped: usize,
}

impl StageReport {
    pub fn total(&self) -> usize {
        self.succeeded + self.failed + self.skipped
    }
}

pub struct StageRunner<H: StageHandler> {
    machine: StateMachine,
    handler: H,
    batch_size: usize,
}

impl<H: StageHandler> StageRunner<H> {
    /// Fails if the handler's edge is not a valid transition
    pub fn new(machine: StateMachine, handler: H, batch_size: usize) -> Result<Self, InvalidTransition> {
        validate(handler.from_status(), handler.to_status())?;
        Ok(Self {
            machine,
            handler,
            batch_size: batch_size.max(1),
        })
    }

    pub fn handler(&self) -> &H {
        &self.handler
    }

    /// Process up to `batch_size` records
    #[instrument(skip(self), fields(stage = %self.handler.name()))]
    pub async fn run_batch(&self) -> Result<StageReport> {
        let from = self.handler.from_status();
        let to = self.handler.to_status();

        let machine = self.machine.clone();
        let limit = self.batch_size;
        let batch = tokio::task::spawn_blocking(move || machine.list_in_status(from, limit))
            .await
            .context("State query task panicked")??;

        let mut report = StageReport::default();
        for state in batch {
            let outcome = self.handler.process(&state.call_uid).await;

            let (target, error) = match &outcome {
                Ok(()) => (to, None),
                Err(e) => (Status::Error, Some(format!("{:#}", e))),
            };

            let machine = self.machine.clone();
            let call_uid = state.call_uid.clone();
            let advanced = tokio::task::spawn_blocking(move || {
                machine.advance_from(&call_uid, from, target, error.as_deref())
            })
            .await
            .context("State update task panicked")?;

            match advanced {
                Ok(_) if outcome.is_ok() => report.succeeded += 1,
                Ok(_) => report.failed += 1,
                Err(AdvanceError::Stale { actual, .. }) => {
                    debug!(call_uid = %state.call_uid, %actual, "Record moved by another worker");
                    report.skipped += 1;
                }
                Err(e) => {
                    warn!(call_uid = %state.call_uid, error = %e, "Failed to record stage result");
                    return Err(e.into());
                }
            }
        }

        if report.total() > 0 {
            info!(
                succeeded = report.succeeded,
                failed = report.failed,
                skipped = report.skipped,
                "Stage batch finished"
            );
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::RecordStore;
    use crate::domain::NewRecord;
    use crate::store::Database;
    use chrono::Utc;
    use std::collections::HashSet;
    use std::sync::Mutex;

    struct Download {
        failing: HashSet<String>,
        seen: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl StageHandler for Download {
        fn name(&self) -> &str {
            "download"
        }

        fn from_status(&self) -> Status {
            Status::Queued
        }

        fn to_status(&self) -> Status {
            Status::Downloaded
        }

        async fn process(&self, call_uid: &str) -> Result<()> {
            self.seen.lock().unwrap().push(call_uid.to_string());
            if self.failing.contains(call_uid) {
                anyhow::bail!("HTTP 404 for {}", call_uid);
            }
            Ok(())
        }
    }

    fn seed(db: &Database, uids: &[&str]) {
        let records = RecordStore::new(db.clone());
        for uid in uids {
            records
                .insert_record(&NewRecord::new(*uid, Utc::now(), "https://example.org/a.m4a"))
                .unwrap();
        }
    }

    #[tokio::test]
    async fn test_batch_advances_and_fails() {
        let db = Database::open_in_memory().unwrap();
        seed(&db, &["g-1", "g-2", "g-3"]);

        let handler = Download {
            failing: ["g-2".to_string()].into_iter().collect(),
            seen: Mutex::new(Vec::new()),
        };
        let machine = StateMachine::new(db.clone());
        let runner = StageRunner::new(machine.clone(), handler, 10).unwrap();

        let report = runner.run_batch().await.unwrap();
        assert_eq!(report.succeeded, 2);
        assert_eq!(report.failed, 1);
        assert_eq!(report.skipped, 0);

        let failed = machine.get("g-2").unwrap().unwrap();
        assert_eq!(failed.status, Status::Error);
        assert_eq!(failed.retry_count, 1);
        assert!(failed.last_error.unwrap().contains("HTTP 404"));
        assert_eq!(machine.get("g-1").unwrap().unwrap().status, Status::Downloaded);

        // Nothing left in `queued`
        let again = runner.run_batch().await.unwrap();
        assert_eq!(again.total(), 0);
    }

    #[tokio::test]
    async fn test_batch_size_limits_work() {
        let db = Database::open_in_memory().unwrap();
        seed(&db, &["g-1", "g-2", "g-3"]);

        let handler = Download {
            failing: HashSet::new(),
            seen: Mutex::new(Vec::new()),
        };
        let runner = StageRunner::new(StateMachine::new(db), handler, 2).unwrap();

        let report = runner.run_batch().await.unwrap();
        assert_eq!(report.succeeded, 2);
        assert_eq!(runner.handler().seen.lock().unwrap().len(), 2);
    }

    struct Backwards;

    #[async_trait]
    impl StageHandler for Backwards {
        fn name(&self) -> &str {
            "backwards"
        }

        fn from_status(&self) -> Status {
            Status::Indexed
        }

        fn to_status(&self) -> Status {
            Status::Queued
        }

        async fn process(&self, _call_uid: &str) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_rejects_invalid_edge() {
        let db = Database::open_in_memory().unwrap();
        let err = StageRunner::new(StateMachine::new(db), Backwards, 10).err().unwrap();
        assert_eq!(err.from, Status::Indexed);
        assert_eq!(err.to, Status::Queued);
    }
}

//! Periodic maintenance jobs.
//!
//! Each job runs in its own tokio task on its own interval and talks to the
//! others only through the database. Database work runs on the blocking
//! pool. Stopping lets a running turn finish and starts no new ones.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::config::{default_retention, ReclaimerConfig, ResolvedConfig, ScheduleConfig};
use crate::core::monitor::Monitor;
use crate::core::partitions::PartitionManager;
use crate::core::reclaimer::{Reclaimer, StuckReason};
use crate::core::retention::RetentionEngine;
use crate::core::retry::Backoff;
use crate::domain::RetentionPolicy;
use crate::store::Database;

/// What the scheduled jobs need from the configuration
#[derive(Debug, Clone)]
pub struct SchedulerSettings {
    pub schedule: ScheduleConfig,
    pub reclaimer: ReclaimerConfig,
    pub backoff: Backoff,
    pub retention: Vec<RetentionPolicy>,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            schedule: ScheduleConfig::default(),
            reclaimer: ReclaimerConfig::default(),
            backoff: Backoff::default(),
            retention: default_retention()
                .into_iter()
                .map(|(table, entry)| RetentionPolicy::new(&table, entry.days, &entry.column))
                .collect(),
        }
    }
}

impl From<&ResolvedConfig> for SchedulerSettings {
    fn from(config: &ResolvedConfig) -> Self {
        Self {
            schedule: config.schedule.clone(),
            reclaimer: config.reclaimer.clone(),
            backoff: config.backoff,
            retention: config.retention_policies(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Job {
    Partitions,
    Reclaimer,
    Retention,
    Stats,
}

impl Job {
    pub const ALL: [Job; 4] = [Job::Partitions, Job::Reclaimer, Job::Retention, Job::Stats];

    pub fn name(&self) -> &'static str {
        match self {
            Job::Partitions => "partitions",
            Job::Reclaimer => "reclaimer",
            Job::Retention => "retention",
            Job::Stats => "stats",
        }
    }

    pub fn interval(&self, schedule: &ScheduleConfig) -> Duration {
        let secs = match self {
            Job::Partitions => schedule.partitions_secs,
            Job::Reclaimer => schedule.reclaimer_secs,
            Job::Retention => schedule.retention_secs,
            Job::Stats => schedule.stats_secs,
        };
        Duration::from_secs(secs.max(1))
    }
}

/// Handle to stop running jobs
pub struct SchedulerHandle {
    stop_tx: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl SchedulerHandle {
    /// Signal every job and wait for current turns to finish
    pub async fn stop(self) -> Result<()> {
        let _ = self.stop_tx.send(true);
        for task in self.tasks {
            task.await.context("Scheduled job task panicked")?;
        }
        Ok(())
    }
}

#[derive(Clone)]
pub struct MaintenanceScheduler {
    db: Database,
    settings: Arc<SchedulerSettings>,
}

impl MaintenanceScheduler {
    pub fn new(db: Database, settings: SchedulerSettings) -> Self {
        Self {
            db,
            settings: Arc::new(settings),
        }
    }

    /// Seed missing retention policies and create partitions due now
    pub fn prepare(&self) -> Result<()> {
        let seeded = RetentionEngine::new(self.db.clone())
            .seed_policies(&self.settings.retention)
            .context("Failed to seed retention policies")?;
        if seeded > 0 {
            info!(seeded, "Seeded retention policies");
        }
        self.execute(Job::Partitions, Utc::now())
    }

    /// Run one turn of `job` synchronously
    pub fn execute(&self, job: Job, now: DateTime<Utc>) -> Result<()> {
        match job {
            Job::Partitions => {
                let reports = PartitionManager::new(self.db.clone())
                    .maintain_partitions_at(now)
                    .context("Partition maintenance failed")?;
                let created: usize = reports.iter().map(|r| r.created.len()).sum();
                debug!(created, "Partition maintenance finished");
            }
            Job::Reclaimer => self.reclaim(now)?,
            Job::Retention => {
                let report = RetentionEngine::new(self.db.clone())
                    .cleanup_at(now)
                    .context("Retention cleanup failed")?;
                for failure in report.failures() {
                    warn!(
                        table = %failure.table_name,
                        error = ?failure.error,
                        "Retention policy failed"
                    );
                }
            }
            Job::Stats => {
                let stats = Monitor::new(self.db.clone(), self.settings.reclaimer.stuck_after_hours)
                    .collect_at(now)
                    .context("Failed to collect pipeline stats")?;
                info!(
                    records = stats.total_records(),
                    counts = ?stats.status_counts,
                    oldest_stuck_seconds = ?stats.oldest_stuck.as_ref().map(|s| s.age_seconds),
                    "Pipeline stats"
                );
                for table in stats.unhealthy_tables() {
                    warn!(
                        table = %table.table,
                        covers_now = table.covers_now,
                        lookahead_ok = table.lookahead_ok,
                        "Partition coverage incomplete"
                    );
                }
            }
        }
        Ok(())
    }

    fn reclaim(&self, now: DateTime<Utc>) -> Result<()> {
        let reclaimer = Reclaimer::new(self.db.clone());
        let config = &self.settings.reclaimer;

        let recovered = reclaimer
            .recover_stalled_at(config.stalled_timeout(), now)
            .context("Stalled download recovery failed")?;
        let requeued = reclaimer
            .requeue_due_at(&self.settings.backoff, now)
            .context("Requeue failed")?;
        let resurrected = if config.auto_resurrect {
            reclaimer
                .resurrect_at(config.resurrect_after_days, now)
                .context("Resurrection failed")?
        } else {
            Vec::new()
        };

        let stuck = reclaimer
            .find_stuck_at(config.stuck_after_hours, now)
            .context("Stuck scan failed")?;
        let stalled = stuck.iter().filter(|s| s.reason == StuckReason::Stalled).count();
        let exhausted = stuck.len() - stalled;
        if stalled > 0 || exhausted > 0 {
            warn!(stalled, exhausted, "Stuck records need attention");
        }

        debug!(
            recovered = recovered.len(),
            requeued = requeued.len(),
            resurrected = resurrected.len(),
            "Reclaimer pass finished"
        );
        Ok(())
    }

    /// Run one turn of `job` on the blocking pool
    pub async fn run_once(&self, job: Job) -> Result<()> {
        let scheduler = self.clone();
        tokio::task::spawn_blocking(move || scheduler.execute(job, Utc::now()))
            .await
            .with_context(|| format!("{} job panicked", job.name()))?
    }

    /// Spawn one task per job. Every job runs once right away.
    pub fn start(&self) -> SchedulerHandle {
        let (stop_tx, stop_rx) = watch::channel(false);

        let tasks = Job::ALL
            .into_iter()
            .map(|job| {
                let scheduler = self.clone();
                let stop_rx = stop_rx.clone();
                tokio::spawn(async move { scheduler.job_loop(job, stop_rx).await })
            })
            .collect();

        info!("Maintenance scheduler started");
        SchedulerHandle { stop_tx, tasks }
    }

    async fn job_loop(self, job: Job, mut stop_rx: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(job.interval(&self.settings.schedule));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                changed = stop_rx.changed() => {
                    if changed.is_err() || *stop_rx.borrow() {
                        break;
                    }
                    continue;
                }
            }

            if *stop_rx.borrow() {
                break;
            }

            if let Err(e) = self.run_once(job).await {
                error!(job = job.name(), error = %format!("{:#}", e), "Scheduled job failed");
            }
        }

        debug!(job = job.name(), "Scheduled job stopped");
    }

    /// Prepare, run every job until Ctrl-C, then stop gracefully
    pub async fn run_until_ctrl_c(&self) -> Result<()> {
        let scheduler = self.clone();
        tokio::task::spawn_blocking(move || scheduler.prepare())
            .await
            .context("Startup task panicked")??;

        let handle = self.start();
        tokio::signal::ctrl_c()
            .await
            .context("Failed to listen for Ctrl-C")?;

        info!("Stopping maintenance scheduler");
        handle.stop().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{RecordStore, StateMachine};
    use crate::domain::{NewRecord, Status};
    use chrono::{Duration as ChronoDuration, TimeZone};

    #[test]
    fn test_prepare_seeds_and_creates() {
        let db = Database::open_in_memory().unwrap();
        let scheduler = MaintenanceScheduler::new(db.clone(), SchedulerSettings::default());

        scheduler.prepare().unwrap();

        let policies = RetentionEngine::new(db.clone()).policies().unwrap();
        assert_eq!(policies.len(), 5);
        let calls = PartitionManager::new(db).list_partitions("calls").unwrap();
        assert_eq!(calls.len(), 2);
    }

    #[test]
    fn test_reclaimer_job_requeues() {
        let db = Database::open_in_memory().unwrap();
        let t0 = Utc.with_ymd_and_hms(2026, 10, 18, 8, 0, 0).unwrap();
        RecordStore::new(db.clone())
            .insert_record_at(&NewRecord::new("g-1", t0, "https://example.org/a.m4a"), t0)
            .unwrap();
        let machine = StateMachine::new(db.clone());
        machine
            .advance_at("g-1", Status::Error, Some("timeout"), t0)
            .unwrap();

        let scheduler = MaintenanceScheduler::new(db, SchedulerSettings::default());
        scheduler
            .execute(Job::Reclaimer, t0 + ChronoDuration::minutes(1))
            .unwrap();

        let state = machine.get("g-1").unwrap().unwrap();
        assert_eq!(state.status, Status::Queued);
        assert_eq!(state.retry_count, 1);
    }

    #[test]
    fn test_intervals_from_schedule() {
        let schedule = ScheduleConfig::default();
        assert_eq!(Job::Reclaimer.interval(&schedule), Duration::from_secs(300));
        assert_eq!(Job::Stats.interval(&schedule), Duration::from_secs(60));

        let zero = ScheduleConfig {
            stats_secs: 0,
            ..Default::default()
        };
        assert_eq!(Job::Stats.interval(&zero), Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_start_and_stop() {
        let db = Database::open_in_memory().unwrap();
        let scheduler = MaintenanceScheduler::new(db.clone(), SchedulerSettings::default());

        let handle = scheduler.start();
        tokio::time::sleep(Duration::from_millis(200)).await;
        handle.stop().await.unwrap();

        // The first tick fires immediately, so partitions exist
        let partitions = PartitionManager::new(db).list_partitions("system_logs").unwrap();
        assert!(!partitions.is_empty());
    }
}

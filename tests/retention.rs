//! Retention Integration Tests
//!
//! Cleanup against partitioned and plain tables, including partition drops
//! and dependent state removal.

use chrono::{DateTime, TimeZone, Utc};
use scanpipe::core::{PartitionManager, RecordStore, RetentionEngine, StateMachine};
use scanpipe::domain::{NewRecord, RetentionPolicy, Status, SystemLogEntry};
use scanpipe::store::Database;

fn at(month: u32, day: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, month, day, 12, 0, 0).unwrap()
}

fn insert(store: &RecordStore, uid: &str, started_at: DateTime<Utc>) {
    store
        .insert_record_at(
            &NewRecord::new(uid, started_at, format!("https://calls.example/{}.m4a", uid)),
            started_at,
        )
        .unwrap();
}

#[test]
fn test_cleanup_drops_aged_partitions_and_trims_current() {
    let db = Database::open_in_memory().unwrap();
    let store = RecordStore::new(db.clone());
    let machine = StateMachine::new(db.clone());
    let engine = RetentionEngine::new(db.clone());
    let now = at(10, 18);

    insert(&store, "sep-20", at(9, 20));
    insert(&store, "oct-05", at(10, 5));
    insert(&store, "oct-15", at(10, 15));
    // Next month's partition exists but is empty
    PartitionManager::new(db.clone())
        .ensure_partition("calls", at(11, 2), scanpipe::domain::PeriodKind::Month)
        .unwrap();

    engine
        .upsert_policy(&RetentionPolicy::new("calls", 7, "started_at"))
        .unwrap();

    let report = engine.cleanup_at(now).unwrap();
    let outcome = report.outcome("calls").unwrap();
    assert!(outcome.succeeded());
    assert_eq!(outcome.rows_deleted, 2);
    assert_eq!(outcome.partitions_dropped, vec!["calls_p20260901".to_string()]);

    // Old rows and their processing state are gone, the recent one survives
    assert!(store.get_record("sep-20").unwrap().is_none());
    assert!(store.get_record("oct-05").unwrap().is_none());
    assert!(machine.get("sep-20").unwrap().is_none());
    assert!(machine.get("oct-05").unwrap().is_none());
    assert!(store.get_record("oct-15").unwrap().is_some());
    assert_eq!(machine.get("oct-15").unwrap().unwrap().status, Status::Queued);

    let names: Vec<_> = PartitionManager::new(db)
        .list_partitions("calls")
        .unwrap()
        .into_iter()
        .map(|p| p.name)
        .collect();
    assert_eq!(names, vec!["calls_p20261001", "calls_p20261101"]);

    let policy = engine.policy("calls").unwrap().unwrap();
    assert_eq!(policy.last_cleanup_at, Some(now));

    // Nothing left to do on a second pass
    let again = engine.cleanup_at(now).unwrap();
    assert_eq!(again.total_rows_deleted(), 0);
}

#[test]
fn test_cleanup_plain_and_daily_tables() {
    let db = Database::open_in_memory().unwrap();
    let store = RecordStore::new(db.clone());
    let machine = StateMachine::new(db.clone());
    let engine = RetentionEngine::new(db.clone());

    insert(&store, "g-1", at(10, 1));
    machine
        .advance_at("g-1", Status::Downloaded, None, at(10, 1))
        .unwrap();
    machine
        .advance_at("g-1", Status::Transcribed, None, at(10, 16))
        .unwrap();

    for (day, message) in [(1, "poll ok"), (17, "poll ok")] {
        store
            .log_system_event(&SystemLogEntry {
                component: "poller".to_string(),
                level: "info".to_string(),
                message: message.to_string(),
                logged_at: at(10, day),
            })
            .unwrap();
    }

    engine
        .seed_policies(&[
            RetentionPolicy::new("state_transitions", 7, "at"),
            RetentionPolicy::new("system_logs", 14, "logged_at"),
        ])
        .unwrap();

    let report = engine.cleanup_at(at(10, 18)).unwrap();
    assert_eq!(report.failures().count(), 0);

    let transitions = report.outcome("state_transitions").unwrap();
    assert_eq!(transitions.rows_deleted, 1);
    assert!(transitions.partitions_dropped.is_empty());
    let history = machine.history("g-1").unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].to, Status::Transcribed);

    let logs = report.outcome("system_logs").unwrap();
    assert_eq!(logs.rows_deleted, 1);
    assert_eq!(logs.partitions_dropped, vec!["system_logs_p20261001".to_string()]);
}

#[test]
fn test_disabled_policy_is_skipped() {
    let db = Database::open_in_memory().unwrap();
    let store = RecordStore::new(db.clone());
    let engine = RetentionEngine::new(db);

    insert(&store, "old", at(9, 1));
    engine
        .upsert_policy(&RetentionPolicy {
            enabled: false,
            ..RetentionPolicy::new("calls", 7, "started_at")
        })
        .unwrap();

    let report = engine.cleanup_at(at(10, 18)).unwrap();
    assert!(report.outcomes.is_empty());
    assert!(store.get_record("old").unwrap().is_some());
}

#[test]
fn test_oversized_window_keeps_rows_and_other_policies_run() {
    let db = Database::open_in_memory().unwrap();
    let store = RecordStore::new(db.clone());
    let engine = RetentionEngine::new(db);

    insert(&store, "ancient", at(1, 2));
    for day in [1, 17] {
        store
            .log_system_event(&SystemLogEntry {
                component: "poller".to_string(),
                level: "info".to_string(),
                message: "poll ok".to_string(),
                logged_at: at(10, day),
            })
            .unwrap();
    }

    engine
        .seed_policies(&[
            RetentionPolicy::new("calls", 7, "started_at"),
            RetentionPolicy::new("system_logs", u32::MAX, "logged_at"),
        ])
        .unwrap();

    let report = engine.cleanup_at(at(10, 18)).unwrap();
    assert_eq!(report.failures().count(), 0);

    let logs = report.outcome("system_logs").unwrap();
    assert_eq!(logs.rows_deleted, 0);
    assert!(logs.partitions_dropped.is_empty());

    let calls = report.outcome("calls").unwrap();
    assert_eq!(calls.rows_deleted, 1);
    assert!(store.get_record("ancient").unwrap().is_none());
}

//! Reclaimer Integration Tests
//!
//! Stuck detection, backoff-driven requeue and stalled download recovery.

use chrono::{DateTime, Duration, TimeZone, Utc};
use scanpipe::core::{Backoff, Reclaimer, RecordStore, StateMachine, StuckReason};
use scanpipe::domain::{NewRecord, ProcessingStage, Status};
use scanpipe::store::Database;

fn now() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 10, 18, 12, 0, 0).unwrap()
}

fn setup() -> (Database, RecordStore, StateMachine) {
    let db = Database::open_in_memory().unwrap();
    (db.clone(), RecordStore::new(db.clone()), StateMachine::new(db))
}

#[test]
fn test_find_stuck_by_age() {
    let (db, store, machine) = setup();
    let old = now() - Duration::hours(30);
    let fresh = now() - Duration::hours(1);

    for (uid, at) in [("old", old), ("fresh", fresh)] {
        store
            .insert_record_at(&NewRecord::new(uid, at, "https://calls.example/a.m4a"), at)
            .unwrap();
        machine.advance_at(uid, Status::Downloaded, None, at).unwrap();
    }

    let stuck = Reclaimer::new(db).find_stuck_at(24, now()).unwrap();
    assert_eq!(stuck.len(), 1);
    assert_eq!(stuck[0].state.call_uid, "old");
    assert_eq!(stuck[0].reason, StuckReason::Stalled);
    assert_eq!(stuck[0].age(), Duration::hours(30));
}

#[test]
fn test_requeue_follows_backoff() {
    let (db, store, machine) = setup();
    let t0 = now();
    store
        .insert_record_at(&NewRecord::new("g-1", t0, "https://calls.example/a.m4a"), t0)
        .unwrap();
    machine.advance_at("g-1", Status::Error, Some("timeout"), t0).unwrap();

    let reclaimer = Reclaimer::new(db);
    let backoff = Backoff::default();

    // retry_count 1 waits 4 seconds
    assert!(reclaimer
        .requeue_due_at(&backoff, t0 + Duration::seconds(3))
        .unwrap()
        .is_empty());
    let requeued = reclaimer
        .requeue_due_at(&backoff, t0 + Duration::seconds(4))
        .unwrap();
    assert_eq!(requeued.len(), 1);

    let state = machine.get("g-1").unwrap().unwrap();
    assert_eq!(state.status, Status::Queued);
    assert_eq!(state.retry_count, 1);
    assert_eq!(state.last_error, None);
}

#[test]
fn test_recover_stalled_download() {
    let (db, store, _machine) = setup();
    let t0 = now();
    store
        .insert_record_at(&NewRecord::new("g-1", t0, "https://calls.example/a.m4a"), t0)
        .unwrap();

    let claimed = store.claim_pending_at(10, t0).unwrap();
    assert_eq!(claimed.len(), 1);
    assert_eq!(claimed[0].processing_stage, ProcessingStage::Downloading);

    let reclaimer = Reclaimer::new(db);
    assert!(reclaimer
        .recover_stalled_at(Duration::minutes(10), t0 + Duration::minutes(5))
        .unwrap()
        .is_empty());

    let recovered = reclaimer
        .recover_stalled_at(Duration::minutes(10), t0 + Duration::minutes(11))
        .unwrap();
    assert_eq!(recovered, vec!["g-1".to_string()]);

    let record = store.get_record("g-1").unwrap().unwrap();
    assert_eq!(record.processing_stage, ProcessingStage::Pending);
    assert_eq!(record.picked_at, None);
}

#[test]
fn test_failed_download_requeued_and_claimed_again() {
    let (_db, store, _machine) = setup();
    store
        .insert_record_at(&NewRecord::new("g-1", now(), "https://calls.example/a.m4a"), now())
        .unwrap();

    let first = store.claim_pending_at(10, now()).unwrap();
    assert_eq!(first.len(), 1);
    store.mark_failed("g-1", "HTTP 404").unwrap();
    assert!(store.claim_pending_at(10, now()).unwrap().is_empty());

    store.set_stage("g-1", ProcessingStage::Pending).unwrap();
    let again = store.claim_pending_at(10, now() + Duration::minutes(1)).unwrap();
    assert_eq!(again.len(), 1);
    assert_eq!(again[0].call_uid, "g-1");
    assert_eq!(again[0].processing_stage, ProcessingStage::Downloading);
    assert_eq!(again[0].error, None);
    assert_eq!(again[0].retry_count, 1);
}

#[test]
fn test_oversized_windows_return_nothing() {
    let (db, store, machine) = setup();
    let at = now() - Duration::days(400);
    store
        .insert_record_at(&NewRecord::new("g-1", at, "https://calls.example/a.m4a"), at)
        .unwrap();
    machine.advance_at("g-1", Status::Downloaded, None, at).unwrap();

    let reclaimer = Reclaimer::new(db);
    assert!(reclaimer.find_stuck_at(u32::MAX, now()).unwrap().is_empty());
    assert!(reclaimer.resurrect_at(200_000_000, now()).unwrap().is_empty());
    assert!(reclaimer.resurrect_at(u32::MAX, now()).unwrap().is_empty());
    assert!(reclaimer
        .recover_stalled_at(Duration::days(i64::from(u32::MAX)), now())
        .unwrap()
        .is_empty());
}

//! Integration tests for PostgresExecutionStore
//!
//! Run with: cargo test -p windlass-durable --test postgres_store_test -- --test-threads=1
//!
//! Requirements:
//! - PostgreSQL reachable through DATABASE_URL (tests are skipped otherwise)
//! - The store applies its own migrations on first connect

use std::time::Duration;

use chrono::Utc;
use serde_json::json;
use sqlx::PgPool;
use uuid::Uuid;

use windlass_durable::persistence::{
    CancelOutcome, ExecutionStatus, ExecutionStore, FailureOutcome, NewExecution,
    PostgresExecutionStore, ResumeOutcome, StepResultPatch,
};
use windlass_durable::workflow::NewEvent;

/// Connect to the test database, or skip when none is configured
async fn try_store() -> Option<PostgresExecutionStore> {
    let url = std::env::var("DATABASE_URL").ok()?;
    let pool = PgPool::connect(&url)
        .await
        .expect("DATABASE_URL is set but unreachable");
    let store = PostgresExecutionStore::new(pool);
    store.migrate().await.expect("migrations should apply");
    Some(store)
}

macro_rules! require_store {
    () => {
        match try_store().await {
            Some(store) => store,
            None => {
                eprintln!("skipping: DATABASE_URL not set");
                return;
            }
        }
    };
}

#[tokio::test]
async fn test_execution_lifecycle() {
    let store = require_store!();

    let execution = store
        .create_execution(NewExecution::new("wf-lifecycle", json!({"k": "v"})))
        .await
        .unwrap();
    assert_eq!(execution.status, ExecutionStatus::Pending);
    assert_eq!(execution.retry_count, 0);

    let lease = store
        .acquire_lease(execution.id, Duration::from_secs(30))
        .await
        .unwrap()
        .expect("pending execution should be claimable");
    assert_eq!(lease.execution.status, ExecutionStatus::Running);

    // Second claim fails while the lease is live
    assert!(store
        .acquire_lease(execution.id, Duration::from_secs(30))
        .await
        .unwrap()
        .is_none());

    assert!(store
        .complete_execution(execution.id, lease.lock_id, json!({"done": true}))
        .await
        .unwrap());

    let row = store.get_execution(execution.id).await.unwrap().unwrap();
    assert_eq!(row.status, ExecutionStatus::Completed);
    assert_eq!(row.output, Some(json!({"done": true})));
    assert!(row.lock_id.is_none());

    // Terminal states are sticky
    assert!(store
        .acquire_lease(execution.id, Duration::from_secs(30))
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn test_stale_lock_write_is_absorbed() {
    let store = require_store!();

    let execution = store
        .create_execution(NewExecution::new("wf-stale", json!({})))
        .await
        .unwrap();

    let first = store
        .acquire_lease(execution.id, Duration::ZERO)
        .await
        .unwrap()
        .unwrap();
    tokio::time::sleep(Duration::from_millis(5)).await;

    let second = store
        .acquire_lease(execution.id, Duration::from_secs(30))
        .await
        .unwrap()
        .expect("expired lease should be reclaimable");
    assert_ne!(first.lock_id, second.lock_id);

    // The dead owner's writes no-op
    assert!(!store
        .complete_execution(execution.id, first.lock_id, json!({}))
        .await
        .unwrap());
    assert_eq!(
        store
            .fail_execution(execution.id, first.lock_id, "late", true, None)
            .await
            .unwrap(),
        FailureOutcome::Lost
    );
}

#[tokio::test]
async fn test_fail_requeues_then_exhausts() {
    let store = require_store!();

    let execution = store
        .create_execution(NewExecution::new("wf-retry", json!({})).with_max_retries(2))
        .await
        .unwrap();

    let lease = store
        .acquire_lease(execution.id, Duration::from_secs(30))
        .await
        .unwrap()
        .unwrap();
    let outcome = store
        .fail_execution(execution.id, lease.lock_id, "boom", true, None)
        .await
        .unwrap();
    assert!(outcome.will_retry());

    let row = store.get_execution(execution.id).await.unwrap().unwrap();
    assert_eq!(row.status, ExecutionStatus::Pending);
    assert_eq!(row.retry_count, 1);
    assert!(row.next_run_at_epoch_ms.is_some());

    // Backoff defers claiming until next_run_at
    assert!(store
        .find_pending(10, Duration::from_secs(30), Utc::now())
        .await
        .unwrap()
        .iter()
        .all(|l| l.id() != execution.id));

    let lease = store
        .acquire_lease(execution.id, Duration::from_secs(30))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(
        store
            .fail_execution(execution.id, lease.lock_id, "boom again", true, None)
            .await
            .unwrap(),
        FailureOutcome::Terminal
    );
}

#[tokio::test]
async fn test_step_result_upsert_is_idempotent() {
    let store = require_store!();

    let execution = store
        .create_execution(NewExecution::new("wf-steps", json!({})))
        .await
        .unwrap();

    let started = Utc::now();
    store
        .upsert_step_result(execution.id, "a", StepResultPatch::started(started))
        .await
        .unwrap();
    // Re-entry: a second started write keeps the original timestamp
    store
        .upsert_step_result(
            execution.id,
            "a",
            StepResultPatch::started(started + chrono::Duration::seconds(5)),
        )
        .await
        .unwrap();
    store
        .upsert_step_result(
            execution.id,
            "a",
            StepResultPatch::completed(Utc::now(), json!({"n": 1})),
        )
        .await
        .unwrap();

    let results = store.step_results(execution.id).await.unwrap();
    assert_eq!(results.len(), 1);
    let result = &results[0];
    assert!(result.is_replayable());
    assert_eq!(result.output, Some(json!({"n": 1})));
    let drift = (result.started_at.unwrap() - started).num_milliseconds().abs();
    assert!(drift < 1_000, "first started_at wins");
}

#[tokio::test]
async fn test_signals_consumed_once() {
    let store = require_store!();

    let execution = store
        .create_execution(NewExecution::new("wf-signals", json!({})))
        .await
        .unwrap();

    let event = store
        .append_event(
            execution.id,
            NewEvent::signal("approve", Some(json!({"ok": true}))),
        )
        .await
        .unwrap();

    let pending = store.pending_signals(execution.id).await.unwrap();
    assert_eq!(pending.len(), 1);

    assert!(store.consume_event(event.id).await.unwrap());
    assert!(!store.consume_event(event.id).await.unwrap());
    assert!(store.pending_signals(execution.id).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_timer_idempotency_and_wake() {
    let store = require_store!();

    let execution = store
        .create_execution(NewExecution::new("wf-timers", json!({})))
        .await
        .unwrap();
    let lease = store
        .acquire_lease(execution.id, Duration::from_secs(30))
        .await
        .unwrap()
        .unwrap();

    let wake_at = Utc::now() - chrono::Duration::seconds(1);
    store
        .schedule_timer(execution.id, "nap", wake_at)
        .await
        .unwrap();
    // Duplicate schedules are ignored
    store
        .schedule_timer(execution.id, "nap", wake_at + chrono::Duration::hours(1))
        .await
        .unwrap();
    assert_eq!(store.events(execution.id).await.unwrap().len(), 1);

    assert!(store
        .set_sleeping(execution.id, lease.lock_id, "nap", wake_at)
        .await
        .unwrap());

    let woken = store.wake_due(Utc::now(), 10).await.unwrap();
    assert!(woken >= 1);
    let row = store.get_execution(execution.id).await.unwrap().unwrap();
    assert_eq!(row.status, ExecutionStatus::Pending);

    let timer = store
        .check_timer(execution.id, "nap")
        .await
        .unwrap()
        .expect("due timer");
    assert!(store.consume_event(timer.id).await.unwrap());
}

#[tokio::test]
async fn test_output_events_unique_per_step() {
    let store = require_store!();

    let execution = store
        .create_execution(NewExecution::new("wf-outputs", json!({})))
        .await
        .unwrap();

    let first = store
        .append_event(execution.id, NewEvent::output("a", json!(1)))
        .await
        .unwrap();
    let second = store
        .append_event(execution.id, NewEvent::output("a", json!(2)))
        .await
        .unwrap();
    assert_eq!(first.id, second.id);
    assert_eq!(first.payload, second.payload);
}

#[tokio::test]
async fn test_cancel_resume_round_trip() {
    let store = require_store!();

    let execution = store
        .create_execution(NewExecution::new("wf-cancel", json!({})))
        .await
        .unwrap();
    store
        .upsert_step_result(
            execution.id,
            "a",
            StepResultPatch::completed(Utc::now(), json!(1)),
        )
        .await
        .unwrap();

    assert_eq!(
        store.cancel_execution(execution.id).await.unwrap(),
        CancelOutcome::Cancelled
    );
    assert_eq!(
        store.cancel_execution(execution.id).await.unwrap(),
        CancelOutcome::AlreadyCancelled
    );
    assert_eq!(
        store.cancel_execution(Uuid::now_v7()).await.unwrap(),
        CancelOutcome::NotFound
    );

    assert_eq!(
        store.resume_execution(execution.id, true).await.unwrap(),
        ResumeOutcome::Resumed
    );

    let row = store.get_execution(execution.id).await.unwrap().unwrap();
    assert_eq!(row.status, ExecutionStatus::Pending);
    assert_eq!(row.retry_count, 0);
    assert!(row.error.is_none());

    // Step results survive cancel/resume
    assert_eq!(store.step_results(execution.id).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_concurrent_finders_claim_disjoint_rows() {
    let store = require_store!();

    let mut ids = Vec::new();
    for _ in 0..4 {
        ids.push(
            store
                .create_execution(NewExecution::new("wf-contend", json!({})))
                .await
                .unwrap()
                .id,
        );
    }

    let (a, b) = tokio::join!(
        store.find_pending(10, Duration::from_secs(30), Utc::now()),
        store.find_pending(10, Duration::from_secs(30), Utc::now()),
    );
    let a = a.unwrap();
    let b = b.unwrap();

    for claimed_a in &a {
        assert!(
            b.iter().all(|claimed_b| claimed_b.id() != claimed_a.id()),
            "no row may be claimed by both finders"
        );
    }
}

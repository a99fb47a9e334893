//! Wait-for-signal steps
//!
//! The first unconsumed signal row matching the declared name completes the
//! step; consumption is a per-row CAS, so every signal is delivered to at
//! most one step even with a contending worker. Timeouts are measured from
//! the persisted `started_at` and checked on every re-entry.

use std::time::Duration;

use chrono::{Duration as ChronoDuration, Utc};
use serde_json::json;
use tracing::debug;
use uuid::Uuid;

use super::runner::{StepRun, Suspension};
use super::StepError;
use crate::persistence::{ExecutionStore, StepResult};

pub(super) async fn run(
    store: &dyn ExecutionStore,
    execution_id: Uuid,
    step_name: &str,
    signal_name: &str,
    timeout_ms: Option<u64>,
    prior: Option<&StepResult>,
) -> Result<StepRun, StepError> {
    let started_at = prior
        .and_then(|r| r.started_at)
        .unwrap_or_else(Utc::now);

    // created_at order gives per-name FIFO delivery
    let signals = store.pending_signals(execution_id).await?;
    for signal in signals {
        if signal.name.as_deref() != Some(signal_name) {
            continue;
        }
        if !store.consume_event(signal.id).await? {
            // Another reader won the CAS; keep scanning
            continue;
        }

        // The timeout timer is moot once the signal lands
        store.cancel_timer(execution_id, step_name).await?;

        let received_at = Utc::now();
        debug!(%execution_id, step_name, signal_name, "signal consumed");
        return Ok(StepRun::Completed(json!({
            "signalName": signal_name,
            "payload": signal.payload,
            "receivedAt": received_at,
            "waitDurationMs": (received_at - started_at).num_milliseconds().max(0),
        })));
    }

    let timeout_at = timeout_ms.map(|ms| started_at + ChronoDuration::milliseconds(ms as i64));
    if let Some(timeout_at) = timeout_at {
        if Utc::now() >= timeout_at {
            return Err(StepError::SignalTimeout(Duration::from_millis(
                timeout_ms.unwrap_or_default(),
            )));
        }
    }

    Ok(StepRun::Suspended(Suspension::Signal {
        signal_name: signal_name.to_string(),
        timeout_at,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::{InMemoryExecutionStore, NewExecution, StepResultPatch};
    use crate::workflow::NewEvent;

    async fn execution(store: &InMemoryExecutionStore) -> Uuid {
        store
            .create_execution(NewExecution::new("wf", json!({})))
            .await
            .unwrap()
            .id
    }

    #[tokio::test]
    async fn test_waits_when_no_signal() {
        let store = InMemoryExecutionStore::new();
        let id = execution(&store).await;

        let run = run(&store, id, "gate", "approve", Some(60_000), None)
            .await
            .unwrap();

        match run {
            StepRun::Suspended(Suspension::Signal {
                signal_name,
                timeout_at,
            }) => {
                assert_eq!(signal_name, "approve");
                assert!(timeout_at.is_some());
            }
            other => panic!("expected suspension, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_matching_signal_completes() {
        let store = InMemoryExecutionStore::new();
        let id = execution(&store).await;

        store
            .append_event(id, NewEvent::signal("other", None))
            .await
            .unwrap();
        store
            .append_event(id, NewEvent::signal("approve", Some(json!({"ok": true}))))
            .await
            .unwrap();

        let run = run(&store, id, "gate", "approve", None, None).await.unwrap();
        match run {
            StepRun::Completed(output) => {
                assert_eq!(output["signalName"], json!("approve"));
                assert_eq!(output["payload"], json!({"ok": true}));
                assert!(output["waitDurationMs"].as_i64().unwrap() >= 0);
            }
            other => panic!("expected completion, got {other:?}"),
        }

        // The non-matching signal stays deliverable
        let remaining = store.pending_signals(id).await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].name.as_deref(), Some("other"));
    }

    #[tokio::test]
    async fn test_elapsed_timeout_fails() {
        let store = InMemoryExecutionStore::new();
        let id = execution(&store).await;

        // The wait started 70 seconds ago with a 60 second window
        let started_at = Utc::now() - ChronoDuration::seconds(70);
        store
            .upsert_step_result(id, "gate", StepResultPatch::started(started_at))
            .await
            .unwrap();
        let prior = store.step_result(id, "gate").unwrap();

        let err = run(&store, id, "gate", "approve", Some(60_000), Some(&prior))
            .await
            .unwrap_err();

        assert!(matches!(err, StepError::SignalTimeout(_)));
        assert!(err.to_string().contains("timed out"));
    }

    #[tokio::test]
    async fn test_signals_delivered_in_order() {
        let store = InMemoryExecutionStore::new();
        let id = execution(&store).await;

        store
            .append_event(id, NewEvent::signal("approve", Some(json!({"seq": 1}))))
            .await
            .unwrap();
        store
            .append_event(id, NewEvent::signal("approve", Some(json!({"seq": 2}))))
            .await
            .unwrap();

        let first = run(&store, id, "gate", "approve", None, None).await.unwrap();
        match first {
            StepRun::Completed(output) => assert_eq!(output["payload"], json!({"seq": 1})),
            other => panic!("expected completion, got {other:?}"),
        }
    }
}

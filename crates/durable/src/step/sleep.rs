//! Sleep steps: inline waits and durable timers
//!
//! The wake instant is derived from the persisted `started_at`, so a replay
//! computes the same instant a non-crashing run would have. Short waits run
//! inline; anything longer schedules an idempotent timer event and suspends.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
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
    sleep_ms: Option<u64>,
    sleep_until: Option<DateTime<Utc>>,
    prior: Option<&StepResult>,
    inline_budget: std::time::Duration,
) -> Result<StepRun, StepError> {
    let started_at = prior
        .and_then(|r| r.started_at)
        .unwrap_or_else(Utc::now);

    let wake_at = match (sleep_ms, sleep_until) {
        (Some(ms), None) => started_at + ChronoDuration::milliseconds(ms as i64),
        (None, Some(at)) => at,
        _ => {
            return Err(StepError::Definition(format!(
                "sleep step '{step_name}' must declare exactly one of sleep_ms or sleep_until"
            )))
        }
    };

    let slept = json!({
        "sleepDurationMs": (wake_at - started_at).num_milliseconds().max(0),
    });

    // A fired timer means the durable wait is over
    if let Some(timer) = store.check_timer(execution_id, step_name).await? {
        store.consume_event(timer.id).await?;
        debug!(%execution_id, step_name, "durable sleep finished");
        return Ok(StepRun::Completed(slept));
    }

    let remaining = wake_at - Utc::now();
    if remaining <= ChronoDuration::from_std(inline_budget).unwrap_or_default() {
        if let Ok(wait) = remaining.to_std() {
            tokio::time::sleep(wait).await;
        }
        return Ok(StepRun::Completed(slept));
    }

    store.schedule_timer(execution_id, step_name, wake_at).await?;
    debug!(%execution_id, step_name, %wake_at, "durable sleep scheduled");
    Ok(StepRun::Suspended(Suspension::Sleep { wake_at }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::{InMemoryExecutionStore, NewExecution, StepResultPatch};
    use std::time::Duration;

    async fn execution(store: &InMemoryExecutionStore) -> Uuid {
        store
            .create_execution(NewExecution::new("wf", json!({})))
            .await
            .unwrap()
            .id
    }

    #[tokio::test]
    async fn test_short_sleep_runs_inline() {
        let store = InMemoryExecutionStore::new();
        let id = execution(&store).await;

        let run = run(
            &store,
            id,
            "nap",
            Some(10),
            None,
            None,
            Duration::from_secs(25),
        )
        .await
        .unwrap();

        match run {
            StepRun::Completed(output) => {
                assert_eq!(output["sleepDurationMs"], json!(10));
            }
            other => panic!("expected completion, got {other:?}"),
        }
        // No timer was written for an inline sleep
        assert!(store.events(id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_long_sleep_suspends_with_timer() {
        let store = InMemoryExecutionStore::new();
        let id = execution(&store).await;

        let run = run(
            &store,
            id,
            "nap",
            Some(3_600_000),
            None,
            None,
            Duration::from_secs(25),
        )
        .await
        .unwrap();

        assert!(matches!(
            run,
            StepRun::Suspended(Suspension::Sleep { .. })
        ));
        assert_eq!(store.events(id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_fired_timer_completes_with_full_duration() {
        let store = InMemoryExecutionStore::new();
        let id = execution(&store).await;

        // Replay state: the step started an hour ago and its timer is due
        let started_at = Utc::now() - ChronoDuration::milliseconds(3_600_000);
        store
            .upsert_step_result(id, "nap", StepResultPatch::started(started_at))
            .await
            .unwrap();
        store
            .schedule_timer(id, "nap", started_at + ChronoDuration::milliseconds(3_600_000))
            .await
            .unwrap();

        let prior = store.step_result(id, "nap").unwrap();
        let run = run(
            &store,
            id,
            "nap",
            Some(3_600_000),
            None,
            Some(&prior),
            Duration::from_secs(25),
        )
        .await
        .unwrap();

        match run {
            StepRun::Completed(output) => {
                assert!(output["sleepDurationMs"].as_i64().unwrap() >= 3_600_000);
            }
            other => panic!("expected completion, got {other:?}"),
        }

        // The timer is consumed exactly once
        assert!(store.check_timer(id, "nap").await.unwrap().is_none());
    }
}

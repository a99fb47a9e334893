//! In-memory implementation of ExecutionStore for testing

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use uuid::Uuid;

use super::store::*;
use crate::workflow::{EventType, ExecutionEvent, NewEvent};

/// In-memory implementation of ExecutionStore
///
/// Primarily for tests. All data lives in process memory with the same CAS
/// semantics as the SQL implementations.
///
/// # Example
///
/// ```
/// use windlass_durable::persistence::InMemoryExecutionStore;
///
/// let store = InMemoryExecutionStore::new();
/// ```
pub struct InMemoryExecutionStore {
    executions: RwLock<HashMap<Uuid, Execution>>,
    step_results: RwLock<HashMap<(Uuid, String), StepResult>>,
    events: RwLock<Vec<ExecutionEvent>>,
    chunks: RwLock<Vec<StepStreamChunk>>,
    backoff_base_ms: u64,
    backoff_cap_ms: u64,
}

impl InMemoryExecutionStore {
    /// Create a new in-memory store
    pub fn new() -> Self {
        Self {
            executions: RwLock::new(HashMap::new()),
            step_results: RwLock::new(HashMap::new()),
            events: RwLock::new(Vec::new()),
            chunks: RwLock::new(Vec::new()),
            backoff_base_ms: 1_000,
            backoff_cap_ms: 300_000,
        }
    }

    /// Override the default retry backoff
    pub fn with_backoff(mut self, base_ms: u64, cap_ms: u64) -> Self {
        self.backoff_base_ms = base_ms;
        self.backoff_cap_ms = cap_ms;
        self
    }

    /// Number of executions
    pub fn execution_count(&self) -> usize {
        self.executions.read().len()
    }

    /// Look up one step result (test helper)
    pub fn step_result(&self, execution_id: Uuid, step_id: &str) -> Option<StepResult> {
        self.step_results
            .read()
            .get(&(execution_id, step_id.to_string()))
            .cloned()
    }

    /// Clear all data (for testing)
    pub fn clear(&self) {
        self.executions.write().clear();
        self.step_results.write().clear();
        self.events.write().clear();
        self.chunks.write().clear();
    }

    fn default_backoff(&self, retry_count: u32) -> Duration {
        crate::workflow::execution_backoff(self.backoff_base_ms, retry_count, self.backoff_cap_ms)
    }
}

impl Default for InMemoryExecutionStore {
    fn default() -> Self {
        Self::new()
    }
}

fn claimable(execution: &Execution, now_ms: i64) -> bool {
    matches!(
        execution.status,
        ExecutionStatus::Pending | ExecutionStatus::Running
    ) && execution.retry_count < execution.max_retries
        && execution
            .locked_until_epoch_ms
            .map(|until| until < now_ms)
            .unwrap_or(true)
}

fn claim(execution: &mut Execution, lease: Duration, now: DateTime<Utc>) -> LeasedExecution {
    let now_ms = epoch_ms(now);
    let lock_id = Uuid::new_v4();
    execution.lock_id = Some(lock_id);
    execution.locked_until_epoch_ms = Some(now_ms + lease.as_millis() as i64);
    if execution.status == ExecutionStatus::Pending {
        execution.status = ExecutionStatus::Running;
    }
    execution.started_at_epoch_ms.get_or_insert(now_ms);
    execution.updated_at = now;

    LeasedExecution {
        execution: execution.clone(),
        lock_id,
    }
}

#[async_trait]
impl ExecutionStore for InMemoryExecutionStore {
    async fn create_execution(&self, new: NewExecution) -> Result<Execution, StoreError> {
        let now = Utc::now();
        let execution = Execution {
            id: Uuid::now_v7(),
            workflow_id: new.workflow_id,
            status: ExecutionStatus::Pending,
            input: new.input,
            output: None,
            error: None,
            retry_count: 0,
            max_retries: new.max_retries,
            lock_id: None,
            locked_until_epoch_ms: None,
            next_run_at_epoch_ms: None,
            started_at_epoch_ms: None,
            completed_at_epoch_ms: None,
            parent_execution_id: new.parent_execution_id,
            created_at: now,
            updated_at: now,
        };

        self.executions
            .write()
            .insert(execution.id, execution.clone());
        Ok(execution)
    }

    async fn get_execution(&self, id: Uuid) -> Result<Option<Execution>, StoreError> {
        Ok(self.executions.read().get(&id).cloned())
    }

    async fn acquire_lease(
        &self,
        id: Uuid,
        lease: Duration,
    ) -> Result<Option<LeasedExecution>, StoreError> {
        let now = Utc::now();
        let mut executions = self.executions.write();
        let Some(execution) = executions.get_mut(&id) else {
            return Ok(None);
        };

        if !claimable(execution, epoch_ms(now)) {
            return Ok(None);
        }

        Ok(Some(claim(execution, lease, now)))
    }

    async fn release_lease(&self, id: Uuid, lock_id: Uuid) -> Result<(), StoreError> {
        let mut executions = self.executions.write();
        if let Some(execution) = executions.get_mut(&id) {
            if execution.lock_id == Some(lock_id) {
                execution.lock_id = None;
                execution.locked_until_epoch_ms = None;
                execution.updated_at = Utc::now();
            }
        }
        Ok(())
    }

    async fn find_pending(
        &self,
        limit: usize,
        lease: Duration,
        scheduled_before: DateTime<Utc>,
    ) -> Result<Vec<LeasedExecution>, StoreError> {
        let now = Utc::now();
        let now_ms = epoch_ms(now);
        let before_ms = epoch_ms(scheduled_before);
        let mut executions = self.executions.write();

        let mut ids: Vec<Uuid> = executions
            .values()
            .filter(|e| {
                claimable(e, now_ms)
                    && e.next_run_at_epoch_ms
                        .map(|at| at <= before_ms)
                        .unwrap_or(true)
            })
            .map(|e| e.id)
            .collect();
        ids.sort_by_key(|id| executions[id].created_at);
        ids.truncate(limit);

        Ok(ids
            .into_iter()
            .filter_map(|id| executions.get_mut(&id).map(|e| claim(e, lease, now)))
            .collect())
    }

    async fn complete_execution(
        &self,
        id: Uuid,
        lock_id: Uuid,
        output: serde_json::Value,
    ) -> Result<bool, StoreError> {
        let now = Utc::now();
        let mut executions = self.executions.write();
        let Some(execution) = executions.get_mut(&id) else {
            return Ok(false);
        };

        if execution.lock_id != Some(lock_id) || execution.is_terminal() {
            return Ok(false);
        }

        execution.status = ExecutionStatus::Completed;
        execution.output = Some(output);
        execution.error = None;
        execution.completed_at_epoch_ms = Some(epoch_ms(now));
        execution.lock_id = None;
        execution.locked_until_epoch_ms = None;
        execution.updated_at = now;
        Ok(true)
    }

    async fn fail_execution(
        &self,
        id: Uuid,
        lock_id: Uuid,
        error: &str,
        retryable: bool,
        retry_delay: Option<Duration>,
    ) -> Result<FailureOutcome, StoreError> {
        let now = Utc::now();
        let mut executions = self.executions.write();
        let Some(execution) = executions.get_mut(&id) else {
            return Ok(FailureOutcome::Lost);
        };

        if execution.lock_id != Some(lock_id) || execution.is_terminal() {
            return Ok(FailureOutcome::Lost);
        }

        execution.error = Some(error.to_string());
        execution.lock_id = None;
        execution.locked_until_epoch_ms = None;
        execution.updated_at = now;

        if retryable && execution.retry_count + 1 < execution.max_retries {
            let delay = retry_delay.unwrap_or_else(|| self.default_backoff(execution.retry_count));
            let next_run_at = now + chrono::Duration::from_std(delay).unwrap_or_default();
            execution.retry_count += 1;
            execution.status = ExecutionStatus::Pending;
            execution.next_run_at_epoch_ms = Some(epoch_ms(next_run_at));
            Ok(FailureOutcome::WillRetry { next_run_at })
        } else {
            execution.status = ExecutionStatus::Failed;
            execution.completed_at_epoch_ms = Some(epoch_ms(now));
            Ok(FailureOutcome::Terminal)
        }
    }

    async fn set_sleeping(
        &self,
        id: Uuid,
        lock_id: Uuid,
        _step: &str,
        _wake_at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let mut executions = self.executions.write();
        let Some(execution) = executions.get_mut(&id) else {
            return Ok(false);
        };

        if execution.lock_id != Some(lock_id) || execution.status != ExecutionStatus::Running {
            return Ok(false);
        }

        execution.status = ExecutionStatus::Sleeping;
        execution.lock_id = None;
        execution.locked_until_epoch_ms = None;
        execution.next_run_at_epoch_ms = None;
        execution.updated_at = Utc::now();
        Ok(true)
    }

    async fn set_waiting(
        &self,
        id: Uuid,
        lock_id: Uuid,
        _step: &str,
        _signal_name: &str,
        _timeout_at: Option<DateTime<Utc>>,
    ) -> Result<bool, StoreError> {
        let mut executions = self.executions.write();
        let Some(execution) = executions.get_mut(&id) else {
            return Ok(false);
        };

        if execution.lock_id != Some(lock_id) || execution.status != ExecutionStatus::Running {
            return Ok(false);
        }

        execution.status = ExecutionStatus::WaitingForSignal;
        execution.lock_id = None;
        execution.locked_until_epoch_ms = None;
        execution.next_run_at_epoch_ms = None;
        execution.updated_at = Utc::now();
        Ok(true)
    }

    async fn cancel_execution(&self, id: Uuid) -> Result<CancelOutcome, StoreError> {
        let now = Utc::now();
        let mut executions = self.executions.write();
        let Some(execution) = executions.get_mut(&id) else {
            return Ok(CancelOutcome::NotFound);
        };

        match execution.status {
            ExecutionStatus::Cancelled => Ok(CancelOutcome::AlreadyCancelled),
            ExecutionStatus::Completed | ExecutionStatus::Failed => {
                Ok(CancelOutcome::NotCancellable)
            }
            _ => {
                execution.status = ExecutionStatus::Cancelled;
                execution.completed_at_epoch_ms = Some(epoch_ms(now));
                execution.lock_id = None;
                execution.locked_until_epoch_ms = None;
                execution.updated_at = now;
                Ok(CancelOutcome::Cancelled)
            }
        }
    }

    async fn resume_execution(
        &self,
        id: Uuid,
        reset_retries: bool,
    ) -> Result<ResumeOutcome, StoreError> {
        let mut executions = self.executions.write();
        let Some(execution) = executions.get_mut(&id) else {
            return Ok(ResumeOutcome::NotFound);
        };

        if !matches!(
            execution.status,
            ExecutionStatus::Cancelled | ExecutionStatus::Failed
        ) {
            return Ok(ResumeOutcome::NotResumable);
        }

        execution.status = ExecutionStatus::Pending;
        execution.error = None;
        execution.completed_at_epoch_ms = None;
        execution.lock_id = None;
        execution.locked_until_epoch_ms = None;
        execution.next_run_at_epoch_ms = None;
        if reset_retries {
            execution.retry_count = 0;
        }
        execution.updated_at = Utc::now();
        Ok(ResumeOutcome::Resumed)
    }

    async fn reschedule(&self, id: Uuid, run_at: DateTime<Utc>) -> Result<(), StoreError> {
        let mut executions = self.executions.write();
        let execution = executions
            .get_mut(&id)
            .ok_or(StoreError::ExecutionNotFound(id))?;
        execution.next_run_at_epoch_ms = Some(epoch_ms(run_at));
        execution.updated_at = Utc::now();
        Ok(())
    }

    async fn wake_due(&self, now: DateTime<Utc>, limit: usize) -> Result<u64, StoreError> {
        let events = self.events.read();
        let due: Vec<Uuid> = events
            .iter()
            .filter(|e| e.event_type == EventType::Timer && e.is_pending() && e.is_due(now))
            .map(|e| e.execution_id)
            .collect();
        drop(events);

        let mut woken = 0u64;
        let mut executions = self.executions.write();
        for id in due {
            if woken as usize >= limit {
                break;
            }
            if let Some(execution) = executions.get_mut(&id) {
                if matches!(
                    execution.status,
                    ExecutionStatus::Sleeping | ExecutionStatus::WaitingForSignal
                ) {
                    execution.status = ExecutionStatus::Pending;
                    execution.next_run_at_epoch_ms = None;
                    execution.updated_at = now;
                    woken += 1;
                }
            }
        }
        Ok(woken)
    }

    async fn wake_for_signal(&self, id: Uuid) -> Result<bool, StoreError> {
        let mut executions = self.executions.write();
        let Some(execution) = executions.get_mut(&id) else {
            return Ok(false);
        };

        if execution.status != ExecutionStatus::WaitingForSignal {
            return Ok(false);
        }

        execution.status = ExecutionStatus::Pending;
        execution.next_run_at_epoch_ms = None;
        execution.updated_at = Utc::now();
        Ok(true)
    }

    async fn upsert_step_result(
        &self,
        execution_id: Uuid,
        step_id: &str,
        patch: StepResultPatch,
    ) -> Result<(), StoreError> {
        let mut step_results = self.step_results.write();
        let entry = step_results
            .entry((execution_id, step_id.to_string()))
            .or_insert_with(|| StepResult {
                execution_id,
                step_id: step_id.to_string(),
                attempt: 0,
                started_at: None,
                completed_at: None,
                output: None,
                error: None,
            });

        if let Some(attempt) = patch.attempt {
            entry.attempt = attempt;
        }
        if let Some(at) = patch.started_at {
            entry.started_at.get_or_insert(at);
        }
        if let Some(at) = patch.completed_at {
            entry.completed_at = Some(at);
        }
        if let Some(output) = patch.output {
            entry.output = Some(output);
        }
        if patch.clear_error {
            entry.error = None;
        } else if let Some(error) = patch.error {
            entry.error = Some(error);
        }
        Ok(())
    }

    async fn step_results(&self, execution_id: Uuid) -> Result<Vec<StepResult>, StoreError> {
        let mut results: Vec<StepResult> = self
            .step_results
            .read()
            .values()
            .filter(|r| r.execution_id == execution_id)
            .cloned()
            .collect();
        results.sort_by(|a, b| a.started_at.cmp(&b.started_at));
        Ok(results)
    }

    async fn append_event(
        &self,
        execution_id: Uuid,
        event: NewEvent,
    ) -> Result<ExecutionEvent, StoreError> {
        let mut events = self.events.write();

        // per-(execution, name) uniqueness for output events
        if event.event_type == EventType::Output {
            if let Some(existing) = events.iter().find(|e| {
                e.execution_id == execution_id
                    && e.event_type == EventType::Output
                    && e.name == event.name
            }) {
                return Ok(existing.clone());
            }
        }

        let row = ExecutionEvent {
            id: Uuid::now_v7(),
            execution_id,
            event_type: event.event_type,
            name: event.name,
            payload: event.payload,
            created_at: Utc::now(),
            visible_at: event.visible_at,
            consumed_at: None,
        };
        events.push(row.clone());
        Ok(row)
    }

    async fn events(&self, execution_id: Uuid) -> Result<Vec<ExecutionEvent>, StoreError> {
        Ok(self
            .events
            .read()
            .iter()
            .filter(|e| e.execution_id == execution_id)
            .cloned()
            .collect())
    }

    async fn pending_signals(
        &self,
        execution_id: Uuid,
    ) -> Result<Vec<ExecutionEvent>, StoreError> {
        Ok(self
            .events
            .read()
            .iter()
            .filter(|e| {
                e.execution_id == execution_id
                    && e.event_type == EventType::Signal
                    && e.is_pending()
            })
            .cloned()
            .collect())
    }

    async fn consume_event(&self, event_id: Uuid) -> Result<bool, StoreError> {
        let mut events = self.events.write();
        match events
            .iter_mut()
            .find(|e| e.id == event_id && e.consumed_at.is_none())
        {
            Some(event) => {
                event.consumed_at = Some(Utc::now());
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn check_timer(
        &self,
        execution_id: Uuid,
        step: &str,
    ) -> Result<Option<ExecutionEvent>, StoreError> {
        let now = Utc::now();
        Ok(self
            .events
            .read()
            .iter()
            .find(|e| {
                e.execution_id == execution_id
                    && e.event_type == EventType::Timer
                    && e.name.as_deref() == Some(step)
                    && e.is_pending()
                    && e.is_due(now)
            })
            .cloned())
    }

    async fn schedule_timer(
        &self,
        execution_id: Uuid,
        step: &str,
        wake_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut events = self.events.write();
        let exists = events.iter().any(|e| {
            e.execution_id == execution_id
                && e.event_type == EventType::Timer
                && e.name.as_deref() == Some(step)
        });
        if exists {
            return Ok(());
        }

        events.push(ExecutionEvent {
            id: Uuid::now_v7(),
            execution_id,
            event_type: EventType::Timer,
            name: Some(step.to_string()),
            payload: None,
            created_at: Utc::now(),
            visible_at: Some(wake_at),
            consumed_at: None,
        });
        Ok(())
    }

    async fn cancel_timer(&self, execution_id: Uuid, step: &str) -> Result<(), StoreError> {
        let mut events = self.events.write();
        if let Some(event) = events.iter_mut().find(|e| {
            e.execution_id == execution_id
                && e.event_type == EventType::Timer
                && e.name.as_deref() == Some(step)
                && e.consumed_at.is_none()
        }) {
            event.consumed_at = Some(Utc::now());
        }
        Ok(())
    }

    async fn append_stream_chunk(
        &self,
        execution_id: Uuid,
        step_id: &str,
        chunk_index: u32,
        data: serde_json::Value,
    ) -> Result<(), StoreError> {
        self.chunks.write().push(StepStreamChunk {
            execution_id,
            step_id: step_id.to_string(),
            chunk_index,
            data,
        });
        Ok(())
    }

    async fn stream_chunks(
        &self,
        execution_id: Uuid,
        step_id: &str,
    ) -> Result<Vec<StepStreamChunk>, StoreError> {
        let mut chunks: Vec<StepStreamChunk> = self
            .chunks
            .read()
            .iter()
            .filter(|c| c.execution_id == execution_id && c.step_id == step_id)
            .cloned()
            .collect();
        chunks.sort_by_key(|c| c.chunk_index);
        Ok(chunks)
    }

    async fn clear_stream_chunks(
        &self,
        execution_id: Uuid,
        step_id: &str,
    ) -> Result<(), StoreError> {
        self.chunks
            .write()
            .retain(|c| !(c.execution_id == execution_id && c.step_id == step_id));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    async fn pending_execution(store: &InMemoryExecutionStore) -> Execution {
        store
            .create_execution(NewExecution::new("wf", json!({})))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_create_and_get() {
        let store = InMemoryExecutionStore::new();
        let execution = pending_execution(&store).await;

        let fetched = store.get_execution(execution.id).await.unwrap().unwrap();
        assert_eq!(fetched.status, ExecutionStatus::Pending);
        assert_eq!(fetched.retry_count, 0);
    }

    #[tokio::test]
    async fn test_lease_is_exclusive() {
        let store = InMemoryExecutionStore::new();
        let execution = pending_execution(&store).await;
        let lease = Duration::from_secs(30);

        let first = store.acquire_lease(execution.id, lease).await.unwrap();
        assert!(first.is_some());

        // Second claim fails while the lease is live
        let second = store.acquire_lease(execution.id, lease).await.unwrap();
        assert!(second.is_none());
    }

    #[tokio::test]
    async fn test_expired_lease_is_reclaimable() {
        let store = InMemoryExecutionStore::new();
        let execution = pending_execution(&store).await;

        let first = store
            .acquire_lease(execution.id, Duration::ZERO)
            .await
            .unwrap()
            .unwrap();

        // Lease of zero duration expires immediately; a new owner takes over
        tokio::time::sleep(Duration::from_millis(5)).await;
        let second = store
            .acquire_lease(execution.id, Duration::from_secs(30))
            .await
            .unwrap()
            .unwrap();
        assert_ne!(first.lock_id, second.lock_id);

        // The old owner's terminal write is absorbed
        let stale = store
            .complete_execution(execution.id, first.lock_id, json!({}))
            .await
            .unwrap();
        assert!(!stale);
    }

    #[tokio::test]
    async fn test_terminal_execution_not_claimable() {
        let store = InMemoryExecutionStore::new();
        let execution = pending_execution(&store).await;

        let lease = store
            .acquire_lease(execution.id, Duration::from_secs(30))
            .await
            .unwrap()
            .unwrap();
        assert!(store
            .complete_execution(execution.id, lease.lock_id, json!({"done": true}))
            .await
            .unwrap());

        let again = store
            .acquire_lease(execution.id, Duration::from_secs(30))
            .await
            .unwrap();
        assert!(again.is_none());
    }

    #[tokio::test]
    async fn test_fail_requeues_with_backoff_until_exhausted() {
        let store = InMemoryExecutionStore::new();
        let execution = store
            .create_execution(NewExecution::new("wf", json!({})).with_max_retries(2))
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

        // Budget exhausted on the next failure
        let lease = store
            .acquire_lease(execution.id, Duration::from_secs(30))
            .await
            .unwrap()
            .unwrap();
        let outcome = store
            .fail_execution(execution.id, lease.lock_id, "boom again", true, None)
            .await
            .unwrap();
        assert_eq!(outcome, FailureOutcome::Terminal);

        let row = store.get_execution(execution.id).await.unwrap().unwrap();
        assert_eq!(row.status, ExecutionStatus::Failed);
        assert_eq!(row.error.as_deref(), Some("boom again"));
    }

    #[tokio::test]
    async fn test_find_pending_respects_next_run_at() {
        let store = InMemoryExecutionStore::new();
        let execution = pending_execution(&store).await;
        store
            .reschedule(execution.id, Utc::now() + chrono::Duration::hours(1))
            .await
            .unwrap();

        let leased = store
            .find_pending(10, Duration::from_secs(30), Utc::now())
            .await
            .unwrap();
        assert!(leased.is_empty());

        let leased = store
            .find_pending(
                10,
                Duration::from_secs(30),
                Utc::now() + chrono::Duration::hours(2),
            )
            .await
            .unwrap();
        assert_eq!(leased.len(), 1);
    }

    #[tokio::test]
    async fn test_cancel_then_resume_round_trip() {
        let store = InMemoryExecutionStore::new();
        let execution = pending_execution(&store).await;
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
            store.resume_execution(execution.id, true).await.unwrap(),
            ResumeOutcome::Resumed
        );

        let row = store.get_execution(execution.id).await.unwrap().unwrap();
        assert_eq!(row.status, ExecutionStatus::Pending);
        assert_eq!(row.retry_count, 0);
        // Step results survive the round trip
        assert!(store.step_result(execution.id, "a").is_some());
    }

    #[tokio::test]
    async fn test_signal_consumed_once() {
        let store = InMemoryExecutionStore::new();
        let execution = pending_execution(&store).await;

        let event = store
            .append_event(
                execution.id,
                NewEvent::signal("approve", Some(json!({"ok": true}))),
            )
            .await
            .unwrap();

        let signals = store.pending_signals(execution.id).await.unwrap();
        assert_eq!(signals.len(), 1);

        assert!(store.consume_event(event.id).await.unwrap());
        assert!(!store.consume_event(event.id).await.unwrap());
        assert!(store.pending_signals(execution.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_timer_idempotent_and_due() {
        let store = InMemoryExecutionStore::new();
        let execution = pending_execution(&store).await;
        let wake_at = Utc::now() - chrono::Duration::seconds(1);

        store
            .schedule_timer(execution.id, "nap", wake_at)
            .await
            .unwrap();
        store
            .schedule_timer(execution.id, "nap", wake_at + chrono::Duration::hours(1))
            .await
            .unwrap();

        let events = store.events(execution.id).await.unwrap();
        assert_eq!(events.len(), 1);

        let timer = store.check_timer(execution.id, "nap").await.unwrap();
        assert!(timer.is_some());
        // Original fire time wins over the duplicate schedule
        assert_eq!(timer.unwrap().visible_at, Some(wake_at));
    }

    #[tokio::test]
    async fn test_wake_due_flips_sleeping_to_pending() {
        let store = InMemoryExecutionStore::new();
        let execution = pending_execution(&store).await;

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
        assert!(store
            .set_sleeping(execution.id, lease.lock_id, "nap", wake_at)
            .await
            .unwrap());

        let woken = store.wake_due(Utc::now(), 10).await.unwrap();
        assert_eq!(woken, 1);

        let row = store.get_execution(execution.id).await.unwrap().unwrap();
        assert_eq!(row.status, ExecutionStatus::Pending);
    }

    #[tokio::test]
    async fn test_output_event_unique_per_step() {
        let store = InMemoryExecutionStore::new();
        let execution = pending_execution(&store).await;

        let first = store
            .append_event(execution.id, NewEvent::output("a", json!(1)))
            .await
            .unwrap();
        let second = store
            .append_event(execution.id, NewEvent::output("a", json!(2)))
            .await
            .unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(store.events(execution.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_stream_chunks_round_trip() {
        let store = InMemoryExecutionStore::new();
        let execution = pending_execution(&store).await;

        for i in 0..3u32 {
            store
                .append_stream_chunk(execution.id, "fetch", i, json!({"n": i}))
                .await
                .unwrap();
        }

        let chunks = store.stream_chunks(execution.id, "fetch").await.unwrap();
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[2].data, json!({"n": 2}));

        store.clear_stream_chunks(execution.id, "fetch").await.unwrap();
        assert!(store.stream_chunks(execution.id, "fetch").await.unwrap().is_empty());
    }
}

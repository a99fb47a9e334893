//! Per-execution state machine
//!
//! The executor walks a workflow's step list under a held lease, replaying
//! persisted step results, resolving `@` references, dispatching step bodies,
//! and persisting every transition. It returns a tagged
//! [`ExecutionOutcome`] instead of blocking on suspensions; the scheduler
//! re-enters on the wake condition.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::persistence::{
    Execution, ExecutionStatus, ExecutionStore, FailureOutcome, LeasedExecution, StepResult,
    StepResultPatch, StoreError,
};
use crate::step::{StepError, StepRun, StepRunner, Suspension, ToolGateway};
use crate::workflow::{
    EventType, NewEvent, ParallelGroup, Scratchpad, Step, StepRetry, WorkflowDefinition,
};

use super::control_flow;
use super::source::WorkflowSource;

/// Errors from executor operations
///
/// Step failures are not errors at this level; they become
/// [`ExecutionOutcome::Failed`]. Only infrastructure trouble surfaces here,
/// and the scheduler treats it as retryable.
#[derive(Debug, thiserror::Error)]
pub enum ExecutorError {
    /// Execution not found
    #[error("execution not found: {0}")]
    ExecutionNotFound(Uuid),

    /// Store error
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

/// Result of driving one execution as far as it can go
#[derive(Debug, Clone, PartialEq)]
pub enum ExecutionOutcome {
    /// Every step finished; the workflow output is written
    Completed { output: Value },

    /// A step failed; `retryable` tells the scheduler whether to requeue
    Failed {
        error: String,
        retryable: bool,
        retry_delay: Option<Duration>,
    },

    /// Suspended on a durable timer
    Sleeping {
        step: String,
        wake_at: DateTime<Utc>,
    },

    /// Suspended until a signal arrives
    WaitingForSignal {
        step: String,
        signal_name: String,
        timeout_at: Option<DateTime<Utc>>,
    },

    /// Cancellation was observed at a step boundary
    Cancelled,
}

/// Outcome of one step body within the walk
#[derive(Debug)]
pub(crate) enum SingleRun {
    Completed(Value),
    Suspended(Suspension),
}

/// A step failure carried up to the execution-level policy
#[derive(Debug)]
pub(crate) struct StepFailure {
    pub step: String,
    pub attempt: u32,
    pub retry: Option<StepRetry>,
    pub error: StepError,
}

impl StepFailure {
    pub(crate) fn new(step: impl Into<String>, attempt: u32, error: StepError) -> Self {
        Self {
            step: step.into(),
            attempt,
            retry: None,
            error,
        }
    }
}

/// How far the walk may advance after one plan item
pub(crate) enum StepDisposition {
    Done,
    Suspend {
        step: String,
        suspension: Suspension,
    },
}

/// One unit of the execution plan: a lone step or a contiguous parallel group
enum PlanItem<'a> {
    Single(&'a Step),
    Group {
        group: &'a ParallelGroup,
        steps: Vec<&'a Step>,
    },
}

/// Workflow executor
///
/// Owns no state of its own; everything authoritative lives in the store,
/// which is what makes crash-and-recover replay exact.
pub struct Executor {
    store: Arc<dyn ExecutionStore>,
    workflows: Arc<dyn WorkflowSource>,
    runner: StepRunner,
    config: EngineConfig,
}

impl Executor {
    /// Create an executor
    pub fn new(
        store: Arc<dyn ExecutionStore>,
        workflows: Arc<dyn WorkflowSource>,
        gateway: ToolGateway,
        config: EngineConfig,
    ) -> Self {
        let runner = StepRunner::new(Arc::clone(&store), gateway, config.clone());
        Self {
            store,
            workflows,
            runner,
            config,
        }
    }

    /// Get a reference to the store
    pub fn store(&self) -> &Arc<dyn ExecutionStore> {
        &self.store
    }

    /// Drive one execution under the given lease
    ///
    /// Pre-condition: the caller holds the lease. Post-condition: the
    /// returned outcome has been persisted (completion, failure/backoff, or
    /// suspension) before this returns.
    #[instrument(skip(self, lease), fields(execution_id = %lease.id()))]
    pub async fn execute(
        &self,
        lease: &LeasedExecution,
    ) -> Result<ExecutionOutcome, ExecutorError> {
        let id = lease.id();
        let lock_id = lease.lock_id;

        let execution = self
            .store
            .get_execution(id)
            .await?
            .ok_or(ExecutorError::ExecutionNotFound(id))?;

        if execution.is_terminal() {
            return Ok(terminal_outcome(&execution));
        }

        let definition = match self.workflows.workflow(&execution.workflow_id).await? {
            Some(definition) => definition,
            None => {
                let error = format!("workflow definition '{}' not found", execution.workflow_id);
                return self.fail(&execution, lock_id, error, false, None).await;
            }
        };
        if let Err(e) = definition.validate() {
            return self.fail(&execution, lock_id, e.to_string(), false, None).await;
        }

        // Replay: persisted step results reconstruct the scratchpad exactly
        let mut results: HashMap<String, StepResult> = self
            .store
            .step_results(id)
            .await?
            .into_iter()
            .map(|r| (r.step_id.clone(), r))
            .collect();

        let mut scratchpad = Scratchpad::new(execution.input.clone());
        for result in results.values() {
            if result.is_replayable() {
                scratchpad.insert(
                    result.step_id.clone(),
                    result.output.clone().unwrap_or(Value::Null),
                );
            }
        }

        if results.is_empty() {
            self.store
                .append_event(
                    id,
                    NewEvent::lifecycle(
                        EventType::WorkflowStarted,
                        Some(json!({ "workflowId": execution.workflow_id })),
                    ),
                )
                .await?;
        }

        debug!(replayed = results.len(), "loaded step results");

        for item in build_plan(&definition) {
            // Cancellation is cooperative, checked at step boundaries only
            let current = self
                .store
                .get_execution(id)
                .await?
                .ok_or(ExecutorError::ExecutionNotFound(id))?;
            if current.status == ExecutionStatus::Cancelled {
                info!("cancellation observed at step boundary");
                return Ok(ExecutionOutcome::Cancelled);
            }

            let disposition = match item {
                PlanItem::Single(step) => {
                    self.run_step(&execution, step, &mut scratchpad, &mut results)
                        .await
                }
                PlanItem::Group { group, steps } => {
                    control_flow::run_group(
                        self,
                        &execution,
                        group,
                        &steps,
                        &mut scratchpad,
                        &mut results,
                    )
                    .await
                }
            };

            match disposition {
                Ok(StepDisposition::Done) => {}
                Ok(StepDisposition::Suspend { step, suspension }) => {
                    return self.suspend(&execution, lock_id, &step, suspension).await;
                }
                Err(failure) => {
                    return self.handle_step_failure(&execution, lock_id, failure).await;
                }
            }
        }

        // Workflow output: the declared template, or the last step's output
        let output = match &definition.output {
            Some(template) => match scratchpad.resolve(template) {
                Ok(output) => output,
                Err(e) => {
                    return self
                        .fail(&execution, lock_id, e.to_string(), false, None)
                        .await;
                }
            },
            None => definition
                .steps
                .last()
                .and_then(|step| scratchpad.get(&step.name).cloned())
                .unwrap_or(Value::Null),
        };

        let stored = summarize_output(&output);
        if self.store.complete_execution(id, lock_id, stored).await? {
            self.store
                .append_event(
                    id,
                    NewEvent::lifecycle(EventType::WorkflowCompleted, None),
                )
                .await?;
            info!("execution completed");
        } else {
            // Lease lost at the finish line; the new owner replays to the
            // same output, so this is absorbed
            warn!("completion write no-oped, lease was lost");
        }

        Ok(ExecutionOutcome::Completed { output })
    }

    /// Run one declared step (replay skip, forEach expansion, or the body)
    async fn run_step(
        &self,
        execution: &Execution,
        step: &Step,
        scratchpad: &mut Scratchpad,
        results: &mut HashMap<String, StepResult>,
    ) -> Result<StepDisposition, StepFailure> {
        if let Some(existing) = results.get(&step.name) {
            if existing.is_replayable() {
                debug!(step = %step.name, "replayed from step result");
                return Ok(StepDisposition::Done);
            }
        }

        if let Some(for_each) = step.for_each() {
            return control_flow::run_for_each(
                self, execution, step, for_each, scratchpad, results,
            )
            .await;
        }

        let prior = results.get(&step.name).cloned();
        match self
            .run_single(execution, step, scratchpad, prior)
            .await?
        {
            SingleRun::Completed(output) => {
                self.record_step_output(execution.id, step, &output, results)
                    .await
                    .map_err(|e| {
                        StepFailure::new(step.name.clone(), 0, StepError::Store(e))
                    })?;
                scratchpad.insert(step.name.clone(), output);
                Ok(StepDisposition::Done)
            }
            SingleRun::Suspended(suspension) => Ok(StepDisposition::Suspend {
                step: step.name.clone(),
                suspension,
            }),
        }
    }

    /// Run one step body against the given scratchpad
    ///
    /// No shared-map mutation happens here, so fan-out iterations can run
    /// this concurrently. Completion bookkeeping is the caller's job.
    pub(crate) async fn run_single(
        &self,
        execution: &Execution,
        step: &Step,
        scratchpad: &Scratchpad,
        prior: Option<StepResult>,
    ) -> Result<SingleRun, StepFailure> {
        let attempt = prior.as_ref().map(|r| r.attempt).unwrap_or(0);
        let failure = |error: StepError| StepFailure {
            step: step.name.clone(),
            attempt,
            retry: step.retry,
            error,
        };

        let input = match &step.input {
            Some(template) => scratchpad.resolve(template).map_err(|e| failure(e.into()))?,
            None => Value::Null,
        };

        let now = Utc::now();
        self.store
            .upsert_step_result(execution.id, &step.name, StepResultPatch::started(now))
            .await
            .map_err(|e| failure(e.into()))?;
        self.store
            .append_event(
                execution.id,
                NewEvent::step_marker(EventType::StepStarted, &step.name),
            )
            .await
            .map_err(|e| failure(e.into()))?;

        let mut current = prior.unwrap_or(StepResult {
            execution_id: execution.id,
            step_id: step.name.clone(),
            attempt,
            started_at: None,
            completed_at: None,
            output: None,
            error: None,
        });
        current.started_at.get_or_insert(now);

        let run = self
            .runner
            .run(execution, step, input, Some(&current))
            .await
            .map_err(failure)?;

        Ok(match run {
            StepRun::Completed(output) => SingleRun::Completed(output),
            StepRun::Suspended(suspension) => SingleRun::Suspended(suspension),
        })
    }

    /// Persist a completed step: result row, markers, deduplicated output event
    pub(crate) async fn record_step_output(
        &self,
        execution_id: Uuid,
        step: &Step,
        output: &Value,
        results: &mut HashMap<String, StepResult>,
    ) -> Result<(), StoreError> {
        let now = Utc::now();
        self.store
            .upsert_step_result(
                execution_id,
                &step.name,
                StepResultPatch::completed(now, output.clone()),
            )
            .await?;
        self.store
            .append_event(
                execution_id,
                NewEvent::step_marker(EventType::StepCompleted, &step.name),
            )
            .await?;
        self.store
            .append_event(
                execution_id,
                NewEvent::output(&step.name, summarize_output(output)),
            )
            .await?;

        let entry = results
            .entry(step.name.clone())
            .or_insert_with(|| StepResult {
                execution_id,
                step_id: step.name.clone(),
                attempt: 0,
                started_at: Some(now),
                completed_at: None,
                output: None,
                error: None,
            });
        entry.completed_at = Some(now);
        entry.output = Some(output.clone());
        entry.error = None;
        Ok(())
    }

    /// Persist a suspension and surface it to the scheduler
    async fn suspend(
        &self,
        execution: &Execution,
        lock_id: Uuid,
        step: &str,
        suspension: Suspension,
    ) -> Result<ExecutionOutcome, ExecutorError> {
        match suspension {
            Suspension::Sleep { wake_at } => {
                // The timer row was written by the sleep runner
                self.store
                    .set_sleeping(execution.id, lock_id, step, wake_at)
                    .await?;
                debug!(step, %wake_at, "suspended on durable sleep");
                Ok(ExecutionOutcome::Sleeping {
                    step: step.to_string(),
                    wake_at,
                })
            }
            Suspension::Signal {
                signal_name,
                timeout_at,
            } => {
                if let Some(timeout_at) = timeout_at {
                    // Wait timeouts ride the timer mechanism so the poller
                    // re-enters and fails the step
                    self.store
                        .schedule_timer(execution.id, step, timeout_at)
                        .await?;
                }
                self.store
                    .set_waiting(execution.id, lock_id, step, &signal_name, timeout_at)
                    .await?;
                debug!(step, signal_name, "suspended waiting for signal");
                Ok(ExecutionOutcome::WaitingForSignal {
                    step: step.to_string(),
                    signal_name,
                    timeout_at,
                })
            }
        }
    }

    /// Apply retry policy and record the failure
    async fn handle_step_failure(
        &self,
        execution: &Execution,
        lock_id: Uuid,
        failure: StepFailure,
    ) -> Result<ExecutionOutcome, ExecutorError> {
        let error_text = format!("step '{}' failed: {}", failure.step, failure.error);
        warn!(step = %failure.step, attempt = failure.attempt, %error_text, "step failed");

        self.store
            .upsert_step_result(
                execution.id,
                &failure.step,
                StepResultPatch::failed(failure.attempt + 1, failure.error.to_string()),
            )
            .await?;

        let attempts_remaining = failure
            .retry
            .map(|r| r.has_attempts_remaining(failure.attempt))
            .unwrap_or(false);
        let policy_retry = attempts_remaining && failure.error.policy_may_retry();
        let retryable = failure.error.is_retryable() || policy_retry;
        let retry_delay = failure
            .retry
            .filter(|_| policy_retry)
            .map(|r| r.delay_for_attempt(failure.attempt));

        let outcome = self
            .store
            .fail_execution(execution.id, lock_id, &error_text, retryable, retry_delay)
            .await?;

        let retryable = match outcome {
            FailureOutcome::WillRetry { .. } => true,
            FailureOutcome::Terminal => false,
            // The write no-oped; report what we computed and let the real
            // owner settle it
            FailureOutcome::Lost => retryable,
        };

        Ok(ExecutionOutcome::Failed {
            error: error_text,
            retryable,
            retry_delay,
        })
    }

    /// Terminal failure without step context (definition-level errors)
    async fn fail(
        &self,
        execution: &Execution,
        lock_id: Uuid,
        error: String,
        retryable: bool,
        retry_delay: Option<Duration>,
    ) -> Result<ExecutionOutcome, ExecutorError> {
        warn!(%error, "execution failed");
        self.store
            .fail_execution(execution.id, lock_id, &error, retryable, retry_delay)
            .await?;
        Ok(ExecutionOutcome::Failed {
            error,
            retryable,
            retry_delay,
        })
    }

    /// Engine configuration
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }
}

fn terminal_outcome(execution: &Execution) -> ExecutionOutcome {
    match execution.status {
        ExecutionStatus::Completed => ExecutionOutcome::Completed {
            output: execution.output.clone().unwrap_or(Value::Null),
        },
        ExecutionStatus::Cancelled => ExecutionOutcome::Cancelled,
        _ => ExecutionOutcome::Failed {
            error: execution
                .error
                .clone()
                .unwrap_or_else(|| "execution failed".to_string()),
            retryable: false,
            retry_delay: None,
        },
    }
}

/// Group contiguous steps sharing a parallel group id into batch items
fn build_plan(definition: &WorkflowDefinition) -> Vec<PlanItem<'_>> {
    let mut plan = Vec::new();
    let mut steps = definition.steps.iter().peekable();

    while let Some(step) = steps.next() {
        match step.parallel_group() {
            Some(group) => {
                let mut members = vec![step];
                while let Some(next) = steps.next_if(|next| {
                    next.parallel_group()
                        .map_or(false, |g| g.group == group.group)
                }) {
                    members.push(next);
                }
                plan.push(PlanItem::Group {
                    group,
                    steps: members,
                });
            }
            None => plan.push(PlanItem::Single(step)),
        }
    }

    plan
}

/// Large payloads stay in step results; summaries carry a sentinel
///
/// Thresholds: serialized form over 50 KiB, a string over 10 KiB, or an
/// array of more than 100 items.
pub(crate) fn summarize_output(output: &Value) -> Value {
    let excluded = match output {
        Value::String(s) => s.len() > 10 * 1024,
        Value::Array(items) => items.len() > 100,
        _ => false,
    };
    let excluded = excluded
        || serde_json::to_string(output)
            .map(|s| s.len() > 50 * 1024)
            .unwrap_or(true);

    if excluded {
        let bytes = serde_json::to_string(output).map(|s| s.len()).unwrap_or(0);
        json!({ "$excluded": true, "bytes": bytes })
    } else {
        output.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::InMemoryWorkflowSource;
    use crate::persistence::{InMemoryExecutionStore, NewExecution};
    use crate::workflow::StepAction;

    fn code_step(name: &str, code: &str, input: Option<Value>) -> Step {
        Step {
            name: name.to_string(),
            action: StepAction::Code {
                code: code.to_string(),
            },
            input,
            retry: None,
            config: None,
        }
    }

    fn executor(
        store: Arc<InMemoryExecutionStore>,
        workflows: Arc<InMemoryWorkflowSource>,
    ) -> Executor {
        let gateway = ToolGateway::new(
            "http://localhost:1",
            "unused",
            Duration::from_secs(1),
        )
        .unwrap();
        Executor::new(store, workflows, gateway, EngineConfig::default())
    }

    async fn lease(
        store: &Arc<InMemoryExecutionStore>,
        workflow_id: &str,
        input: Value,
    ) -> LeasedExecution {
        let execution = store
            .create_execution(NewExecution::new(workflow_id, input))
            .await
            .unwrap();
        store
            .acquire_lease(execution.id, Duration::from_secs(30))
            .await
            .unwrap()
            .unwrap()
    }

    #[tokio::test]
    async fn test_code_pipeline_completes() {
        let store = Arc::new(InMemoryExecutionStore::new());
        let workflows = Arc::new(InMemoryWorkflowSource::new());
        workflows.insert(WorkflowDefinition::new(
            "pipeline",
            vec![
                code_step(
                    "a",
                    "export default (x) => x + 1",
                    Some(json!("@input.value")),
                ),
                code_step("b", "export default (x) => x * 2", Some(json!("@a"))),
            ],
        ));

        let executor = executor(Arc::clone(&store), workflows);
        let lease = lease(&store, "pipeline", json!({"value": 3})).await;
        let outcome = executor.execute(&lease).await.unwrap();

        assert_eq!(outcome, ExecutionOutcome::Completed { output: json!(8) });

        let row = store.get_execution(lease.id()).await.unwrap().unwrap();
        assert_eq!(row.status, ExecutionStatus::Completed);
        assert_eq!(row.output, Some(json!(8)));
    }

    #[tokio::test]
    async fn test_replay_skips_completed_steps() {
        let store = Arc::new(InMemoryExecutionStore::new());
        let workflows = Arc::new(InMemoryWorkflowSource::new());
        workflows.insert(WorkflowDefinition::new(
            "pipeline",
            vec![
                code_step(
                    "a",
                    "export default (x) => x.value + 1",
                    Some(json!("@input")),
                ),
                code_step("b", "export default (x) => x * 2", Some(json!("@a"))),
            ],
        ));

        let executor = executor(Arc::clone(&store), workflows);
        let lease = lease(&store, "pipeline", json!({"value": 3})).await;

        // A crashed worker already persisted step `a` with a marker value
        // the code would never produce
        store
            .upsert_step_result(
                lease.id(),
                "a",
                StepResultPatch::completed(Utc::now(), json!(100)),
            )
            .await
            .unwrap();

        let outcome = executor.execute(&lease).await.unwrap();
        assert_eq!(
            outcome,
            ExecutionOutcome::Completed { output: json!(200) }
        );
    }

    #[tokio::test]
    async fn test_unresolvable_reference_fails_terminally() {
        let store = Arc::new(InMemoryExecutionStore::new());
        let workflows = Arc::new(InMemoryWorkflowSource::new());
        workflows.insert(WorkflowDefinition::new(
            "broken",
            vec![code_step(
                "a",
                "export default (x) => x",
                Some(json!("@nowhere.field")),
            )],
        ));

        let executor = executor(Arc::clone(&store), workflows);
        let lease = lease(&store, "broken", json!({})).await;
        let outcome = executor.execute(&lease).await.unwrap();

        match outcome {
            ExecutionOutcome::Failed {
                retryable, error, ..
            } => {
                assert!(!retryable);
                assert!(error.contains("@nowhere.field"));
            }
            other => panic!("expected failure, got {other:?}"),
        }

        let row = store.get_execution(lease.id()).await.unwrap().unwrap();
        assert_eq!(row.status, ExecutionStatus::Failed);
    }

    #[tokio::test]
    async fn test_missing_definition_fails_terminally() {
        let store = Arc::new(InMemoryExecutionStore::new());
        let workflows = Arc::new(InMemoryWorkflowSource::new());

        let executor = executor(Arc::clone(&store), workflows);
        let lease = lease(&store, "ghost", json!({})).await;
        let outcome = executor.execute(&lease).await.unwrap();

        assert!(matches!(
            outcome,
            ExecutionOutcome::Failed {
                retryable: false,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_cancellation_observed_at_boundary() {
        let store = Arc::new(InMemoryExecutionStore::new());
        let workflows = Arc::new(InMemoryWorkflowSource::new());
        workflows.insert(WorkflowDefinition::new(
            "wf",
            vec![code_step("a", "export default (x) => 1", None)],
        ));

        let executor = executor(Arc::clone(&store), workflows);
        let lease = lease(&store, "wf", json!({})).await;
        store.cancel_execution(lease.id()).await.unwrap();

        let outcome = executor.execute(&lease).await.unwrap();
        assert_eq!(outcome, ExecutionOutcome::Cancelled);

        // No step ran after the boundary check
        assert!(store.step_result(lease.id(), "a").is_none());
    }

    #[test]
    fn test_summarize_output_thresholds() {
        assert_eq!(summarize_output(&json!({"small": true})), json!({"small": true}));

        let big_string = Value::String("x".repeat(11 * 1024));
        assert_eq!(summarize_output(&big_string)["$excluded"], json!(true));

        let big_array = Value::Array(vec![json!(0); 101]);
        assert_eq!(summarize_output(&big_array)["$excluded"], json!(true));
    }
}

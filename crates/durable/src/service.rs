//! Operator surface
//!
//! [`WorkflowService`] bundles the store, a scheduler, and the executor
//! behind the five administrative operations: create-and-queue, execute,
//! cancel, resume, and send-signal. This is the seam an embedding
//! application (or its tool layer) calls into.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{info, instrument};
use uuid::Uuid;

use crate::engine::{ExecutionOutcome, Executor, ExecutorError, WorkflowSource};
use crate::persistence::{
    CancelOutcome, Execution, ExecutionStore, NewExecution, ResumeOutcome, StoreError,
};
use crate::scheduler::{ScheduleOptions, Scheduler, SchedulerError};
use crate::workflow::NewEvent;

/// Errors from service operations
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    /// Store error
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Scheduler error
    #[error("scheduler error: {0}")]
    Scheduler(#[from] SchedulerError),

    /// Executor error
    #[error("executor error: {0}")]
    Executor(#[from] ExecutorError),

    /// Workflow definition missing or invalid
    #[error("unknown workflow: {0}")]
    UnknownWorkflow(String),

    /// Definition failed validation
    #[error("invalid workflow: {0}")]
    InvalidWorkflow(String),

    /// Execution not found
    #[error("execution not found: {0}")]
    ExecutionNotFound(Uuid),

    /// Another worker holds the lease
    #[error("execution {0} is locked by another worker")]
    Conflict(Uuid),
}

/// Receipt for a newly created execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreatedExecution {
    pub execution_id: Uuid,
}

/// Receipt for an ingested signal
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalReceipt {
    pub signal_id: Uuid,
}

/// Administrative entry points for the workflow engine
pub struct WorkflowService {
    store: Arc<dyn ExecutionStore>,
    workflows: Arc<dyn WorkflowSource>,
    scheduler: Arc<dyn Scheduler>,
    executor: Arc<Executor>,
}

impl WorkflowService {
    /// Create a service
    pub fn new(
        store: Arc<dyn ExecutionStore>,
        workflows: Arc<dyn WorkflowSource>,
        scheduler: Arc<dyn Scheduler>,
        executor: Arc<Executor>,
    ) -> Self {
        Self {
            store,
            workflows,
            scheduler,
            executor,
        }
    }

    /// Create an execution and make it eligible for processing
    #[instrument(skip(self, input))]
    pub async fn create_and_queue_execution(
        &self,
        workflow_id: &str,
        input: Option<serde_json::Value>,
    ) -> Result<CreatedExecution, ServiceError> {
        let definition = self
            .workflows
            .workflow(workflow_id)
            .await?
            .ok_or_else(|| ServiceError::UnknownWorkflow(workflow_id.to_string()))?;
        definition
            .validate()
            .map_err(|e| ServiceError::InvalidWorkflow(e.to_string()))?;

        let execution = self
            .store
            .create_execution(
                NewExecution::new(workflow_id, input.unwrap_or(serde_json::Value::Null))
                    .with_max_retries(self.executor.config().max_retries),
            )
            .await?;

        self.scheduler
            .schedule(execution.id, ScheduleOptions::immediate())
            .await?;

        info!(execution_id = %execution.id, workflow_id, "queued execution");
        Ok(CreatedExecution {
            execution_id: execution.id,
        })
    }

    /// Acquire the lease and drive the execution as far as it can go
    #[instrument(skip(self))]
    pub async fn execute_workflow(
        &self,
        execution_id: Uuid,
    ) -> Result<ExecutionOutcome, ServiceError> {
        let execution = self
            .store
            .get_execution(execution_id)
            .await?
            .ok_or(ServiceError::ExecutionNotFound(execution_id))?;

        // Terminal executions report their settled outcome without a lease
        if execution.is_terminal() {
            return Ok(settled_outcome(execution));
        }

        let lease = self
            .store
            .acquire_lease(execution_id, self.executor.config().lease())
            .await?
            .ok_or(ServiceError::Conflict(execution_id))?;

        Ok(self.executor.execute(&lease).await?)
    }

    /// Force cancellation; the owning executor observes it at the next step boundary
    #[instrument(skip(self))]
    pub async fn cancel_execution(
        &self,
        execution_id: Uuid,
    ) -> Result<CancelOutcome, ServiceError> {
        let outcome = self.store.cancel_execution(execution_id).await?;
        if outcome == CancelOutcome::Cancelled {
            // Best-effort: queue backends cannot revoke in-flight messages
            let _ = self.scheduler.cancel(execution_id).await;
            info!(%execution_id, "cancelled");
        }
        Ok(outcome)
    }

    /// Move a cancelled or failed execution back to pending
    #[instrument(skip(self))]
    pub async fn resume_execution(
        &self,
        execution_id: Uuid,
        reset_retries: bool,
        requeue: bool,
    ) -> Result<ResumeOutcome, ServiceError> {
        let outcome = self
            .store
            .resume_execution(execution_id, reset_retries)
            .await?;

        if outcome == ResumeOutcome::Resumed && requeue {
            self.scheduler
                .schedule(execution_id, ScheduleOptions::immediate())
                .await?;
        }
        if outcome == ResumeOutcome::Resumed {
            info!(%execution_id, reset_retries, requeue, "resumed");
        }
        Ok(outcome)
    }

    /// Deliver an external signal
    ///
    /// If the execution is parked on a wait-for-signal step, it flips back
    /// to pending and is scheduled immediately so the signal lands without
    /// waiting for the next poll.
    #[instrument(skip(self, payload))]
    pub async fn send_signal(
        &self,
        execution_id: Uuid,
        signal_name: &str,
        payload: Option<serde_json::Value>,
    ) -> Result<SignalReceipt, ServiceError> {
        self.store
            .get_execution(execution_id)
            .await?
            .ok_or(ServiceError::ExecutionNotFound(execution_id))?;

        let event = self
            .store
            .append_event(execution_id, NewEvent::signal(signal_name, payload))
            .await?;

        if self.store.wake_for_signal(execution_id).await? {
            self.scheduler
                .schedule(execution_id, ScheduleOptions::immediate())
                .await?;
        }

        info!(%execution_id, signal_name, "signal recorded");
        Ok(SignalReceipt {
            signal_id: event.id,
        })
    }

    /// Fetch an execution for inspection
    pub async fn get_execution(
        &self,
        execution_id: Uuid,
    ) -> Result<Option<Execution>, ServiceError> {
        Ok(self.store.get_execution(execution_id).await?)
    }

}

fn settled_outcome(execution: Execution) -> ExecutionOutcome {
    use crate::persistence::ExecutionStatus;
    match execution.status {
        ExecutionStatus::Completed => ExecutionOutcome::Completed {
            output: execution.output.unwrap_or(serde_json::Value::Null),
        },
        ExecutionStatus::Cancelled => ExecutionOutcome::Cancelled,
        _ => ExecutionOutcome::Failed {
            error: execution
                .error
                .unwrap_or_else(|| "execution failed".to_string()),
            retryable: false,
            retry_delay: None,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::engine::InMemoryWorkflowSource;
    use crate::persistence::{ExecutionStatus, InMemoryExecutionStore};
    use crate::scheduler::{PollerConfig, PollingScheduler};
    use crate::step::ToolGateway;
    use crate::workflow::{Step, StepAction, WorkflowDefinition};
    use serde_json::json;
    use std::time::Duration;

    fn service(workflows: Arc<InMemoryWorkflowSource>) -> (WorkflowService, Arc<InMemoryExecutionStore>) {
        let store = Arc::new(InMemoryExecutionStore::new());
        let gateway =
            ToolGateway::new("http://localhost:1", "unused", Duration::from_secs(1)).unwrap();
        let executor = Arc::new(Executor::new(
            store.clone() as Arc<dyn ExecutionStore>,
            workflows.clone() as Arc<dyn WorkflowSource>,
            gateway,
            EngineConfig::default(),
        ));
        let scheduler = Arc::new(PollingScheduler::new(
            store.clone() as Arc<dyn ExecutionStore>,
            Arc::clone(&executor),
            PollerConfig::default(),
        ));

        (
            WorkflowService::new(
                store.clone() as Arc<dyn ExecutionStore>,
                workflows as Arc<dyn WorkflowSource>,
                scheduler as Arc<dyn Scheduler>,
                executor,
            ),
            store,
        )
    }

    fn simple_workflows() -> Arc<InMemoryWorkflowSource> {
        let workflows = Arc::new(InMemoryWorkflowSource::new());
        workflows.insert(WorkflowDefinition::new(
            "wf",
            vec![Step {
                name: "answer".to_string(),
                action: StepAction::Code {
                    code: "export default (x) => 42".to_string(),
                },
                input: None,
                retry: None,
                config: None,
            }],
        ));
        workflows
    }

    #[tokio::test]
    async fn test_create_execute_and_inspect() {
        let (service, _store) = service(simple_workflows());

        let created = service
            .create_and_queue_execution("wf", Some(json!({})))
            .await
            .unwrap();
        let outcome = service.execute_workflow(created.execution_id).await.unwrap();
        assert_eq!(outcome, ExecutionOutcome::Completed { output: json!(42) });

        let row = service
            .get_execution(created.execution_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row.status, ExecutionStatus::Completed);
    }

    #[tokio::test]
    async fn test_create_rejects_unknown_workflow() {
        let (service, _store) = service(simple_workflows());
        let err = service
            .create_and_queue_execution("ghost", None)
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::UnknownWorkflow(_)));
    }

    #[tokio::test]
    async fn test_cancel_and_resume_outcomes() {
        let (service, _store) = service(simple_workflows());
        let created = service
            .create_and_queue_execution("wf", None)
            .await
            .unwrap();
        let id = created.execution_id;

        assert_eq!(
            service.cancel_execution(id).await.unwrap(),
            CancelOutcome::Cancelled
        );
        assert_eq!(
            service.cancel_execution(id).await.unwrap(),
            CancelOutcome::AlreadyCancelled
        );
        assert_eq!(
            service.resume_execution(id, true, false).await.unwrap(),
            ResumeOutcome::Resumed
        );
        assert_eq!(
            service.resume_execution(id, false, false).await.unwrap(),
            ResumeOutcome::NotResumable
        );
        assert_eq!(
            service.cancel_execution(Uuid::now_v7()).await.unwrap(),
            CancelOutcome::NotFound
        );
    }

    #[tokio::test]
    async fn test_send_signal_records_event() {
        let (service, store) = service(simple_workflows());
        let created = service
            .create_and_queue_execution("wf", None)
            .await
            .unwrap();

        let receipt = service
            .send_signal(created.execution_id, "approve", Some(json!({"ok": true})))
            .await
            .unwrap();

        let pending = store.pending_signals(created.execution_id).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, receipt.signal_id);
    }

    #[tokio::test]
    async fn test_execute_conflict_when_leased() {
        let (service, store) = service(simple_workflows());
        let created = service
            .create_and_queue_execution("wf", None)
            .await
            .unwrap();

        // Someone else claims the lease first
        store
            .acquire_lease(created.execution_id, Duration::from_secs(30))
            .await
            .unwrap()
            .unwrap();

        let err = service
            .execute_workflow(created.execution_id)
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::Conflict(_)));
    }
}

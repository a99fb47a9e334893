//! Queue-backed scheduler
//!
//! For runtimes with a delay queue: `schedule` enqueues a message with an
//! optional delay, and a consumer loop drives one execution per message.
//! At-least-once comes from redelivery plus the lease CAS; a message for an
//! execution someone else owns (or that is already terminal) is absorbed as
//! a no-op. Cancel is not supported here, so cancelled executions simply
//! no-op under the acquired lease.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch, Mutex};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use super::{ScheduleOptions, Scheduler, SchedulerError};
use crate::engine::{ExecutionOutcome, Executor};
use crate::persistence::ExecutionStore;
use crate::workflow::execution_backoff;

/// Longest delay a queue backend must support
pub const MAX_QUEUE_DELAY: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// One scheduling message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueMessage {
    pub execution_id: Uuid,
    pub retry_count: u32,
    pub enqueued_at: DateTime<Utc>,
    pub authorization: Option<String>,
}

impl QueueMessage {
    /// First delivery for an execution
    pub fn new(execution_id: Uuid, authorization: Option<String>) -> Self {
        Self {
            execution_id,
            retry_count: 0,
            enqueued_at: Utc::now(),
            authorization,
        }
    }

    /// Redelivery with the retry counter bumped
    pub fn redelivery(&self) -> Self {
        Self {
            execution_id: self.execution_id,
            retry_count: self.retry_count + 1,
            enqueued_at: Utc::now(),
            authorization: self.authorization.clone(),
        }
    }
}

/// A delay-queue backend
#[async_trait]
pub trait QueueTransport: Send + Sync + 'static {
    /// Deliver `message` after `delay`
    async fn enqueue(&self, message: QueueMessage, delay: Duration) -> Result<(), SchedulerError>;

    /// Next ready message; `None` means the transport is closed
    async fn receive(&self) -> Result<Option<QueueMessage>, SchedulerError>;
}

/// In-process delay queue
///
/// Good enough for tests and single-process deployments; delayed messages
/// ride a spawned sleep.
pub struct InProcessQueue {
    tx: mpsc::UnboundedSender<QueueMessage>,
    rx: Mutex<mpsc::UnboundedReceiver<QueueMessage>>,
}

impl InProcessQueue {
    /// Create an empty queue
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx,
            rx: Mutex::new(rx),
        }
    }
}

impl Default for InProcessQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl QueueTransport for InProcessQueue {
    async fn enqueue(&self, message: QueueMessage, delay: Duration) -> Result<(), SchedulerError> {
        if delay > MAX_QUEUE_DELAY {
            return Err(SchedulerError::DelayTooLong(delay));
        }

        if delay.is_zero() {
            self.tx
                .send(message)
                .map_err(|e| SchedulerError::Queue(e.to_string()))?;
            return Ok(());
        }

        let tx = self.tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            // Receiver gone means the consumer shut down; nothing to do
            let _ = tx.send(message);
        });
        Ok(())
    }

    async fn receive(&self) -> Result<Option<QueueMessage>, SchedulerError> {
        Ok(self.rx.lock().await.recv().await)
    }
}

/// Scheduler half: enqueues messages
pub struct QueueScheduler<T: QueueTransport> {
    transport: Arc<T>,
}

impl<T: QueueTransport> QueueScheduler<T> {
    /// Create a scheduler over the given transport
    pub fn new(transport: Arc<T>) -> Self {
        Self { transport }
    }
}

#[async_trait]
impl<T: QueueTransport> Scheduler for QueueScheduler<T> {
    async fn schedule(
        &self,
        execution_id: Uuid,
        options: ScheduleOptions,
    ) -> Result<(), SchedulerError> {
        let delay = options
            .run_at
            .map(|at| (at - Utc::now()).to_std().unwrap_or(Duration::ZERO))
            .unwrap_or(Duration::ZERO);
        if delay > MAX_QUEUE_DELAY {
            return Err(SchedulerError::DelayTooLong(delay));
        }

        self.transport
            .enqueue(QueueMessage::new(execution_id, options.authorization), delay)
            .await
    }
}

/// Consumer half: receives messages and drives the executor
pub struct QueueConsumer<T: QueueTransport> {
    transport: Arc<T>,
    store: Arc<dyn ExecutionStore>,
    executor: Arc<Executor>,
    shutdown_tx: watch::Sender<bool>,
}

impl<T: QueueTransport> QueueConsumer<T> {
    /// Create a consumer
    pub fn new(transport: Arc<T>, store: Arc<dyn ExecutionStore>, executor: Arc<Executor>) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            transport,
            store,
            executor,
            shutdown_tx,
        }
    }

    /// Run the consumer loop until shutdown or transport close
    pub async fn run(&self) {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        info!("queue consumer started");

        loop {
            let message = tokio::select! {
                _ = shutdown_rx.changed() => break,
                received = self.transport.receive() => match received {
                    Ok(Some(message)) => message,
                    Ok(None) => break,
                    Err(e) => {
                        warn!(error = %e, "queue receive failed");
                        continue;
                    }
                },
            };

            if let Err(e) = self.process(message).await {
                warn!(error = %e, "message processing failed");
            }
        }

        info!("queue consumer stopped");
    }

    /// Spawn the loop onto the runtime
    pub fn spawn(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let this = Arc::clone(self);
        tokio::spawn(async move { this.run().await })
    }

    /// Request shutdown
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// Handle one message: claim, execute, and requeue when needed
    #[instrument(skip(self, message), fields(execution_id = %message.execution_id))]
    async fn process(&self, message: QueueMessage) -> Result<(), SchedulerError> {
        let config = self.executor.config();

        let Some(lease) = self
            .store
            .acquire_lease(message.execution_id, config.lease())
            .await?
        else {
            // Held elsewhere or terminal; redelivery will sort out the rest
            debug!("lease unavailable, absorbing message");
            return Ok(());
        };

        match self.executor.execute(&lease).await {
            Ok(ExecutionOutcome::Failed {
                retryable: true,
                retry_delay,
                ..
            }) => {
                let delay = retry_delay.unwrap_or_else(|| {
                    execution_backoff(
                        config.retry_base_ms,
                        message.retry_count,
                        config.retry_max_delay_ms,
                    )
                });
                self.requeue(message, delay).await
            }

            Ok(ExecutionOutcome::Sleeping { wake_at, .. }) => {
                self.requeue_at(message, wake_at).await
            }

            Ok(ExecutionOutcome::WaitingForSignal {
                timeout_at: Some(timeout_at),
                ..
            }) => self.requeue_at(message, timeout_at).await,

            // Completed, terminally failed, cancelled, or waiting without a
            // deadline (signal ingress schedules the wake)
            Ok(outcome) => {
                debug!(?outcome, "message settled");
                Ok(())
            }

            Err(e) => {
                warn!(error = %e, "executor error, requeueing");
                let _ = self
                    .store
                    .fail_execution(lease.id(), lease.lock_id, &e.to_string(), true, None)
                    .await;
                let delay = execution_backoff(
                    config.retry_base_ms,
                    message.retry_count,
                    config.retry_max_delay_ms,
                );
                self.requeue(message, delay).await
            }
        }
    }

    async fn requeue(&self, message: QueueMessage, delay: Duration) -> Result<(), SchedulerError> {
        self.transport
            .enqueue(message.redelivery(), delay.min(MAX_QUEUE_DELAY))
            .await
    }

    async fn requeue_at(
        &self,
        message: QueueMessage,
        at: DateTime<Utc>,
    ) -> Result<(), SchedulerError> {
        let delay = (at - Utc::now()).to_std().unwrap_or(Duration::ZERO);
        self.requeue(message, delay).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::engine::InMemoryWorkflowSource;
    use crate::persistence::{ExecutionStatus, InMemoryExecutionStore, NewExecution};
    use crate::step::ToolGateway;
    use crate::workflow::{Step, StepAction, WorkflowDefinition};
    use serde_json::json;

    #[tokio::test]
    async fn test_in_process_queue_delivers_immediately() {
        let queue = InProcessQueue::new();
        let message = QueueMessage::new(Uuid::now_v7(), None);

        queue.enqueue(message.clone(), Duration::ZERO).await.unwrap();
        let received = queue.receive().await.unwrap().unwrap();
        assert_eq!(received, message);
    }

    #[tokio::test]
    async fn test_in_process_queue_honors_delay() {
        let queue = InProcessQueue::new();
        let message = QueueMessage::new(Uuid::now_v7(), None);

        queue
            .enqueue(message.clone(), Duration::from_millis(50))
            .await
            .unwrap();

        // Not there yet
        let early = tokio::time::timeout(Duration::from_millis(10), queue.receive()).await;
        assert!(early.is_err());

        let received = tokio::time::timeout(Duration::from_millis(500), queue.receive())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(received.execution_id, message.execution_id);
    }

    #[tokio::test]
    async fn test_rejects_delay_beyond_maximum() {
        let queue = InProcessQueue::new();
        let err = queue
            .enqueue(
                QueueMessage::new(Uuid::now_v7(), None),
                MAX_QUEUE_DELAY + Duration::from_secs(1),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, SchedulerError::DelayTooLong(_)));
    }

    #[tokio::test]
    async fn test_consumer_completes_execution() {
        let store = Arc::new(InMemoryExecutionStore::new());
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

        let gateway =
            ToolGateway::new("http://localhost:1", "unused", Duration::from_secs(1)).unwrap();
        let executor = Arc::new(Executor::new(
            store.clone() as Arc<dyn ExecutionStore>,
            workflows,
            gateway,
            EngineConfig::default(),
        ));

        let transport = Arc::new(InProcessQueue::new());
        let scheduler = QueueScheduler::new(Arc::clone(&transport));
        let consumer = Arc::new(QueueConsumer::new(
            transport,
            store.clone() as Arc<dyn ExecutionStore>,
            executor,
        ));
        let handle = consumer.spawn();

        let execution = store
            .create_execution(NewExecution::new("wf", json!({})))
            .await
            .unwrap();
        scheduler
            .schedule(execution.id, ScheduleOptions::immediate())
            .await
            .unwrap();

        // Wait for the consumer to settle the message
        for _ in 0..100 {
            let row = store.get_execution(execution.id).await.unwrap().unwrap();
            if row.status == ExecutionStatus::Completed {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        let row = store.get_execution(execution.id).await.unwrap().unwrap();
        assert_eq!(row.status, ExecutionStatus::Completed);
        assert_eq!(row.output, Some(json!(42)));

        consumer.shutdown();
        let _ = handle.await;
    }

    #[tokio::test]
    async fn test_cancel_is_unsupported() {
        let transport = Arc::new(InProcessQueue::new());
        let scheduler = QueueScheduler::new(transport);
        assert!(!scheduler.cancel(Uuid::now_v7()).await.unwrap());
    }
}

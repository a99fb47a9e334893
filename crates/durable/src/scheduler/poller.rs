//! Polling scheduler with adaptive backoff
//!
//! A background loop claims batches of eligible executions and drives them
//! through the executor. The tick interval shrinks while work keeps
//! arriving and stretches while idle, clamped to a configured band. Orphan
//! recovery costs nothing: an expired lease satisfies the claiming
//! predicate, so a crashed owner's execution is re-claimed on a later tick
//! until its retry budget runs out.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use super::{ScheduleOptions, Scheduler, SchedulerError};
use crate::engine::Executor;
use crate::persistence::{CancelOutcome, ExecutionStore};

/// Polling configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PollerConfig {
    /// Starting tick interval
    #[serde(with = "duration_millis")]
    pub poll_interval: Duration,

    /// Fastest allowed tick interval
    #[serde(with = "duration_millis")]
    pub min_interval: Duration,

    /// Slowest allowed tick interval
    #[serde(with = "duration_millis")]
    pub max_interval: Duration,

    /// Interval multiplier after an idle tick
    pub backoff_multiplier: f64,

    /// Interval multiplier after a productive tick
    pub speedup_multiplier: f64,

    /// Executions claimed per tick
    pub batch_size: usize,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            min_interval: Duration::from_millis(100),
            max_interval: Duration::from_secs(30),
            backoff_multiplier: 1.5,
            speedup_multiplier: 0.5,
            batch_size: 10,
        }
    }
}

impl PollerConfig {
    /// Create a new poller configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the starting interval
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Set the fastest interval
    pub fn with_min_interval(mut self, interval: Duration) -> Self {
        self.min_interval = interval;
        self
    }

    /// Set the slowest interval
    pub fn with_max_interval(mut self, interval: Duration) -> Self {
        self.max_interval = interval;
        self
    }

    /// Set the idle multiplier
    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier.max(1.0);
        self
    }

    /// Set the productive multiplier
    pub fn with_speedup_multiplier(mut self, multiplier: f64) -> Self {
        self.speedup_multiplier = multiplier.clamp(0.01, 1.0);
        self
    }

    /// Set the claim batch size
    pub fn with_batch_size(mut self, size: usize) -> Self {
        self.batch_size = size.max(1);
        self
    }

    /// Next interval after a tick
    pub fn next_interval(&self, current: Duration, productive: bool) -> Duration {
        let multiplier = if productive {
            self.speedup_multiplier
        } else {
            self.backoff_multiplier
        };
        self.clamp(Duration::from_secs_f64(
            current.as_secs_f64() * multiplier,
        ))
    }

    /// Protective interval after an uncaught tick error: double once
    pub fn error_interval(&self, current: Duration) -> Duration {
        self.clamp(current * 2)
    }

    fn clamp(&self, interval: Duration) -> Duration {
        interval.max(self.min_interval).min(self.max_interval)
    }
}

/// Polling scheduler
///
/// `schedule` defers eligibility through the store; the actual handoff to
/// the executor happens in [`tick`](Self::tick).
pub struct PollingScheduler {
    store: Arc<dyn ExecutionStore>,
    executor: Arc<Executor>,
    config: PollerConfig,
    shutdown_tx: watch::Sender<bool>,
}

impl PollingScheduler {
    /// Create a polling scheduler
    pub fn new(store: Arc<dyn ExecutionStore>, executor: Arc<Executor>, config: PollerConfig) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            store,
            executor,
            config,
            shutdown_tx,
        }
    }

    /// One scheduling pass: wake due timers, claim a batch, execute each
    ///
    /// Returns the number of executions handed to the executor.
    #[instrument(skip(self))]
    pub async fn tick(&self) -> Result<usize, SchedulerError> {
        let now = Utc::now();
        let lease = self.executor.config().lease();

        self.store.wake_due(now, self.config.batch_size).await?;

        let leased = self
            .store
            .find_pending(self.config.batch_size, lease, now)
            .await?;
        let claimed = leased.len();

        for lease in &leased {
            match self.executor.execute(lease).await {
                Ok(outcome) => {
                    debug!(execution_id = %lease.id(), ?outcome, "tick processed execution");
                }
                Err(e) => {
                    // An unexpected executor error consumes one retry
                    warn!(execution_id = %lease.id(), error = %e, "executor error in tick");
                    let _ = self
                        .store
                        .fail_execution(lease.id(), lease.lock_id, &e.to_string(), true, None)
                        .await;
                    let _ = self.store.release_lease(lease.id(), lease.lock_id).await;
                }
            }
        }

        if claimed > 0 {
            debug!(claimed, "tick complete");
        }
        Ok(claimed)
    }

    /// Run the adaptive loop until shutdown
    pub async fn run(&self) {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let mut interval = self.config.poll_interval;
        info!(batch_size = self.config.batch_size, "polling scheduler started");

        loop {
            if *shutdown_rx.borrow() {
                break;
            }

            interval = match self.tick().await {
                Ok(claimed) => self.config.next_interval(interval, claimed > 0),
                Err(e) => {
                    warn!(error = %e, "tick failed, backing off");
                    self.config.error_interval(interval)
                }
            };

            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = shutdown_rx.changed() => {}
            }
        }

        info!("polling scheduler stopped");
    }

    /// Spawn the loop onto the runtime
    pub fn spawn(self: &Arc<Self>) -> JoinHandle<()> {
        let this = Arc::clone(self);
        tokio::spawn(async move { this.run().await })
    }

    /// Request shutdown; the loop exits at the next opportunity
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }
}

#[async_trait]
impl Scheduler for PollingScheduler {
    async fn schedule(
        &self,
        execution_id: Uuid,
        options: ScheduleOptions,
    ) -> Result<(), SchedulerError> {
        // Pending rows are picked up by ticks; only deferrals need a write
        if let Some(run_at) = options.run_at {
            self.store.reschedule(execution_id, run_at).await?;
        }
        Ok(())
    }

    async fn cancel(&self, execution_id: Uuid) -> Result<bool, SchedulerError> {
        let outcome = self.store.cancel_execution(execution_id).await?;
        Ok(matches!(
            outcome,
            CancelOutcome::Cancelled | CancelOutcome::AlreadyCancelled
        ))
    }
}

/// Serde support for Duration as milliseconds
mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.as_millis().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
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

    #[test]
    fn test_default_config() {
        let config = PollerConfig::default();
        assert_eq!(config.poll_interval, Duration::from_secs(1));
        assert_eq!(config.min_interval, Duration::from_millis(100));
        assert_eq!(config.max_interval, Duration::from_secs(30));
        assert_eq!(config.backoff_multiplier, 1.5);
        assert_eq!(config.speedup_multiplier, 0.5);
        assert_eq!(config.batch_size, 10);
    }

    #[test]
    fn test_interval_adaptation() {
        let config = PollerConfig::default();
        let base = Duration::from_secs(1);

        // Productive ticks speed the loop up, idle ticks slow it down
        assert_eq!(config.next_interval(base, true), Duration::from_millis(500));
        assert_eq!(config.next_interval(base, false), Duration::from_millis(1500));

        // Both directions clamp to the band
        assert_eq!(
            config.next_interval(Duration::from_millis(100), true),
            config.min_interval
        );
        assert_eq!(
            config.next_interval(Duration::from_secs(30), false),
            config.max_interval
        );
    }

    #[test]
    fn test_error_interval_doubles_once() {
        let config = PollerConfig::default();
        assert_eq!(
            config.error_interval(Duration::from_secs(2)),
            Duration::from_secs(4)
        );
        assert_eq!(
            config.error_interval(Duration::from_secs(20)),
            config.max_interval
        );
    }

    fn scheduler(
        store: Arc<InMemoryExecutionStore>,
        workflows: Arc<InMemoryWorkflowSource>,
    ) -> PollingScheduler {
        let gateway =
            ToolGateway::new("http://localhost:1", "unused", Duration::from_secs(1)).unwrap();
        let executor = Arc::new(Executor::new(
            store.clone(),
            workflows,
            gateway,
            EngineConfig::default().with_lease_ms(5_000),
        ));
        PollingScheduler::new(store, executor, PollerConfig::default())
    }

    #[tokio::test]
    async fn test_tick_processes_pending_execution() {
        let store = Arc::new(InMemoryExecutionStore::new());
        let workflows = Arc::new(InMemoryWorkflowSource::new());
        workflows.insert(WorkflowDefinition::new(
            "wf",
            vec![Step {
                name: "double".to_string(),
                action: StepAction::Code {
                    code: "export default (x) => x.n * 2".to_string(),
                },
                input: Some(json!("@input")),
                retry: None,
                config: None,
            }],
        ));

        let scheduler = scheduler(Arc::clone(&store), workflows);
        let execution = store
            .create_execution(NewExecution::new("wf", json!({"n": 21})))
            .await
            .unwrap();

        let claimed = scheduler.tick().await.unwrap();
        assert_eq!(claimed, 1);

        let row = store.get_execution(execution.id).await.unwrap().unwrap();
        assert_eq!(row.status, ExecutionStatus::Completed);
        assert_eq!(row.output, Some(json!(42)));

        // Nothing left to claim
        assert_eq!(scheduler.tick().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_schedule_defers_eligibility() {
        let store = Arc::new(InMemoryExecutionStore::new());
        let workflows = Arc::new(InMemoryWorkflowSource::new());
        workflows.insert(WorkflowDefinition::new(
            "wf",
            vec![Step {
                name: "noop".to_string(),
                action: StepAction::Code {
                    code: "export default (x) => 1".to_string(),
                },
                input: None,
                retry: None,
                config: None,
            }],
        ));

        let scheduler = scheduler(Arc::clone(&store), workflows);
        let execution = store
            .create_execution(NewExecution::new("wf", json!({})))
            .await
            .unwrap();

        scheduler
            .schedule(
                execution.id,
                ScheduleOptions::at(Utc::now() + chrono::Duration::hours(1)),
            )
            .await
            .unwrap();

        // Deferred executions are invisible to the tick
        assert_eq!(scheduler.tick().await.unwrap(), 0);
        let row = store.get_execution(execution.id).await.unwrap().unwrap();
        assert_eq!(row.status, ExecutionStatus::Pending);
    }
}

//! Pluggable scheduling
//!
//! The scheduler decides *when* an execution is processed next; the
//! contract is deliberately narrow (`schedule` plus optional `cancel`) so a
//! deployment can pick the adapter its runtime supports without touching
//! executor code:
//! - [`PollingScheduler`] — long-running processes; adaptive-interval ticks
//!   over `find_pending`, orphan recovery free by construction
//! - [`QueueScheduler`] / [`QueueConsumer`] — delay-queue backends

mod poller;
mod queue;

pub use poller::{PollerConfig, PollingScheduler};
pub use queue::{
    InProcessQueue, QueueConsumer, QueueMessage, QueueScheduler, QueueTransport, MAX_QUEUE_DELAY,
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::persistence::StoreError;

/// Errors from scheduler operations
#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    /// Store error
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Queue transport failure
    #[error("queue error: {0}")]
    Queue(String),

    /// Requested delay exceeds what the queue backend supports
    #[error("delay {0:?} exceeds the queue maximum")]
    DelayTooLong(std::time::Duration),
}

/// Options for scheduling an execution
#[derive(Debug, Clone, Default)]
pub struct ScheduleOptions {
    /// Process no earlier than this instant
    pub run_at: Option<DateTime<Utc>>,

    /// Opaque authorization carried alongside queue messages
    pub authorization: Option<String>,
}

impl ScheduleOptions {
    /// Eligible immediately
    pub fn immediate() -> Self {
        Self::default()
    }

    /// Eligible no earlier than `run_at`
    pub fn at(run_at: DateTime<Utc>) -> Self {
        Self {
            run_at: Some(run_at),
            authorization: None,
        }
    }
}

/// Decides when an execution is processed next
#[async_trait]
pub trait Scheduler: Send + Sync + 'static {
    /// Make the execution eligible for processing
    async fn schedule(
        &self,
        execution_id: Uuid,
        options: ScheduleOptions,
    ) -> Result<(), SchedulerError>;

    /// Best-effort cancellation; not every implementation supports it
    async fn cancel(&self, _execution_id: Uuid) -> Result<bool, SchedulerError> {
        Ok(false)
    }
}

//! ExecutionStore trait definition

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::workflow::{ExecutionEvent, NewEvent};

/// Error type for store operations
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Execution not found
    #[error("execution not found: {0}")]
    ExecutionNotFound(Uuid),

    /// Database error
    #[error("database error: {0}")]
    Database(String),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(String),
}

/// Execution status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    /// Eligible for claiming (newly created, retrying, or woken)
    Pending,

    /// Owned by a worker under a live lease
    Running,

    /// Finished with an output
    Completed,

    /// Finished with an error
    Failed,

    /// Cancelled by an operator
    Cancelled,

    /// Suspended on a durable timer
    Sleeping,

    /// Suspended until a signal arrives (or the wait times out)
    WaitingForSignal,
}

impl ExecutionStatus {
    /// Terminal states are sticky
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Running => write!(f, "running"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
            Self::Cancelled => write!(f, "cancelled"),
            Self::Sleeping => write!(f, "sleeping"),
            Self::WaitingForSignal => write!(f, "waiting_for_signal"),
        }
    }
}

impl std::str::FromStr for ExecutionStatus {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            "sleeping" => Ok(Self::Sleeping),
            "waiting_for_signal" => Ok(Self::WaitingForSignal),
            other => Err(StoreError::Database(format!(
                "unknown execution status: {other}"
            ))),
        }
    }
}

/// Milliseconds since the Unix epoch
pub fn epoch_ms(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

/// Inverse of [`epoch_ms`]
pub fn from_epoch_ms(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms).single().unwrap_or_default()
}

/// Parameters for creating an execution
#[derive(Debug, Clone)]
pub struct NewExecution {
    pub workflow_id: String,
    pub input: serde_json::Value,
    pub max_retries: u32,
    pub parent_execution_id: Option<Uuid>,
}

impl NewExecution {
    /// Create with the given workflow id and input
    pub fn new(workflow_id: impl Into<String>, input: serde_json::Value) -> Self {
        Self {
            workflow_id: workflow_id.into(),
            input,
            max_retries: 10,
            parent_execution_id: None,
        }
    }

    /// Override the retry budget
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Link to a parent execution
    pub fn with_parent(mut self, parent: Uuid) -> Self {
        self.parent_execution_id = Some(parent);
        self
    }
}

/// An execution row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Execution {
    pub id: Uuid,
    pub workflow_id: String,
    pub status: ExecutionStatus,
    pub input: serde_json::Value,
    pub output: Option<serde_json::Value>,
    pub error: Option<String>,
    pub retry_count: u32,
    pub max_retries: u32,
    pub lock_id: Option<Uuid>,
    pub locked_until_epoch_ms: Option<i64>,
    pub next_run_at_epoch_ms: Option<i64>,
    pub started_at_epoch_ms: Option<i64>,
    pub completed_at_epoch_ms: Option<i64>,
    pub parent_execution_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Execution {
    /// Whether the execution is in a sticky terminal state
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

/// An execution claimed under a fresh lease
#[derive(Debug, Clone)]
pub struct LeasedExecution {
    pub execution: Execution,
    pub lock_id: Uuid,
}

impl LeasedExecution {
    /// Execution id shorthand
    pub fn id(&self) -> Uuid {
        self.execution.id
    }
}

/// Outcome of failing an execution
#[derive(Debug, Clone, PartialEq)]
pub enum FailureOutcome {
    /// Requeued; eligible again at `next_run_at`
    WillRetry { next_run_at: DateTime<Utc> },

    /// Terminally failed
    Terminal,

    /// The lease was lost; another owner has taken over and the write no-oped
    Lost,
}

impl FailureOutcome {
    pub fn will_retry(&self) -> bool {
        matches!(self, Self::WillRetry { .. })
    }
}

/// Outcome of a cancellation request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelOutcome {
    Cancelled,
    AlreadyCancelled,
    NotCancellable,
    NotFound,
}

/// Outcome of a resume request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResumeOutcome {
    Resumed,
    NotResumable,
    NotFound,
}

/// A persisted step result
///
/// Primary key is `(execution_id, step_id)`. A non-null `completed_at` with
/// no error is authoritative: replay skips the step and reuses the output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepResult {
    pub execution_id: Uuid,
    pub step_id: String,
    pub attempt: u32,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub output: Option<serde_json::Value>,
    pub error: Option<String>,
}

impl StepResult {
    /// Whether replay may skip this step
    pub fn is_replayable(&self) -> bool {
        self.completed_at.is_some() && self.error.is_none()
    }
}

/// A partial step-result write
///
/// Absent fields leave the stored value untouched, which makes the upsert
/// idempotent under re-entry.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StepResultPatch {
    pub attempt: Option<u32>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub output: Option<serde_json::Value>,
    pub error: Option<String>,
    pub clear_error: bool,
}

impl StepResultPatch {
    /// Mark the step started
    pub fn started(at: DateTime<Utc>) -> Self {
        Self {
            started_at: Some(at),
            ..Default::default()
        }
    }

    /// Mark the step completed with its output
    pub fn completed(at: DateTime<Utc>, output: serde_json::Value) -> Self {
        Self {
            completed_at: Some(at),
            output: Some(output),
            clear_error: true,
            ..Default::default()
        }
    }

    /// Record a failed attempt
    pub fn failed(attempt: u32, error: impl Into<String>) -> Self {
        Self {
            attempt: Some(attempt),
            error: Some(error.into()),
            ..Default::default()
        }
    }
}

/// One buffered chunk of a streaming tool response
#[derive(Debug, Clone, PartialEq)]
pub struct StepStreamChunk {
    pub execution_id: Uuid,
    pub step_id: String,
    pub chunk_index: u32,
    pub data: serde_json::Value,
}

/// Store for executions, step results, events, and leases
///
/// This trait hides the database dialect. Implementations must be
/// thread-safe and give identical semantics for every operation; all state
/// transitions on an execution row are compare-and-set so that a worker
/// holding a stale lease silently no-ops.
#[async_trait]
pub trait ExecutionStore: Send + Sync + 'static {
    // =========================================================================
    // Execution Lifecycle
    // =========================================================================

    /// Insert a new execution with status `pending`
    async fn create_execution(&self, new: NewExecution) -> Result<Execution, StoreError>;

    /// Fetch an execution
    async fn get_execution(&self, id: Uuid) -> Result<Option<Execution>, StoreError>;

    /// Atomically claim an execution
    ///
    /// Succeeds iff status is pending or running, the retry budget is not
    /// exhausted, and any previous lease has expired. Writes a fresh random
    /// lock id and moves pending to running.
    async fn acquire_lease(
        &self,
        id: Uuid,
        lease: Duration,
    ) -> Result<Option<LeasedExecution>, StoreError>;

    /// Clear the lease iff `lock_id` still matches
    async fn release_lease(&self, id: Uuid, lock_id: Uuid) -> Result<(), StoreError>;

    /// Claim up to `limit` eligible executions, oldest first
    ///
    /// Same admission predicate as [`acquire_lease`](Self::acquire_lease),
    /// plus `next_run_at <= scheduled_before`. Two concurrent finders must
    /// never observe the same row as acquired.
    async fn find_pending(
        &self,
        limit: usize,
        lease: Duration,
        scheduled_before: DateTime<Utc>,
    ) -> Result<Vec<LeasedExecution>, StoreError>;

    /// Terminal success; CAS on `lock_id`, false when the lease was lost
    async fn complete_execution(
        &self,
        id: Uuid,
        lock_id: Uuid,
        output: serde_json::Value,
    ) -> Result<bool, StoreError>;

    /// Record a failure; requeues with backoff while the retry budget lasts
    ///
    /// `retry_delay` overrides the engine backoff (used when a step retry
    /// policy dictates the delay).
    async fn fail_execution(
        &self,
        id: Uuid,
        lock_id: Uuid,
        error: &str,
        retryable: bool,
        retry_delay: Option<Duration>,
    ) -> Result<FailureOutcome, StoreError>;

    /// Suspend on a durable timer and release the lease
    async fn set_sleeping(
        &self,
        id: Uuid,
        lock_id: Uuid,
        step: &str,
        wake_at: DateTime<Utc>,
    ) -> Result<bool, StoreError>;

    /// Suspend until a signal arrives and release the lease
    async fn set_waiting(
        &self,
        id: Uuid,
        lock_id: Uuid,
        step: &str,
        signal_name: &str,
        timeout_at: Option<DateTime<Utc>>,
    ) -> Result<bool, StoreError>;

    /// Force cancellation of a non-terminal execution
    ///
    /// Cooperative: an owning executor observes the status at its next step
    /// boundary.
    async fn cancel_execution(&self, id: Uuid) -> Result<CancelOutcome, StoreError>;

    /// Move a cancelled or failed execution back to pending
    async fn resume_execution(
        &self,
        id: Uuid,
        reset_retries: bool,
    ) -> Result<ResumeOutcome, StoreError>;

    /// Defer eligibility until `run_at`
    async fn reschedule(&self, id: Uuid, run_at: DateTime<Utc>) -> Result<(), StoreError>;

    /// Wake suspended executions whose timer events are due
    ///
    /// Returns the number of executions flipped back to pending.
    async fn wake_due(&self, now: DateTime<Utc>, limit: usize) -> Result<u64, StoreError>;

    /// CAS waiting_for_signal back to pending (called on signal ingress)
    async fn wake_for_signal(&self, id: Uuid) -> Result<bool, StoreError>;

    // =========================================================================
    // Step Results
    // =========================================================================

    /// Insert-or-update a step result; idempotent under re-entry
    async fn upsert_step_result(
        &self,
        execution_id: Uuid,
        step_id: &str,
        patch: StepResultPatch,
    ) -> Result<(), StoreError>;

    /// All step results for an execution
    async fn step_results(&self, execution_id: Uuid) -> Result<Vec<StepResult>, StoreError>;

    // =========================================================================
    // Events
    // =========================================================================

    /// Append an event
    ///
    /// `output` events are unique per `(execution, name)`; a duplicate
    /// append returns the existing row. Timer events go through
    /// [`schedule_timer`](Self::schedule_timer).
    async fn append_event(
        &self,
        execution_id: Uuid,
        event: NewEvent,
    ) -> Result<ExecutionEvent, StoreError>;

    /// Full event trail in creation order
    async fn events(&self, execution_id: Uuid) -> Result<Vec<ExecutionEvent>, StoreError>;

    /// Unconsumed signal events in creation order
    async fn pending_signals(&self, execution_id: Uuid)
        -> Result<Vec<ExecutionEvent>, StoreError>;

    /// CAS `consumed_at` from null; true iff this caller won
    async fn consume_event(&self, event_id: Uuid) -> Result<bool, StoreError>;

    /// The step's timer event, if due and unconsumed
    async fn check_timer(
        &self,
        execution_id: Uuid,
        step: &str,
    ) -> Result<Option<ExecutionEvent>, StoreError>;

    /// Idempotently insert a timer event for a step
    async fn schedule_timer(
        &self,
        execution_id: Uuid,
        step: &str,
        wake_at: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    /// Consume a step's timer regardless of due time (wait resolved early)
    async fn cancel_timer(&self, execution_id: Uuid, step: &str) -> Result<(), StoreError>;

    // =========================================================================
    // Stream Chunks
    // =========================================================================

    /// Buffer one chunk of a streaming tool response
    async fn append_stream_chunk(
        &self,
        execution_id: Uuid,
        step_id: &str,
        chunk_index: u32,
        data: serde_json::Value,
    ) -> Result<(), StoreError>;

    /// Buffered chunks in index order
    async fn stream_chunks(
        &self,
        execution_id: Uuid,
        step_id: &str,
    ) -> Result<Vec<StepStreamChunk>, StoreError>;

    /// Drop a step's chunk buffer (after coalescing into the step result)
    async fn clear_stream_chunks(
        &self,
        execution_id: Uuid,
        step_id: &str,
    ) -> Result<(), StoreError>;
}

//! # Durable Workflow Engine
//!
//! A persistent, resumable, event-driven workflow executor with
//! at-least-once delivery, optimistic leases, durable timers, external
//! signals, step-level retries, and dynamic fan-out.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     WorkflowService                          │
//! │   (create/queue, execute, cancel, resume, send_signal)      │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌──────────────┐   ┌─────────────────────┐   ┌───────────────┐
//! │  Scheduler   │──▶│      Executor       │──▶│  StepRunner   │
//! │ (poll/queue) │   │ (replay, suspend,   │   │ (tool, code,  │
//! │              │◀──│  retry policy)      │◀──│ sleep, signal)│
//! └──────────────┘   └─────────────────────┘   └───────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      ExecutionStore                          │
//! │  (executions + leases, step results, events, chunks)        │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! The execution lease is the only mutual-exclusion primitive: every
//! terminal write is a compare-and-set on the lease's lock id and silently
//! no-ops when another worker has taken over. Suspensions (durable sleeps,
//! signal waits) are tagged executor outcomes, not blocked threads; the
//! scheduler re-enters the execution when its timer fires or a signal
//! arrives.
//!
//! ## Example
//!
//! ```ignore
//! use windlass_durable::prelude::*;
//!
//! let store = Arc::new(PostgresExecutionStore::new(pool));
//! store.migrate().await?;
//!
//! let workflows = Arc::new(InMemoryWorkflowSource::new());
//! workflows.insert(my_definition);
//!
//! let gateway = ToolGateway::new(gateway_url, token, config.tool_timeout())?;
//! let executor = Arc::new(Executor::new(store.clone(), workflows.clone(), gateway, config));
//! let scheduler = Arc::new(PollingScheduler::new(store.clone(), executor.clone(), PollerConfig::default()));
//! scheduler.spawn();
//!
//! let service = WorkflowService::new(store, workflows, scheduler, executor);
//! let created = service.create_and_queue_execution("my-workflow", Some(input)).await?;
//! ```

pub mod config;
pub mod engine;
pub mod persistence;
pub mod scheduler;
pub mod service;
pub mod step;
pub mod workflow;

/// Prelude for common imports
pub mod prelude {
    pub use crate::config::EngineConfig;
    pub use crate::engine::{
        ExecutionOutcome, Executor, ExecutorError, InMemoryWorkflowSource, WorkflowSource,
    };
    pub use crate::persistence::{
        CancelOutcome, Execution, ExecutionStatus, ExecutionStore, InMemoryExecutionStore,
        PostgresExecutionStore, ResumeOutcome, SqliteExecutionStore, StepResult, StoreError,
    };
    pub use crate::scheduler::{
        PollerConfig, PollingScheduler, QueueConsumer, QueueScheduler, ScheduleOptions, Scheduler,
    };
    pub use crate::service::{ServiceError, WorkflowService};
    pub use crate::step::{CodeSandbox, StepError, StepRunner, ToolGateway};
    pub use crate::workflow::{
        ConcurrencyMode, Step, StepAction, StepRetry, WorkflowDefinition,
    };
}

// Re-export key types at crate root
pub use config::EngineConfig;
pub use engine::{ExecutionOutcome, Executor, ExecutorError, InMemoryWorkflowSource, WorkflowSource};
pub use persistence::{
    CancelOutcome, Execution, ExecutionStatus, ExecutionStore, InMemoryExecutionStore,
    PostgresExecutionStore, ResumeOutcome, SqliteExecutionStore, StoreError,
};
pub use scheduler::{PollerConfig, PollingScheduler, QueueConsumer, QueueScheduler, Scheduler};
pub use service::{ServiceError, WorkflowService};
pub use step::{StepError, ToolGateway};
pub use workflow::{Step, StepAction, WorkflowDefinition};

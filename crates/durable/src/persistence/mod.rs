//! Persistence layer
//!
//! This module provides:
//! - [`ExecutionStore`] trait for executions, step results, events, and leases
//! - [`PostgresExecutionStore`] for production (SKIP LOCKED claiming)
//! - [`SqliteExecutionStore`] for single-node deployments (guarded-update claiming)
//! - [`InMemoryExecutionStore`] for testing

mod memory;
mod postgres;
mod sqlite;
mod store;

pub use memory::InMemoryExecutionStore;
pub use postgres::PostgresExecutionStore;
pub use sqlite::SqliteExecutionStore;
pub use store::{
    epoch_ms, from_epoch_ms, CancelOutcome, Execution, ExecutionStatus, ExecutionStore,
    FailureOutcome, LeasedExecution, NewExecution, ResumeOutcome, StepResult, StepResultPatch,
    StepStreamChunk, StoreError,
};

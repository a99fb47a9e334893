//! Workflow execution engine
//!
//! The engine module provides the [`Executor`], which drives one execution's
//! state machine under a held lease, plus the [`WorkflowSource`] seam for
//! definition lookup.

mod control_flow;
mod executor;
mod source;

pub use executor::{ExecutionOutcome, Executor, ExecutorError};
pub use source::{InMemoryWorkflowSource, WorkflowSource};

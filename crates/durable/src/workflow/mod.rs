//! Workflow definitions, events, and reference resolution
//!
//! This module contains the data model the engine executes:
//! - [`WorkflowDefinition`] / [`Step`] / [`StepAction`] — the immutable definition
//! - [`ExecutionEvent`] / [`EventType`] — the per-execution event queue
//! - [`Scratchpad`] / [`Reference`] — `@` reference resolution
//! - [`StepRetry`] — per-step retry policy

mod definition;
mod event;
mod reference;
mod retry;

pub use definition::{
    expanded_step_name, ConcurrencyMode, DefinitionError, ForEachConfig, ParallelGroup, Step,
    StepAction, StepConfig, WorkflowDefinition,
};
pub use event::{EventType, ExecutionEvent, NewEvent};
pub use reference::{Reference, ReferenceError, Scratchpad, Segment};
pub use retry::{execution_backoff, StepRetry};

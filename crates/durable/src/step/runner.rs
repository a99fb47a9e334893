//! Typed dispatch for step actions

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::json;
use tracing::instrument;

use super::code::{CodeSandbox, SandboxLimits};
use super::tool::ToolGateway;
use super::{signal, sleep, StepError};
use crate::config::EngineConfig;
use crate::persistence::{Execution, ExecutionStore, StepResult};
use crate::workflow::{NewEvent, Step, StepAction};

/// A control-flow suspension reported by a step
#[derive(Debug, Clone, PartialEq)]
pub enum Suspension {
    /// Durable sleep until `wake_at`
    Sleep { wake_at: DateTime<Utc> },

    /// Waiting for a named signal, with an optional deadline
    Signal {
        signal_name: String,
        timeout_at: Option<DateTime<Utc>>,
    },
}

/// Outcome of running one step body
#[derive(Debug, Clone, PartialEq)]
pub enum StepRun {
    /// The step produced its output
    Completed(serde_json::Value),

    /// The step suspended; the executor must not advance
    Suspended(Suspension),
}

/// Executes step bodies
///
/// Pure dispatch: each step kind is a function of the step, its resolved
/// input, the owning execution, and any prior persisted state. Policy
/// (retries, status transitions, event trail) stays in the executor.
pub struct StepRunner {
    store: Arc<dyn ExecutionStore>,
    gateway: ToolGateway,
    sandbox: CodeSandbox,
    config: EngineConfig,
}

impl StepRunner {
    /// Create a runner
    pub fn new(store: Arc<dyn ExecutionStore>, gateway: ToolGateway, config: EngineConfig) -> Self {
        let sandbox = CodeSandbox::new(SandboxLimits::from_config(&config));
        Self {
            store,
            gateway,
            sandbox,
            config,
        }
    }

    /// Run one step body
    #[instrument(skip(self, execution, step, input, prior), fields(execution_id = %execution.id, step = %step.name))]
    pub async fn run(
        &self,
        execution: &Execution,
        step: &Step,
        input: serde_json::Value,
        prior: Option<&StepResult>,
    ) -> Result<StepRun, StepError> {
        match &step.action {
            StepAction::Tool {
                connection_id,
                tool_name,
            } => {
                let output = self
                    .gateway
                    .call(
                        &*self.store,
                        execution.id,
                        &step.name,
                        connection_id,
                        tool_name,
                        &input,
                    )
                    .await?;
                Ok(StepRun::Completed(output))
            }

            StepAction::Code { code } => {
                let output = self.sandbox.evaluate(code, input).await?;
                if !output.logs.is_empty() {
                    self.store
                        .append_event(
                            execution.id,
                            NewEvent::message(&step.name, json!({ "logs": output.logs })),
                        )
                        .await?;
                }
                Ok(StepRun::Completed(output.value))
            }

            StepAction::Sleep {
                sleep_ms,
                sleep_until,
            } => {
                sleep::run(
                    &*self.store,
                    execution.id,
                    &step.name,
                    *sleep_ms,
                    *sleep_until,
                    prior,
                    self.config.inline_sleep_budget(),
                )
                .await
            }

            StepAction::WaitForSignal {
                signal_name,
                timeout_ms,
            } => {
                signal::run(
                    &*self.store,
                    execution.id,
                    &step.name,
                    signal_name,
                    *timeout_ms,
                    prior,
                )
                .await
            }
        }
    }
}

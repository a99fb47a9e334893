//! Workflow and step definitions
//!
//! A [`WorkflowDefinition`] is immutable data: an ordered list of steps, each
//! with an action (tool call, code, sleep, wait-for-signal), an optional
//! input template containing `@` references, an optional retry policy, and
//! optional fan-out configuration.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::reference::Reference;
use super::retry::StepRetry;

/// Errors detected while validating a workflow definition
///
/// All of these are non-retryable: a malformed definition fails the same way
/// on every attempt.
#[derive(Debug, Clone, thiserror::Error, PartialEq)]
pub enum DefinitionError {
    /// Workflow has no steps
    #[error("workflow '{0}' has no steps")]
    EmptyWorkflow(String),

    /// Two steps share a name
    #[error("duplicate step name '{0}'")]
    DuplicateStepName(String),

    /// A user-declared step name collides with a forEach expansion
    #[error("step name '{0}' collides with forEach expansion of '{1}'")]
    ExpansionCollision(String, String),

    /// Sleep step must declare exactly one of sleep_ms / sleep_until
    #[error("sleep step '{0}' must declare exactly one of sleep_ms or sleep_until")]
    InvalidSleep(String),

    /// forEach items must be a reference string
    #[error("forEach items of step '{0}' is not a reference: '{1}'")]
    InvalidItemsReference(String, String),
}

/// How concurrent iterations of a fan-out are coordinated
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ConcurrencyMode {
    /// Run iterations one by one; abort on first failure
    #[default]
    Sequential,

    /// Run all iterations concurrently; any failure fails the step
    Parallel,

    /// First iteration to succeed wins; losers are dropped best-effort
    Race,

    /// Run all to completion; per-iteration {status, value|reason} results
    AllSettled,
}

impl std::fmt::Display for ConcurrencyMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Sequential => write!(f, "sequential"),
            Self::Parallel => write!(f, "parallel"),
            Self::Race => write!(f, "race"),
            Self::AllSettled => write!(f, "allSettled"),
        }
    }
}

/// forEach fan-out: expand one step over a resolved list of items
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ForEachConfig {
    /// Reference to the items array (e.g. `@input.items`)
    pub items: String,

    /// Coordination mode for the iterations
    #[serde(default)]
    pub mode: ConcurrencyMode,

    /// Chunk size for `parallel` mode (unbounded when absent)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_concurrency: Option<usize>,
}

/// Parallel group membership: contiguous steps sharing a group id run as one batch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParallelGroup {
    /// Group identifier; member steps must be contiguous
    pub group: String,

    /// Coordination mode for the batch
    #[serde(default = "default_group_mode")]
    pub mode: ConcurrencyMode,
}

fn default_group_mode() -> ConcurrencyMode {
    ConcurrencyMode::Parallel
}

/// Per-step control-flow configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepConfig {
    /// Expand this step over a list of items
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub for_each: Option<ForEachConfig>,

    /// Run this step as part of a parallel group
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parallel: Option<ParallelGroup>,
}

/// The action a step performs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StepAction {
    /// Streaming call through the tool gateway
    Tool {
        /// Connection the tool belongs to
        connection_id: String,

        /// Tool to invoke
        tool_name: String,
    },

    /// Pure transformation evaluated in the sandbox
    Code {
        /// Module source; must export a default single-argument function
        code: String,
    },

    /// Pause the execution, inline or durably
    Sleep {
        /// Relative duration in milliseconds
        #[serde(default, skip_serializing_if = "Option::is_none")]
        sleep_ms: Option<u64>,

        /// Absolute wake instant
        #[serde(default, skip_serializing_if = "Option::is_none")]
        sleep_until: Option<DateTime<Utc>>,
    },

    /// Suspend until an external signal arrives
    WaitForSignal {
        /// Name the signal must match
        signal_name: String,

        /// Fail the step if no signal lands within this window
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timeout_ms: Option<u64>,
    },
}

impl StepAction {
    /// Short kind label used in logs and error messages
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Tool { .. } => "tool",
            Self::Code { .. } => "code",
            Self::Sleep { .. } => "sleep",
            Self::WaitForSignal { .. } => "wait_for_signal",
        }
    }
}

/// One node of a workflow
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    /// Unique name within the workflow; also the scratchpad key for its output
    pub name: String,

    /// What the step does
    #[serde(flatten)]
    pub action: StepAction,

    /// Input template; strings of the form `@head.path` are resolved at runtime
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<serde_json::Value>,

    /// Retry policy for this step's failures
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<StepRetry>,

    /// forEach / parallel-group configuration
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<StepConfig>,
}

impl Step {
    /// forEach configuration, if any
    pub fn for_each(&self) -> Option<&ForEachConfig> {
        self.config.as_ref().and_then(|c| c.for_each.as_ref())
    }

    /// Parallel group membership, if any
    pub fn parallel_group(&self) -> Option<&ParallelGroup> {
        self.config.as_ref().and_then(|c| c.parallel.as_ref())
    }
}

/// Name of the `index`-th expansion of a forEach step
pub fn expanded_step_name(base: &str, index: usize) -> String {
    format!("{}[{}]", base, index)
}

/// True if `name` looks like an expansion of `base` (`base[<digits>]`)
fn is_expansion_of(name: &str, base: &str) -> bool {
    name.strip_prefix(base)
        .and_then(|rest| rest.strip_prefix('['))
        .and_then(|rest| rest.strip_suffix(']'))
        .map(|inner| !inner.is_empty() && inner.bytes().all(|b| b.is_ascii_digit()))
        .unwrap_or(false)
}

/// A workflow definition, immutable once saved
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    /// Stable identifier referenced by executions
    pub id: String,

    /// Human-readable title
    #[serde(default)]
    pub title: String,

    /// Human-readable description
    #[serde(default)]
    pub description: String,

    /// Ordered step list
    pub steps: Vec<Step>,

    /// Trigger configuration; opaque to the engine
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub triggers: serde_json::Value,

    /// Declared workflow output template; defaults to the last step's output
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<serde_json::Value>,
}

impl WorkflowDefinition {
    /// Create a definition with the given id and steps
    pub fn new(id: impl Into<String>, steps: Vec<Step>) -> Self {
        Self {
            id: id.into(),
            title: String::new(),
            description: String::new(),
            steps,
            triggers: serde_json::Value::Null,
            output: None,
        }
    }

    /// Set the declared output template
    pub fn with_output(mut self, output: serde_json::Value) -> Self {
        self.output = Some(output);
        self
    }

    /// Look up a step by name
    pub fn step(&self, name: &str) -> Option<&Step> {
        self.steps.iter().find(|s| s.name == name)
    }

    /// Validate structural invariants
    ///
    /// Step names must form a set, forEach expansions (`base[i]`) must not
    /// collide with user-declared names, sleep steps must declare exactly one
    /// wake condition, and forEach items must be reference strings.
    pub fn validate(&self) -> Result<(), DefinitionError> {
        if self.steps.is_empty() {
            return Err(DefinitionError::EmptyWorkflow(self.id.clone()));
        }

        let mut seen = std::collections::HashSet::new();
        for step in &self.steps {
            if !seen.insert(step.name.as_str()) {
                return Err(DefinitionError::DuplicateStepName(step.name.clone()));
            }
        }

        for step in &self.steps {
            if let StepAction::Sleep {
                sleep_ms,
                sleep_until,
            } = &step.action
            {
                if sleep_ms.is_some() == sleep_until.is_some() {
                    return Err(DefinitionError::InvalidSleep(step.name.clone()));
                }
            }

            if let Some(for_each) = step.for_each() {
                if Reference::parse(&for_each.items).is_none() {
                    return Err(DefinitionError::InvalidItemsReference(
                        step.name.clone(),
                        for_each.items.clone(),
                    ));
                }

                // `base[i]` children must never shadow a declared step
                for other in &self.steps {
                    if is_expansion_of(&other.name, &step.name) {
                        return Err(DefinitionError::ExpansionCollision(
                            other.name.clone(),
                            step.name.clone(),
                        ));
                    }
                }
            }
        }

        Ok(())
    }
}

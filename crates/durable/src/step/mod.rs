//! Typed step execution
//!
//! One runner per step kind:
//! - [`ToolGateway`] — streaming HTTP calls through the tool gateway
//! - [`CodeSandbox`] — pure transformations in an embedded QuickJS runtime
//! - sleep — inline or durable timers
//! - wait-for-signal — single-consumer signal delivery
//!
//! The runner never decides execution-level policy; it reports success, a
//! control-flow [`Suspension`], or a classified [`StepError`] and leaves the
//! rest to the executor.

mod code;
mod runner;
mod signal;
mod sleep;
mod tool;

pub use code::{CodeSandbox, SandboxLimits, SandboxOutput};
pub use runner::{StepRun, StepRunner, Suspension};
pub use tool::ToolGateway;

use std::time::Duration;

use crate::persistence::StoreError;
use crate::workflow::ReferenceError;

/// Errors from step execution
#[derive(Debug, thiserror::Error)]
pub enum StepError {
    /// A reference in the step input could not be resolved
    #[error(transparent)]
    Reference(#[from] ReferenceError),

    /// The step definition is unusable
    #[error("invalid step: {0}")]
    Definition(String),

    /// The sandbox rejected or aborted the code step
    #[error("sandbox error: {0}")]
    Sandbox(String),

    /// The tool gateway answered with a non-2xx status
    #[error("tool gateway returned {status}: {body}")]
    Gateway { status: u16, body: String },

    /// The tool gateway was unreachable or the stream broke
    #[error("transport error: {0}")]
    Transport(String),

    /// No matching signal arrived within the wait window
    #[error("signal wait timed out after {0:?}")]
    SignalTimeout(Duration),

    /// Persistence failed mid-step
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

impl StepError {
    /// Default retryability per error category
    ///
    /// Transport failures, 5xx gateway responses, and store hiccups are
    /// retryable. Definition, reference, sandbox, and 4xx errors are not.
    /// A timed-out wait is measured from the persisted start, so replaying
    /// it cannot succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Transport(_) | Self::Store(_) => true,
            Self::Gateway { status, .. } => *status >= 500,
            Self::Reference(_)
            | Self::Definition(_)
            | Self::Sandbox(_)
            | Self::SignalTimeout(_) => false,
        }
    }

    /// Whether a step retry policy may override the default classification
    ///
    /// Reference and definition errors fail identically on every attempt;
    /// retrying them only burns the budget. The same holds for wait
    /// timeouts.
    pub fn policy_may_retry(&self) -> bool {
        !matches!(
            self,
            Self::Reference(_) | Self::Definition(_) | Self::SignalTimeout(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification() {
        assert!(StepError::Transport("connection reset".into()).is_retryable());
        assert!(StepError::Gateway {
            status: 503,
            body: "unavailable".into()
        }
        .is_retryable());

        assert!(!StepError::Gateway {
            status: 404,
            body: "no such tool".into()
        }
        .is_retryable());
        assert!(!StepError::Sandbox("ReferenceError: x is not defined".into()).is_retryable());
        assert!(!StepError::SignalTimeout(Duration::from_secs(60)).is_retryable());
    }

    #[test]
    fn test_policy_override() {
        // A retry policy can re-run sandbox and 4xx failures
        assert!(StepError::Sandbox("flaky".into()).policy_may_retry());
        assert!(StepError::Gateway {
            status: 429,
            body: "rate limited".into()
        }
        .policy_may_retry());

        // ...but never unresolvable references or wait timeouts
        assert!(!StepError::Definition("bad".into()).policy_may_retry());
        assert!(!StepError::SignalTimeout(Duration::from_secs(1)).policy_may_retry());
    }
}

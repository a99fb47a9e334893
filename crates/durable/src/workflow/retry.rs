//! Retry policies and backoff

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Per-step retry policy
///
/// A step that fails with attempts remaining reports the *execution* as
/// retryable; the scheduler requeues it and replay re-runs the failed step.
///
/// # Example
///
/// ```
/// use std::time::Duration;
/// use windlass_durable::workflow::StepRetry;
///
/// let retry = StepRetry::new(3, 500);
/// assert_eq!(retry.delay_for_attempt(0), Duration::from_millis(500));
/// assert_eq!(retry.delay_for_attempt(2), Duration::from_millis(2000));
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepRetry {
    /// Maximum number of attempts (including the first)
    pub max_attempts: u32,

    /// Base delay in milliseconds; doubled per completed attempt
    pub backoff_ms: u64,
}

impl Default for StepRetry {
    fn default() -> Self {
        Self {
            max_attempts: 1,
            backoff_ms: 1_000,
        }
    }
}

impl StepRetry {
    /// Create a policy
    pub fn new(max_attempts: u32, backoff_ms: u64) -> Self {
        Self {
            max_attempts,
            backoff_ms,
        }
    }

    /// Whether another attempt may run after `attempt` failures
    pub fn has_attempts_remaining(&self, attempt: u32) -> bool {
        attempt + 1 < self.max_attempts
    }

    /// Delay before re-running after the given 0-based failed attempt
    ///
    /// `backoff_ms * 2^attempt`, saturating.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let factor = 2u64.saturating_pow(attempt.min(32));
        Duration::from_millis(self.backoff_ms.saturating_mul(factor))
    }
}

/// Engine-level backoff for execution retries
///
/// `base * 2^retry_count`, capped.
pub fn execution_backoff(base_ms: u64, retry_count: u32, cap_ms: u64) -> Duration {
    let factor = 2u64.saturating_pow(retry_count.min(32));
    Duration::from_millis(base_ms.saturating_mul(factor).min(cap_ms))
}

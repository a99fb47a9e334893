//! Engine configuration

use std::time::Duration;

/// Tunables for the executor and step runner
///
/// # Example
///
/// ```
/// use windlass_durable::EngineConfig;
///
/// let config = EngineConfig::default()
///     .with_lease_ms(60_000)
///     .with_max_retries(3);
/// ```
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Execution lock duration in milliseconds
    pub lease_ms: u64,

    /// Retry budget for new executions
    pub max_retries: u32,

    /// Base for the exponential retry backoff
    pub retry_base_ms: u64,

    /// Cap on the retry backoff
    pub retry_max_delay_ms: u64,

    /// Sleeps at or under this wait inline instead of suspending
    pub inline_sleep_budget_ms: u64,

    /// Per-request timeout for tool gateway calls
    pub tool_timeout_ms: u64,

    /// Sandbox heap limit
    pub sandbox_memory_bytes: usize,

    /// Sandbox stack limit
    pub sandbox_stack_bytes: usize,

    /// Hard CPU deadline for one sandbox evaluation
    pub sandbox_deadline_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            lease_ms: 300_000,
            max_retries: 10,
            retry_base_ms: 1_000,
            retry_max_delay_ms: 300_000,
            inline_sleep_budget_ms: 25_000,
            tool_timeout_ms: 120_000,
            sandbox_memory_bytes: 64 * 1024 * 1024,
            sandbox_stack_bytes: 1024 * 1024,
            sandbox_deadline_ms: 10_000,
        }
    }
}

impl EngineConfig {
    /// Set the execution lock duration
    pub fn with_lease_ms(mut self, lease_ms: u64) -> Self {
        self.lease_ms = lease_ms;
        self
    }

    /// Set the retry budget for new executions
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Set the retry backoff base
    pub fn with_retry_base_ms(mut self, retry_base_ms: u64) -> Self {
        self.retry_base_ms = retry_base_ms;
        self
    }

    /// Set the inline sleep budget
    pub fn with_inline_sleep_budget_ms(mut self, budget_ms: u64) -> Self {
        self.inline_sleep_budget_ms = budget_ms;
        self
    }

    /// Set the tool gateway request timeout
    pub fn with_tool_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.tool_timeout_ms = timeout_ms;
        self
    }

    /// Set the sandbox deadline
    pub fn with_sandbox_deadline_ms(mut self, deadline_ms: u64) -> Self {
        self.sandbox_deadline_ms = deadline_ms;
        self
    }

    /// Lease duration
    pub fn lease(&self) -> Duration {
        Duration::from_millis(self.lease_ms)
    }

    /// Inline sleep budget
    pub fn inline_sleep_budget(&self) -> Duration {
        Duration::from_millis(self.inline_sleep_budget_ms)
    }

    /// Tool gateway timeout
    pub fn tool_timeout(&self) -> Duration {
        Duration::from_millis(self.tool_timeout_ms)
    }

    /// Sandbox deadline
    pub fn sandbox_deadline(&self) -> Duration {
        Duration::from_millis(self.sandbox_deadline_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_documented_values() {
        let config = EngineConfig::default();
        assert_eq!(config.lease_ms, 300_000);
        assert_eq!(config.max_retries, 10);
        assert_eq!(config.retry_base_ms, 1_000);
        assert_eq!(config.inline_sleep_budget_ms, 25_000);
        assert_eq!(config.sandbox_memory_bytes, 64 * 1024 * 1024);
        assert_eq!(config.sandbox_stack_bytes, 1024 * 1024);
        assert_eq!(config.sandbox_deadline_ms, 10_000);
    }

    #[test]
    fn test_builders() {
        let config = EngineConfig::default()
            .with_lease_ms(5_000)
            .with_max_retries(2)
            .with_inline_sleep_budget_ms(0);

        assert_eq!(config.lease(), Duration::from_secs(5));
        assert_eq!(config.max_retries, 2);
        assert_eq!(config.inline_sleep_budget(), Duration::ZERO);
    }
}

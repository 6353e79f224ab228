//! Retry budgets shared by platform calls and deliveries

use std::time::Duration;

/// How often and how long to retry a failing external call
///
/// Rate-limit deferrals are counted apart from generic failures: the
/// remote asked us to wait, so waiting does not use up `max_attempts`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total tries for generic transient failures
    pub max_attempts: u32,
    /// First backoff; doubles after every failure
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Rate-limit waits allowed before giving up
    pub max_rate_limit_waits: u32,
    /// Wait used when a rate-limit response carries no hint
    pub default_retry_after: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(60),
            max_rate_limit_waits: 5,
            default_retry_after: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    /// Delay after the `failures`-th generic failure (1-based)
    pub fn backoff(&self, failures: u32) -> Duration {
        let exponent = failures.saturating_sub(1).min(16);
        self.base_delay
            .saturating_mul(1u32 << exponent)
            .min(self.max_delay)
    }
}

//! Retransmission schedule for UDP tracker requests

use tokio::time::Duration;

/// Timeout for attempt `n` is `base_timeout * 2^n`, for `n` in `0..=max_retries`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub base_timeout: Duration,
    pub max_retries: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_timeout: Duration::from_secs(15),
            max_retries: 8,
        }
    }
}

impl RetryPolicy {
    pub fn new(base_timeout: Duration, max_retries: u32) -> Self {
        Self { base_timeout, max_retries }
    }

    /// How long to wait for a reply to attempt `attempt` (zero-based)
    pub fn timeout_for(&self, attempt: u32) -> Duration {
        2u32.checked_pow(attempt)
            .and_then(|factor| self.base_timeout.checked_mul(factor))
            .unwrap_or(Duration::MAX)
    }

    /// Number of times a request is sent before giving up
    pub fn attempts(&self) -> u32 {
        self.max_retries + 1
    }

    /// Time from the first send until the phase fails
    pub fn total_budget(&self) -> Duration {
        (0..self.attempts()).fold(Duration::ZERO, |acc, n| acc.saturating_add(self.timeout_for(n)))
    }
}

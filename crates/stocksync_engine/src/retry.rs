//! Retry policy for transient push failures.

use std::time::Duration;

/// Exponential backoff without jitter.
///
/// `delay_for(n) = min(2^n * base_delay, max_delay)`. The computation
/// saturates, so arbitrarily large attempt numbers yield `max_delay`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Failed attempts after which an operation is left queued for a later
    /// cycle.
    pub max_attempts: u32,
    /// Base delay.
    pub base_delay: Duration,
    /// Upper bound for any delay.
    pub max_delay: Duration,
}

impl RetryPolicy {
    /// Creates a policy with the given attempt limit and default delays.
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
        }
    }

    /// Creates a policy that never retries.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        }
    }

    /// Sets the maximum number of attempts.
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Sets the base delay.
    pub fn with_base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    /// Sets the maximum delay.
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Returns the delay before retrying after `attempt` failures.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let backoff = 1u32
            .checked_shl(attempt)
            .and_then(|factor| self.base_delay.checked_mul(factor));

        match backoff {
            Some(delay) => delay.min(self.max_delay),
            None if self.base_delay.is_zero() => Duration::ZERO,
            None => self.max_delay,
        }
    }

    /// Returns true if an operation that has failed `attempt_count` times
    /// may be tried again in the current cycle.
    pub fn should_retry(&self, attempt_count: u32) -> bool {
        attempt_count < self.max_attempts
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3)
    }
}

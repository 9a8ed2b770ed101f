use std::time::Duration;

/// Exponential backoff policy shared by request retries, refresh retries and
/// channel reconnects.
///
/// The delay before attempt `n + 1` (i.e. after failed attempt `n`) is
/// `base_delay * 2^(n-1)`: 1s, 2s, 4s, ... for a one second base.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    max_attempts: u32,
    base_delay: Duration,
}

/// Shift cap so a misconfigured attempt count can't overflow the multiplier.
const MAX_BACKOFF_SHIFT: u32 = 16;

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn base_delay(&self) -> Duration {
        self.base_delay
    }

    /// Backoff delay for the given 1-based attempt number.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(MAX_BACKOFF_SHIFT);
        self.base_delay.saturating_mul(1 << shift)
    }

    /// Whether another attempt is allowed after `attempt` attempts were made.
    pub fn allows_retry_after(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3, Duration::from_secs(1))
    }
}

/// Reconnection backoff policy
use std::time::Duration;

/// Capped exponential backoff: attempt `n` waits `base * 2^(n-1)`, never
/// longer than `max_delay`, and there is no attempt past `max_attempts`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            max_attempts: 5,
        }
    }
}

impl ReconnectPolicy {
    /// Delay before reconnect attempt `attempt` (1-based), or `None` once
    /// retries are exhausted.
    pub fn delay_for(&self, attempt: u32) -> Option<Duration> {
        if attempt == 0 || attempt > self.max_attempts {
            return None;
        }
        let factor = 2u32.checked_pow(attempt - 1).unwrap_or(u32::MAX);
        let delay = self.base_delay.checked_mul(factor).unwrap_or(self.max_delay);
        Some(delay.min(self.max_delay))
    }
}

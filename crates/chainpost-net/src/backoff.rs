//! Exponential backoff for automatic reconnection.

use std::time::Duration;

use chainpost_shared::constants::{MAX_RECONNECT_ATTEMPTS, RECONNECT_BASE_DELAY};

/// `delay(attempt) = base * 2^attempt` for `attempt` in `0..max_attempts`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub base_delay: Duration,
    pub max_attempts: u32,
}

impl ReconnectPolicy {
    pub fn new(base_delay: Duration, max_attempts: u32) -> Self {
        Self {
            base_delay,
            max_attempts,
        }
    }

    /// Delay before the zero-based `attempt`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor)
    }

    /// The full schedule, one delay per attempt.
    pub fn delays(&self) -> impl Iterator<Item = Duration> + '_ {
        (0..self.max_attempts).map(|attempt| self.delay_for(attempt))
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::new(RECONNECT_BASE_DELAY, MAX_RECONNECT_ATTEMPTS)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_schedule() {
        let delays: Vec<u64> = ReconnectPolicy::default()
            .delays()
            .map(|d| d.as_secs())
            .collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 16]);
    }

    #[test]
    fn test_delays_strictly_increase() {
        let policy = ReconnectPolicy::new(Duration::from_millis(10), 8);
        let delays: Vec<Duration> = policy.delays().collect();
        assert_eq!(delays.len(), 8);
        assert!(delays.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn test_large_attempt_saturates() {
        let policy = ReconnectPolicy::default();
        assert!(policy.delay_for(64) >= policy.delay_for(31));
    }
}

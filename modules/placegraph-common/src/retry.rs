use std::time::Duration;

use rand::Rng;

/// Bounded exponential backoff for external calls (store I/O, extraction).
/// Delay for attempt n is base * multiplier^n plus random jitter.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base: Duration,
    pub multiplier: u32,
    pub max_jitter_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base: Duration::from_secs(1),
            multiplier: 3,
            max_jitter_ms: 1000,
        }
    }
}

impl RetryPolicy {
    pub fn with_max_attempts(max_attempts: u32) -> Self {
        Self { max_attempts: max_attempts.max(1), ..Self::default() }
    }

    /// Whether another attempt is allowed after `attempt` (0-based) failed.
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt + 1 < self.max_attempts
    }

    /// Backoff before retrying after `attempt` (0-based) failed.
    pub fn delay(&self, attempt: u32) -> Duration {
        let backoff = self.base * self.multiplier.saturating_pow(attempt);
        let jitter = if self.max_jitter_ms == 0 {
            Duration::ZERO
        } else {
            Duration::from_millis(rand::rng().random_range(0..self.max_jitter_ms))
        };
        backoff + jitter
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delays_grow_exponentially() {
        let policy = RetryPolicy {
            max_attempts: 3,
            base: Duration::from_secs(1),
            multiplier: 3,
            max_jitter_ms: 0,
        };
        assert_eq!(policy.delay(0), Duration::from_secs(1));
        assert_eq!(policy.delay(1), Duration::from_secs(3));
        assert_eq!(policy.delay(2), Duration::from_secs(9));
    }

    #[test]
    fn attempts_are_bounded() {
        let policy = RetryPolicy::with_max_attempts(3);
        assert!(policy.should_retry(0));
        assert!(policy.should_retry(1));
        assert!(!policy.should_retry(2));
    }

    #[test]
    fn at_least_one_attempt() {
        let policy = RetryPolicy::with_max_attempts(0);
        assert!(!policy.should_retry(0));
        assert_eq!(policy.max_attempts, 1);
    }
}

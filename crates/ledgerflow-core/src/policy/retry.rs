//! Retry policy: fixed backoff by default, optionally growing per attempt.

use std::time::Duration;

/// Configuration for the retry policy.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of retry attempts (not counting the first try).
    pub max_retries: u32,
    /// Delay before the first retry.
    pub backoff: Duration,
    /// Multiplier applied to the delay on each further retry. `1.0` keeps it fixed.
    pub multiplier: f64,
    /// Upper bound on any single delay.
    pub max_backoff: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff: Duration::from_millis(500),
            multiplier: 1.0,
            max_backoff: Duration::from_secs(30),
        }
    }
}

/// Stateless retry policy: computes the next delay given the attempt number.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub config: RetryConfig,
}

impl RetryPolicy {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    /// Fixed-delay policy.
    pub fn fixed(max_retries: u32, backoff: Duration) -> Self {
        Self::new(RetryConfig {
            max_retries,
            backoff,
            ..Default::default()
        })
    }

    /// Returns the delay before the `attempt`-th retry (1-based).
    /// Returns `None` if `attempt` exceeds `max_retries`.
    pub fn next_delay(&self, attempt: u32) -> Option<Duration> {
        if attempt == 0 || attempt > self.config.max_retries {
            return None;
        }
        let multiplier = self.config.multiplier.max(1.0);
        let base_ms = self.config.backoff.as_millis() as f64 * multiplier.powi((attempt - 1) as i32);
        let cap_ms = self.config.max_backoff.as_millis() as f64;
        Some(Duration::from_millis(base_ms.min(cap_ms) as u64))
    }

    /// Total attempts allowed, including the first.
    pub fn max_attempts(&self) -> u32 {
        self.config.max_retries.saturating_add(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_delay() {
        let policy = RetryPolicy::fixed(3, Duration::from_millis(500));
        assert_eq!(policy.next_delay(1), Some(Duration::from_millis(500)));
        assert_eq!(policy.next_delay(3), Some(Duration::from_millis(500)));
        assert!(policy.next_delay(4).is_none());
        assert_eq!(policy.max_attempts(), 4);
    }

    #[test]
    fn growing_delay() {
        let policy = RetryPolicy::new(RetryConfig {
            max_retries: 3,
            backoff: Duration::from_millis(100),
            multiplier: 2.0,
            max_backoff: Duration::from_secs(30),
        });
        assert_eq!(policy.next_delay(1).unwrap().as_millis(), 100);
        assert_eq!(policy.next_delay(2).unwrap().as_millis(), 200);
        assert_eq!(policy.next_delay(3).unwrap().as_millis(), 400);
    }

    #[test]
    fn delay_capped_at_max() {
        let policy = RetryPolicy::new(RetryConfig {
            max_retries: 10,
            backoff: Duration::from_millis(100),
            multiplier: 10.0,
            max_backoff: Duration::from_millis(500),
        });
        let d5 = policy.next_delay(5).unwrap();
        assert!(d5 <= Duration::from_millis(500), "d5={d5:?} exceeds max");
    }

    #[test]
    fn zero_retries() {
        let policy = RetryPolicy::fixed(0, Duration::from_millis(10));
        assert!(policy.next_delay(1).is_none());
        assert_eq!(policy.max_attempts(), 1);
    }
}

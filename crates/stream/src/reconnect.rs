//! Bounded exponential-backoff policy for opening event streams.
//!
//! Only a stream that never opened is retried. Once the server has
//! started a job, a lost stream cannot be resumed mid-pipeline, so the
//! controllers fail the session instead of reconnecting.

use std::time::Duration;

/// Tunable parameters for connect retries.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Retries after the first failed attempt. `0` disables retrying.
    pub max_retries: u32,
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Upper bound on the delay between attempts.
    pub max_delay: Duration,
    /// Factor by which the delay grows after each failure.
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
            multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries.
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    /// Delay before retry number `retry` (1-based), or `None` once the
    /// budget is spent.
    pub fn delay_for(&self, retry: u32) -> Option<Duration> {
        if retry == 0 || retry > self.max_retries {
            return None;
        }
        let mut delay = self.initial_delay.min(self.max_delay);
        for _ in 1..retry {
            delay = next_delay(delay, self);
        }
        Some(delay)
    }
}

/// Calculate the next backoff delay from the current delay and policy.
///
/// The result is clamped to [`RetryPolicy::max_delay`].
pub fn next_delay(current: Duration, policy: &RetryPolicy) -> Duration {
    let next_ms = (current.as_millis() as f64 * policy.multiplier) as u64;
    Duration::from_millis(next_ms).min(policy.max_delay)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn next_delay_doubles() {
        let policy = RetryPolicy::default();
        assert_eq!(next_delay(Duration::from_secs(1), &policy), Duration::from_secs(2));
    }

    #[test]
    fn next_delay_clamps_at_max() {
        let policy = RetryPolicy {
            max_delay: Duration::from_secs(10),
            ..Default::default()
        };
        assert_eq!(next_delay(Duration::from_secs(8), &policy), Duration::from_secs(10));
    }

    #[test]
    fn custom_multiplier() {
        let policy = RetryPolicy {
            multiplier: 3.0,
            max_delay: Duration::from_secs(60),
            ..Default::default()
        };
        assert_eq!(next_delay(Duration::from_secs(2), &policy), Duration::from_secs(6));
    }

    #[test]
    fn delay_for_follows_backoff_and_stops_at_budget() {
        let policy = RetryPolicy {
            max_retries: 5,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(5),
            multiplier: 2.0,
        };
        let delays: Vec<u64> = (1..=5)
            .map(|n| policy.delay_for(n).unwrap().as_secs())
            .collect();
        assert_eq!(delays, [1, 2, 4, 5, 5]);
        assert_eq!(policy.delay_for(6), None);
        assert_eq!(policy.delay_for(0), None);
    }

    #[test]
    fn none_never_retries() {
        assert_eq!(RetryPolicy::none().delay_for(1), None);
    }
}

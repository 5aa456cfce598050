//! Retry policy: decides backoff delays.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// How the delay grows with the retry number.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Backoff {
    /// `base_delay * retry`
    Linear,
    /// `base_delay * multiplier^(retry - 1)`
    Exponential { multiplier: f64 },
}

/// Retry policy for failed jobs.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Delay before the first retry.
    pub base_delay: Duration,

    pub backoff: Backoff,
}

impl RetryPolicy {
    pub fn linear(base_delay: Duration) -> Self {
        Self {
            base_delay,
            backoff: Backoff::Linear,
        }
    }

    pub fn exponential(base_delay: Duration, multiplier: f64) -> Self {
        Self {
            base_delay,
            backoff: Backoff::Exponential { multiplier },
        }
    }

    /// Delay before retry number `retry` (1-indexed: the value of
    /// `retry_count` right after it was incremented).
    ///
    /// Example with base_delay=1s:
    /// - linear: 1s, 2s, 3s, ...
    /// - exponential x2: 1s, 2s, 4s, ...
    pub fn next_delay(&self, retry: u32) -> Duration {
        match self.backoff {
            Backoff::Linear => self.base_delay.saturating_mul(retry),
            Backoff::Exponential { multiplier } => {
                let base_secs = self.base_delay.as_secs_f64();
                let delay_secs = base_secs * multiplier.powi(retry.saturating_sub(1) as i32);
                Duration::try_from_secs_f64(delay_secs).unwrap_or(Duration::MAX)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(1, 500)]
    #[case(2, 1_000)]
    #[case(3, 1_500)]
    fn linear_backoff_scales_with_retry_number(#[case] retry: u32, #[case] expected_ms: u64) {
        let policy = RetryPolicy::linear(Duration::from_millis(500));
        assert_eq!(policy.next_delay(retry), Duration::from_millis(expected_ms));
    }

    #[test]
    fn default_queue_config_retries_linearly() {
        let policy = crate::config::QueueConfig::default().retry_policy();
        assert_eq!(policy.backoff, Backoff::Linear);
        assert_eq!(policy.next_delay(3), Duration::from_secs(3));
    }

    #[rstest]
    #[case(1, 250)]
    #[case(2, 750)]
    #[case(3, 2_250)]
    fn exponential_backoff_multiplies_the_previous_delay(
        #[case] retry: u32,
        #[case] expected_ms: u64,
    ) {
        let policy = RetryPolicy::exponential(Duration::from_millis(250), 3.0);
        assert_eq!(policy.next_delay(retry), Duration::from_millis(expected_ms));
    }

    #[test]
    fn huge_exponents_saturate_instead_of_panicking() {
        let policy = RetryPolicy::exponential(Duration::from_secs(1), 10.0);
        assert_eq!(policy.next_delay(1_000), Duration::MAX);
    }
}

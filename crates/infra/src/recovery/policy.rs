//! Retry backoff policy.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::config::RecoveryConfig;

/// Exponential backoff with positive jitter.
///
/// `base = min(base_delay * 2^retry_count, max_delay)`, then
/// `delay = base + base * jitter * r` with `r` uniform in `[0, 1)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Jitter factor (0.0-1.0) relative to the base delay.
    pub jitter: f64,
    /// Retries allowed before an error is given up on.
    pub max_retries: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RecoveryConfig::default())
    }
}

impl RetryPolicy {
    pub fn from_config(config: &RecoveryConfig) -> Self {
        Self {
            base_delay: Duration::from_millis(config.base_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
            jitter: config.jitter.clamp(0.0, 1.0),
            max_retries: config.max_retries,
        }
    }

    /// Delay before jitter for the given number of retries already made.
    pub fn base_delay_for(&self, retry_count: u32) -> Duration {
        let factor = 2u32.checked_pow(retry_count).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// Jittered delay for a caller-supplied random sample `r` in `[0, 1)`.
    pub fn delay_with(&self, retry_count: u32, r: f64) -> Duration {
        let base = self.base_delay_for(retry_count);
        base + base.mul_f64(self.jitter * r.clamp(0.0, 1.0))
    }

    /// Jittered delay using the thread-local RNG.
    pub fn calculate_retry_delay(&self, retry_count: u32) -> Duration {
        let r: f64 = rand::rng().random();
        self.delay_with(retry_count, r)
    }

    /// Check if more retries are allowed.
    pub fn should_retry(&self, retry_count: u32) -> bool {
        retry_count < self.max_retries
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_delay_doubles_up_to_the_cap() {
        let policy = RetryPolicy::default();
        let bases: Vec<u64> = (0..=5)
            .map(|n| policy.base_delay_for(n).as_millis() as u64)
            .collect();
        assert_eq!(bases, vec![1_000, 2_000, 4_000, 8_000, 16_000, 32_000]);

        assert_eq!(policy.base_delay_for(9), Duration::from_millis(300_000));
        assert_eq!(policy.base_delay_for(40), Duration::from_millis(300_000));
    }

    #[test]
    fn jitter_stays_within_twenty_percent_above_base() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_with(2, 0.0), Duration::from_millis(4_000));
        assert!((policy.delay_with(2, 0.5).as_secs_f64() - 4.4).abs() < 1e-6);

        for retry_count in 0..12 {
            let base = policy.base_delay_for(retry_count);
            for _ in 0..50 {
                let delay = policy.calculate_retry_delay(retry_count);
                assert!(delay >= base, "{delay:?} < {base:?}");
                let ceiling = base.mul_f64(1.2) + Duration::from_nanos(1);
                assert!(delay <= ceiling, "{delay:?} > 1.2 * {base:?}");
            }
        }
    }

    #[test]
    fn retries_stop_at_max() {
        let policy = RetryPolicy::default();
        assert!(policy.should_retry(4));
        assert!(!policy.should_retry(5));
    }
}

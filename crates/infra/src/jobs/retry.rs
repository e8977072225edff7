//! Retry backoff policy.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Backoff strategy for retries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Fixed delay between retries
    Fixed,
    /// base * 2^(attempt-1)
    #[default]
    Exponential,
    /// base * attempt
    Linear,
}

/// How long a requeued job waits before it may be claimed again.
///
/// The attempt budget lives on the job (`max_retries`); this only computes delays.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub base_delay: Duration,
    /// Upper bound for every computed delay, jitter included
    pub max_delay: Duration,
    pub strategy: BackoffStrategy,
    /// Jitter factor (0.0-1.0)
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(300),
            strategy: BackoffStrategy::Exponential,
            jitter: 0.1,
        }
    }
}

impl RetryPolicy {
    pub fn fixed(delay: Duration) -> Self {
        Self {
            base_delay: delay,
            max_delay: delay,
            strategy: BackoffStrategy::Fixed,
            jitter: 0.0,
        }
    }

    pub fn exponential(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            base_delay,
            max_delay,
            strategy: BackoffStrategy::Exponential,
            jitter: 0.1,
        }
    }

    /// Retry immediately; used by tests that drive retries in a loop.
    pub fn immediate() -> Self {
        Self::fixed(Duration::ZERO)
    }

    /// Delay before retry number `attempt` (1-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let base_ms = self.base_delay.as_millis() as f64;
        let max_ms = self.max_delay.as_millis() as f64;

        let delay_ms = match self.strategy {
            BackoffStrategy::Fixed => base_ms,
            BackoffStrategy::Exponential => base_ms * 2_f64.powi(attempt.saturating_sub(1).min(62) as i32),
            BackoffStrategy::Linear => base_ms * attempt as f64,
        }
        .min(max_ms);

        // Deterministic spread so identical jobs don't retry in lockstep.
        let jitter_range = delay_ms * self.jitter.clamp(0.0, 1.0);
        let jitter = if jitter_range > 0.0 {
            let pseudo_random = ((attempt as f64 * 17.0) % 100.0) / 100.0;
            jitter_range * (pseudo_random - 0.5) * 2.0
        } else {
            0.0
        };

        Duration::from_millis((delay_ms + jitter).clamp(0.0, max_ms) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn exponential_backoff_doubles() {
        let policy = RetryPolicy {
            jitter: 0.0,
            ..RetryPolicy::exponential(Duration::from_millis(100), Duration::from_secs(10))
        };

        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(400));
        assert_eq!(policy.delay_for_attempt(20), Duration::from_secs(10));
    }

    #[test]
    fn linear_backoff_increases_linearly() {
        let policy = RetryPolicy {
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            strategy: BackoffStrategy::Linear,
            jitter: 0.0,
        };

        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(300));
    }

    #[test]
    fn attempt_zero_has_no_delay() {
        assert_eq!(RetryPolicy::default().delay_for_attempt(0), Duration::ZERO);
    }

    proptest! {
        #[test]
        fn delay_never_exceeds_max(
            attempt in 0u32..200,
            base_ms in 0u64..10_000,
            max_ms in 0u64..600_000,
            jitter in 0.0f64..1.0,
        ) {
            for strategy in [BackoffStrategy::Fixed, BackoffStrategy::Linear, BackoffStrategy::Exponential] {
                let policy = RetryPolicy {
                    base_delay: Duration::from_millis(base_ms),
                    max_delay: Duration::from_millis(max_ms),
                    strategy,
                    jitter,
                };
                prop_assert!(policy.delay_for_attempt(attempt) <= Duration::from_millis(max_ms));
            }
        }
    }
}

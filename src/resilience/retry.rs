use std::time::Duration;

use rand::Rng;

use crate::configuration::Configuration;

/// Bounded exponential backoff with random jitter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, the first one included.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
            jitter: true,
        }
    }
}

impl RetryPolicy {
    pub fn from_config(config: &Configuration) -> Self {
        RetryPolicy {
            max_attempts: config.retry_max_attempts.max(1),
            base_delay: config.retry_backoff_base,
            max_delay: config.retry_max_backoff,
            jitter: true,
        }
    }

    /// A policy that never retries.
    pub fn no_retry() -> Self {
        RetryPolicy {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Delay before the attempt following failed attempt `attempt` (1-based), without jitter.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.base_delay
            .checked_mul(1u32 << exponent)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// [`delay_for_attempt`](Self::delay_for_attempt) plus up to half of it at random.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let delay = self.delay_for_attempt(attempt);
        if !self.jitter || delay.is_zero() {
            return delay;
        }
        let spread = (delay.as_micros() / 2) as u64;
        let extra = rand::rng().random_range(0..=spread);
        delay + Duration::from_micros(extra)
    }
}

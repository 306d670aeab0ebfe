//! Retry backoff
//!
//! Exponential backoff for failed sources: the delay starts at the minimum,
//! doubles on each consecutive failure, is discounted by the time the source
//! spent receiving data, and is clamped to `[min, max]`.

use crate::config::RetryConfig;
use std::time::Duration;

/// Backoff policy for source retries
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Delay after the first failure
    pub min_delay: Duration,
    /// Ceiling for the delay
    pub max_delay: Duration,
    /// Jitter factor (0.0 to 1.0), applied before clamping
    pub jitter_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}

impl RetryPolicy {
    /// Create a new retry policy without jitter
    pub fn new(min_delay: Duration, max_delay: Duration) -> Self {
        Self {
            min_delay,
            max_delay,
            jitter_factor: 0.0,
        }
    }

    pub fn from_config(config: &RetryConfig) -> Self {
        Self::new(
            Duration::from_secs(config.min_delay),
            Duration::from_secs(config.max_delay),
        )
    }

    /// Add ±`factor` randomness to computed delays
    pub fn with_jitter(mut self, factor: f64) -> Self {
        self.jitter_factor = factor.clamp(0.0, 1.0);
        self
    }

    /// Compute the next delay.
    ///
    /// `previous` is the delay used for the last retry (zero if the source
    /// never failed), `ran_for` how long the source was receiving before this
    /// failure.
    pub fn next_delay(&self, previous: Duration, ran_for: Duration) -> Duration {
        let base = if previous.is_zero() {
            self.min_delay
        } else {
            previous.saturating_mul(2)
        };

        let discounted = base.saturating_sub(ran_for);

        let with_jitter = if self.jitter_factor > 0.0 {
            let jitter = (rand::random::<f64>() - 0.5) * 2.0 * self.jitter_factor;
            Duration::from_millis((discounted.as_millis() as f64 * (1.0 + jitter)) as u64)
        } else {
            discounted
        };

        with_jitter.clamp(self.min_delay, self.max_delay)
    }
}

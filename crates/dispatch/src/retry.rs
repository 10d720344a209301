//! Retry backoff schedule

use std::time::Duration;

use rand::RngExt;

/// Backoff parameters for the dispatch retry loop. The delay before the
/// retry after `attempt` failures is `base * exponential_base^attempt`,
/// capped at `max_delay`, then scaled by a jitter factor in `[0.8, 1.2]`.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Retries after the first attempt, so `max_retries + 1` attempts total.
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub exponential_base: f64,
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(1000),
            max_delay: Duration::from_millis(30_000),
            exponential_base: 2.0,
            jitter: true,
        }
    }
}

impl RetryConfig {
    /// Delay to sleep before the next attempt, `attempt` being the number
    /// of failed attempts so far (0-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let raw = self.base_delay.as_millis() as f64 * self.exponential_base.powi(attempt as i32);
        let capped = raw.min(self.max_delay.as_millis() as f64);
        let scaled = if self.jitter {
            capped * rand::rng().random_range(0.8..=1.2)
        } else {
            capped
        };
        Duration::from_millis(scaled as u64)
    }
}

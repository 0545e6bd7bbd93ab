//! Retry policy
//!
//! Failed splits and stream segments are re-run from scratch after an
//! exponential backoff. Jitter is deterministic per attempt so that test
//! timings stay reproducible.

use std::time::Duration;

/// Retry configuration with exponential backoff.
///
/// ```rust
/// use rivven_backfill::common::RetryConfig;
/// use std::time::Duration;
///
/// let config = RetryConfig::builder()
///     .max_retries(5)
///     .retry_delay(Duration::from_millis(100))
///     .jitter(0.0)
///     .build();
///
/// assert_eq!(config.delay_for_attempt(2), Duration::from_millis(400));
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    /// Retries allowed after the first failure. `0` disables retries.
    max_retries: u32,
    /// Base delay between retries (before exponential backoff).
    retry_delay: Duration,
    /// Maximum delay cap.
    max_delay: Duration,
    /// Jitter factor (0.0 - 1.0).
    jitter: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            jitter: 0.25,
        }
    }
}

impl RetryConfig {
    pub fn builder() -> RetryConfigBuilder {
        RetryConfigBuilder::default()
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    pub fn retry_delay(&self) -> Duration {
        self.retry_delay
    }

    /// Whether another attempt is allowed after `failures` failures.
    pub fn should_retry(&self, failures: u32) -> bool {
        failures <= self.max_retries
    }

    /// Backoff before retry number `attempt` (0-based): `retry_delay * 2^attempt`,
    /// capped at `max_delay`, then spread by up to `jitter` in either direction.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let nominal = self
            .retry_delay
            .saturating_mul(2u32.saturating_pow(attempt))
            .min(self.max_delay);
        if self.jitter <= 0.0 {
            return nominal;
        }

        // golden-ratio sequence, reproducible per attempt
        let spread = (attempt as f64 * 0.618033988749895).fract() * 2.0 - 1.0;
        let secs = nominal.as_secs_f64() * (1.0 + self.jitter * spread);
        Duration::from_secs_f64(secs.max(0.0))
    }
}

/// Builder for RetryConfig.
#[derive(Debug, Clone, Default)]
pub struct RetryConfigBuilder {
    max_retries: Option<u32>,
    retry_delay: Option<Duration>,
    max_delay: Option<Duration>,
    jitter: Option<f64>,
}

impl RetryConfigBuilder {
    pub fn max_retries(mut self, value: u32) -> Self {
        self.max_retries = Some(value);
        self
    }

    pub fn retry_delay(mut self, value: Duration) -> Self {
        self.retry_delay = Some(value);
        self
    }

    pub fn max_delay(mut self, value: Duration) -> Self {
        self.max_delay = Some(value);
        self
    }

    /// Set jitter factor (clamped to 0.0 - 1.0).
    pub fn jitter(mut self, value: f64) -> Self {
        self.jitter = Some(value.clamp(0.0, 1.0));
        self
    }

    pub fn build(self) -> RetryConfig {
        let defaults = RetryConfig::default();
        RetryConfig {
            max_retries: self.max_retries.unwrap_or(defaults.max_retries),
            retry_delay: self.retry_delay.unwrap_or(defaults.retry_delay),
            max_delay: self.max_delay.unwrap_or(defaults.max_delay),
            jitter: self.jitter.unwrap_or(defaults.jitter),
        }
    }
}

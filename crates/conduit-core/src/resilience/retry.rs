use std::time::Duration;

use rand::Rng;

use crate::{config::RetryPolicyConfig, errors::GatewayError};

/// Re-invokes the inner layers on retryable failures with exponential backoff.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    max_attempts: u32,
    delay: Duration,
    backoff_factor: f64,
    max_delay: Duration,
    jitter: Duration,
}

impl RetryPolicy {
    #[must_use]
    pub fn from_config(config: &RetryPolicyConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            delay: Duration::from_millis(config.delay_ms),
            backoff_factor: config.backoff_factor.max(1.0),
            max_delay: Duration::from_millis(config.backoff_max_delay_ms),
            jitter: Duration::from_millis(config.jitter_ms),
        }
    }

    /// Total attempts including the first one.
    #[must_use]
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    #[must_use]
    pub fn should_retry(&self, error: &GatewayError, attempt: u32) -> bool {
        attempt < self.max_attempts && error.is_retryable()
    }

    /// Backoff before retry number `retry` (1-based), without jitter.
    ///
    /// `delay * factor^(retry - 1)`, capped at the configured maximum.
    #[must_use]
    pub fn base_delay(&self, retry: u32) -> Duration {
        if self.delay.is_zero() {
            return Duration::ZERO;
        }
        let exponent = i32::try_from(retry.saturating_sub(1)).unwrap_or(i32::MAX);
        let secs = self.delay.as_secs_f64() * self.backoff_factor.powi(exponent);
        let capped = secs.min(self.max_delay.as_secs_f64().max(self.delay.as_secs_f64()));
        Duration::from_secs_f64(capped)
    }

    /// Backoff with a random jitter in `[0, jitter]` added.
    #[must_use]
    pub fn delay_for(&self, retry: u32) -> Duration {
        let base = self.base_delay(retry);
        if self.jitter.is_zero() {
            return base;
        }
        let jitter_ms = u64::try_from(self.jitter.as_millis()).unwrap_or(u64::MAX);
        base + Duration::from_millis(rand::rng().random_range(0..=jitter_ms))
    }
}

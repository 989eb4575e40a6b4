//! Retry policy for batch delivery.

use std::time::Duration;

use crate::config::RetryConfig;
use crate::error::{DeliveryError, is_retryable_status};

/// Bounded exponential backoff. Delays are deterministic: no jitter.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts including the first.
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub multiplier: f64,
    pub max_backoff: Duration,
    retryable_status: fn(u16) -> bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&RetryConfig::default())
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            initial_backoff: Duration::from_millis(config.initial_backoff_ms),
            multiplier: config.backoff_multiplier.max(1.0),
            max_backoff: Duration::from_millis(config.max_backoff_ms),
            retryable_status: is_retryable_status,
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Replace the predicate deciding which HTTP statuses are transient.
    pub fn with_retryable_status(mut self, predicate: fn(u16) -> bool) -> Self {
        self.retryable_status = predicate;
        self
    }

    /// Delay before retry number `retry` (1-based: the wait after the first
    /// failed attempt is `backoff(1)`).
    pub fn backoff(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1).min(32) as i32;
        let millis = self.initial_backoff.as_millis() as f64 * self.multiplier.powi(exponent);
        let capped = millis.min(self.max_backoff.as_millis() as f64);
        Duration::from_millis(capped as u64)
    }

    /// Whether a failed `attempt` (1-based) should be followed by another.
    pub fn should_retry(&self, attempt: u32, error: &DeliveryError) -> bool {
        attempt < self.max_attempts && self.is_retryable(error)
    }

    /// Whether `error` is transient under this policy's status predicate.
    pub fn is_retryable(&self, error: &DeliveryError) -> bool {
        match error {
            DeliveryError::Status { status, .. } => (self.retryable_status)(*status),
            other => other.is_retryable(),
        }
    }
}

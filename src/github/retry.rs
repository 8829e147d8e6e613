//! Exponential backoff for facade-internal retries.
//!
//! Only transport-class errors are retried, and only for idempotent
//! operations; the merge call goes out exactly once per pipeline attempt.

use std::future::Future;
use std::time::Duration;

use super::error::ApiError;

/// Backoff configuration for idempotent API calls.
#[derive(Debug, Clone, Copy)]
pub struct RetryConfig {
    /// Retry attempts after the initial one.
    pub max_retries: u32,

    /// Delay before the first retry.
    pub initial_delay: Duration,

    /// Cap on exponential growth.
    pub max_delay: Duration,

    /// Growth factor, typically 2.0.
    pub multiplier: f64,
}

impl RetryConfig {
    pub fn new(
        max_retries: u32,
        initial_delay: Duration,
        max_delay: Duration,
        multiplier: f64,
    ) -> Self {
        RetryConfig {
            max_retries,
            initial_delay,
            max_delay,
            multiplier,
        }
    }

    /// Delay for the given retry attempt (0-indexed), capped at `max_delay`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let grown = self.initial_delay.as_secs_f64() * self.multiplier.powi(attempt as i32);
        Duration::from_secs_f64(grown.min(self.max_delay.as_secs_f64()))
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        RetryConfig {
            max_retries: 2,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
        }
    }
}

/// Runs `operation`, retrying transport errors with exponential backoff.
/// Non-retryable errors are returned immediately.
pub async fn retry_idempotent<T, F, Fut>(config: RetryConfig, mut operation: F) -> Result<T, ApiError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ApiError>>,
{
    let mut attempt = 0;
    loop {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_retryable() && attempt < config.max_retries => {
                let delay = config.delay_for_attempt(attempt);
                attempt += 1;
                tracing::debug!(attempt, ?delay, error = %e, "retrying API call");
                tokio::time::sleep(delay).await;
            }
            Err(e) => return Err(e),
        }
    }
}

//! Bounded exponential backoff around external collaborator calls.
//!
//! Only [`ServiceError::is_transient`] failures are retried. Permanent
//! failures (bad payload, 4xx, missing configuration) return immediately.

use std::future::Future;
use std::time::Duration;

use crate::config::ServicesConfig;
use crate::error::ServiceError;

/// Attempt ceiling and delay bounds for one collaborator call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
}

impl BackoffPolicy {
    pub fn new(max_attempts: u32, initial_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            initial_delay,
            max_delay,
        }
    }

    /// A policy that never retries.
    pub fn none() -> Self {
        Self::new(1, Duration::ZERO, Duration::ZERO)
    }

    /// Delay before retry number `retry` (1-based), doubling and capped.
    pub fn delay_for(&self, retry: u32) -> Duration {
        let factor = 2u32.saturating_pow(retry.saturating_sub(1));
        self.initial_delay
            .saturating_mul(factor)
            .min(self.max_delay)
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::from(&ServicesConfig::default())
    }
}

impl From<&ServicesConfig> for BackoffPolicy {
    fn from(config: &ServicesConfig) -> Self {
        Self::new(
            config.max_attempts,
            Duration::from_millis(config.initial_backoff_ms),
            Duration::from_millis(config.max_backoff_ms),
        )
    }
}

/// Run `call` until it succeeds, fails permanently, or attempts run out.
///
/// The last error is returned when the ceiling is reached.
pub async fn with_backoff<F, Fut, T>(
    operation: &str,
    policy: &BackoffPolicy,
    mut call: F,
) -> Result<T, ServiceError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ServiceError>>,
{
    let mut attempt = 1;
    loop {
        match call().await {
            Ok(value) => {
                if attempt > 1 {
                    tracing::debug!(operation, attempt, "call succeeded after retry");
                }
                return Ok(value);
            }
            Err(err) if !err.is_transient() => return Err(err),
            Err(err) if attempt >= policy.max_attempts => {
                tracing::warn!(
                    operation,
                    attempt,
                    error = %err,
                    "giving up after exhausting retries"
                );
                return Err(err);
            }
            Err(err) => {
                let delay = policy.delay_for(attempt);
                tracing::warn!(
                    operation,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "transient failure, retrying"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

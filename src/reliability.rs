//! Retry with exponential backoff for transient storage failures.
//!
//! Built on the `backon` crate. Only `ServiceError::Storage` is retryable;
//! validation, authentication, not-found, and conflict errors are final and
//! returned on the first attempt.

use backon::{BlockingRetryable, ExponentialBuilder};
use std::time::Duration;
use tracing::warn;

use crate::constants::{
    STORAGE_RETRY_ATTEMPTS, STORAGE_RETRY_INITIAL_DELAY, STORAGE_RETRY_MAX_DELAY,
};
use crate::error::{Result, ServiceError};

/// Configuration for retry behavior.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of retry attempts (not including the initial attempt).
    pub max_retries: u32,
    /// Initial delay before first retry.
    pub initial_delay: Duration,
    /// Maximum delay between retries.
    pub max_delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: STORAGE_RETRY_ATTEMPTS - 1,
            initial_delay: STORAGE_RETRY_INITIAL_DELAY,
            max_delay: STORAGE_RETRY_MAX_DELAY,
        }
    }
}

impl RetryConfig {
    fn build_backoff(&self) -> ExponentialBuilder {
        ExponentialBuilder::default()
            .with_min_delay(self.initial_delay)
            .with_max_delay(self.max_delay)
            .with_max_times(self.max_retries as usize)
            .with_jitter()
    }
}

/// Retry a blocking storage operation with exponential backoff.
///
/// Runs the operation up to `max_retries + 1` times, sleeping between
/// attempts. Intended for use inside `spawn_blocking`.
pub fn retry_blocking<F, T>(config: &RetryConfig, operation_name: &str, operation: F) -> Result<T>
where
    F: FnMut() -> Result<T>,
{
    let max_retries = config.max_retries;
    let mut attempt = 0u32;

    operation
        .retry(config.build_backoff())
        .when(ServiceError::is_retryable)
        .notify(|err: &ServiceError, dur: Duration| {
            attempt += 1;
            warn!(
                operation = operation_name,
                attempt,
                max_retries,
                next_delay_ms = dur.as_millis() as u64,
                error = %err,
                "Storage operation failed, will retry"
            );
        })
        .call()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quick_config() -> RetryConfig {
        RetryConfig {
            max_retries: 2,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
        }
    }

    #[test]
    fn succeeds_after_transient_failures() {
        let mut calls = 0;
        let result = retry_blocking(&quick_config(), "test", || {
            calls += 1;
            if calls < 3 {
                Err(ServiceError::Storage(anyhow::anyhow!("transient")))
            } else {
                Ok(42)
            }
        });
        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls, 3);
    }

    #[test]
    fn gives_up_after_max_retries() {
        let mut calls = 0;
        let result: Result<()> = retry_blocking(&quick_config(), "test", || {
            calls += 1;
            Err(ServiceError::Storage(anyhow::anyhow!("persistent")))
        });
        assert!(result.is_err());
        assert_eq!(calls, 3);
    }

    #[test]
    fn final_errors_are_not_retried() {
        let mut calls = 0;
        let result: Result<()> = retry_blocking(&quick_config(), "test", || {
            calls += 1;
            Err(ServiceError::target_not_found())
        });
        assert_eq!(result.unwrap_err().to_string(), "Specified target not found");
        assert_eq!(calls, 1);
    }
}

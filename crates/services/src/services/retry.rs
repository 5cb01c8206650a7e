//! Exponential backoff around single remote calls.

use std::{future::Future, time::Duration};

use backon::{ExponentialBuilder, Retryable};
use tracing::warn;

use super::backend::BackendError;

/// How many times, and how patiently, a failed remote call is retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(1000),
            max_delay: Duration::from_millis(5000),
        }
    }
}

impl RetryPolicy {
    /// A single attempt. Used for calls that must not be repeated.
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    fn backoff(&self) -> ExponentialBuilder {
        ExponentialBuilder::default()
            .with_min_delay(self.base_delay)
            .with_max_delay(self.max_delay)
            .with_factor(2.0)
            .with_max_times(self.max_retries)
    }
}

/// Runs `operation`, retrying transient failures per `policy`.
///
/// Non-retryable errors return immediately; once retries are exhausted the
/// last error is returned unchanged.
pub async fn with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    operation_name: &str,
    operation: F,
) -> Result<T, BackendError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, BackendError>>,
{
    operation
        .retry(policy.backoff())
        .when(BackendError::should_retry)
        .notify(|e: &BackendError, dur: Duration| {
            warn!(
                operation = operation_name,
                error = %e,
                "Remote call failed, retrying after {:.2}s",
                dur.as_secs_f64()
            )
        })
        .await
}

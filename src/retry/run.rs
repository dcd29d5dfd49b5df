//! Generic retry loop wrapping any fallible async operation.

use std::error::Error;
use std::fmt;
use std::future::Future;

use tracing::{debug, info, warn};

use super::{FailureType, RetryDecision, RetryPolicy, Retryable};

/// Error returned by [`with_retry`] when the operation did not succeed.
#[derive(Debug)]
pub enum RetryError<E> {
    /// The ordinary or quota attempt budget ran out.
    Exhausted {
        /// Ordinary attempts made.
        attempts: u32,
        /// Quota failures seen.
        quota_attempts: u32,
        /// The final error.
        last_error: E,
    },
    /// The error was not retryable (permanent or needs auth).
    NotRetryable {
        /// Classification of the final error.
        failure_type: FailureType,
        /// The final error.
        last_error: E,
    },
}

impl<E> RetryError<E> {
    /// Returns the final error.
    #[must_use]
    pub fn last_error(&self) -> &E {
        match self {
            Self::Exhausted { last_error, .. } | Self::NotRetryable { last_error, .. } => {
                last_error
            }
        }
    }

    /// Consumes the wrapper and returns the final error.
    #[must_use]
    pub fn into_inner(self) -> E {
        match self {
            Self::Exhausted { last_error, .. } | Self::NotRetryable { last_error, .. } => {
                last_error
            }
        }
    }

    /// Returns true if the budget ran out (as opposed to a non-retryable error).
    #[must_use]
    pub fn is_exhausted(&self) -> bool {
        matches!(self, Self::Exhausted { .. })
    }
}

impl<E: fmt::Display> fmt::Display for RetryError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exhausted {
                attempts,
                quota_attempts,
                last_error,
            } => write!(
                f,
                "retries exhausted after {attempts} attempts ({quota_attempts} quota waits): {last_error}"
            ),
            Self::NotRetryable {
                failure_type,
                last_error,
            } => write!(f, "not retryable ({failure_type:?}): {last_error}"),
        }
    }
}

impl<E: Error + 'static> Error for RetryError<E> {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        Some(self.last_error())
    }
}

/// Runs `operation` until it succeeds, retrying per `policy`.
///
/// The closure receives the 1-indexed call number. Ordinary failures are
/// retried on the policy's curve up to `max_attempts`; quota failures wait on
/// the quota curve and are counted against the quota budget only.
///
/// # Errors
///
/// Returns [`RetryError::Exhausted`] once either budget runs out and
/// [`RetryError::NotRetryable`] for permanent or auth failures.
///
/// # Example
///
/// ```
/// use asset_relay::retry::{with_retry, FailureType, RetryPolicy, Retryable};
///
/// #[derive(Debug)]
/// struct Flaky;
/// impl std::fmt::Display for Flaky {
///     fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
///         write!(f, "flaky")
///     }
/// }
/// impl Retryable for Flaky {
///     fn failure_type(&self) -> FailureType {
///         FailureType::Transient
///     }
/// }
///
/// # async fn example() {
/// let policy = RetryPolicy::with_max_attempts(3);
/// let result = with_retry(&policy, "example", |attempt| async move {
///     if attempt < 2 { Err(Flaky) } else { Ok(attempt) }
/// })
/// .await;
/// assert_eq!(result.unwrap(), 2);
/// # }
/// ```
pub async fn with_retry<T, E, F, Fut>(
    policy: &RetryPolicy,
    label: &str,
    mut operation: F,
) -> Result<T, RetryError<E>>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Retryable + fmt::Display,
{
    let mut attempts = 0u32;
    let mut quota_attempts = 0u32;
    let mut calls = 0u32;

    loop {
        calls += 1;
        let error = match operation(calls).await {
            Ok(value) => return Ok(value),
            Err(error) => error,
        };

        let failure_type = error.failure_type();
        let decision = if failure_type == FailureType::RateLimited {
            quota_attempts += 1;
            policy
                .quota()
                .should_retry(quota_attempts, error.retry_after())
        } else {
            attempts += 1;
            policy.should_retry(failure_type, attempts)
        };

        match decision {
            RetryDecision::Retry { delay, .. } => {
                if failure_type == FailureType::RateLimited {
                    warn!(
                        operation = label,
                        quota_attempts,
                        delay_secs = delay.as_secs(),
                        error = %error,
                        "provider quota hit, backing off"
                    );
                } else {
                    info!(
                        operation = label,
                        attempt = attempts + 1,
                        max_attempts = policy.max_attempts(),
                        delay_ms = delay.as_millis(),
                        error = %error,
                        "retrying"
                    );
                }
                tokio::time::sleep(delay).await;
            }
            RetryDecision::DoNotRetry { reason } => {
                debug!(operation = label, %reason, "not retrying");
                return Err(if failure_type.is_retryable() {
                    RetryError::Exhausted {
                        attempts,
                        quota_attempts,
                        last_error: error,
                    }
                } else {
                    RetryError::NotRetryable {
                        failure_type,
                        last_error: error,
                    }
                });
            }
        }
    }
}

//! Retry logic with exponential backoff for transient failures and a separate,
//! much longer backoff curve for provider quota signals.
//!
//! This module provides the [`RetryPolicy`], [`QuotaBackoff`] and
//! [`FailureType`] types for classifying errors and determining retry
//! behavior, plus [`with_retry`] which wraps any fallible async operation.
//!
//! # Overview
//!
//! When an operation fails, the error is classified into a [`FailureType`]:
//! - [`FailureType::Transient`] - Temporary failures that may succeed on retry
//! - [`FailureType::Permanent`] - Failures that won't succeed regardless of retries
//! - [`FailureType::NeedsAuth`] - Expired credentials; needs a refresh flow, not a retry
//! - [`FailureType::RateLimited`] - Provider quota; retried on the quota curve
//!
//! Ordinary and quota failures are counted independently: a long quota wait
//! never consumes the small attempt budget used for network blips.
//!
//! # Example
//!
//! ```
//! use asset_relay::retry::{FailureType, RetryDecision, RetryPolicy};
//!
//! let policy = RetryPolicy::default();
//!
//! match policy.should_retry(FailureType::Transient, 1) {
//!     RetryDecision::Retry { delay, attempt } => {
//!         println!("Retrying in {:?} (attempt {})", delay, attempt);
//!     }
//!     RetryDecision::DoNotRetry { reason } => {
//!         println!("Not retrying: {}", reason);
//!     }
//! }
//! ```

mod classify;
mod run;

pub use classify::{MAX_RETRY_AFTER, classify_http_status, parse_retry_after};
pub use run::{RetryError, with_retry};

use std::time::Duration;

use rand::Rng;
use tracing::{debug, instrument};

/// Default maximum retry attempts.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Default base delay for exponential backoff (1 second).
const DEFAULT_BASE_DELAY: Duration = Duration::from_secs(1);

/// Default maximum delay cap (64 seconds).
const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(64);

/// Default backoff multiplier (doubles each attempt).
const DEFAULT_BACKOFF_MULTIPLIER: f32 = 2.0;

/// Maximum jitter added to delays (500ms).
const MAX_JITTER: Duration = Duration::from_millis(500);

/// Default number of quota waits tolerated before giving up.
pub const DEFAULT_MAX_QUOTA_ATTEMPTS: u32 = 5;

/// Default first quota wait (1 minute).
const DEFAULT_QUOTA_BASE_DELAY: Duration = Duration::from_secs(60);

/// Default quota wait cap (16 minutes).
const DEFAULT_QUOTA_MAX_DELAY: Duration = Duration::from_secs(960);

/// Classification of failure types.
///
/// Used to determine whether a failed operation should be retried and on
/// which backoff curve.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureType {
    /// Temporary failure that may succeed on retry.
    ///
    /// Examples: network timeout, connection reset, 5xx server errors.
    Transient,

    /// Permanent failure that won't succeed regardless of retries.
    ///
    /// Examples: 404 Not Found, permission denied, unsupported type.
    Permanent,

    /// Expired or missing credentials.
    ///
    /// Triggers a refresh flow in the caller rather than a blind retry.
    NeedsAuth,

    /// Provider quota or rate limiting (HTTP 429).
    ///
    /// Retried on the [`QuotaBackoff`] curve with its own attempt budget.
    RateLimited,
}

impl FailureType {
    /// Returns true for failure types that a plain retry may fix.
    #[must_use]
    pub fn is_retryable(self) -> bool {
        matches!(self, Self::Transient | Self::RateLimited)
    }
}

/// Errors that can be classified for retry decisions.
pub trait Retryable {
    /// Classifies this error.
    fn failure_type(&self) -> FailureType;

    /// Server-mandated wait, when the error carried one (e.g. `Retry-After`).
    fn retry_after(&self) -> Option<Duration> {
        None
    }
}

/// Decision on whether to retry a failed operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Retry the operation after the specified delay.
    Retry {
        /// How long to wait before retrying.
        delay: Duration,
        /// Which attempt number this will be (1-indexed, so first retry is attempt 2).
        attempt: u32,
    },

    /// Do not retry the operation.
    DoNotRetry {
        /// Human-readable reason why retry is not attempted.
        reason: String,
    },
}

/// Shape of the ordinary backoff curve.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum BackoffCurve {
    /// `base * multiplier^(attempt - 1)`
    Exponential {
        /// Multiplier applied each attempt (typically 2.0 for doubling).
        multiplier: f32,
    },
    /// `base * attempt`
    Linear,
    /// `base` every time
    Fixed,
}

/// Long backoff curve used for provider quota failures.
///
/// Delays double from `base_delay` up to `max_delay`. Attempts are counted
/// separately from ordinary failures.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuotaBackoff {
    max_attempts: u32,
    base_delay: Duration,
    max_delay: Duration,
}

impl Default for QuotaBackoff {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_QUOTA_ATTEMPTS,
            base_delay: DEFAULT_QUOTA_BASE_DELAY,
            max_delay: DEFAULT_QUOTA_MAX_DELAY,
        }
    }
}

impl QuotaBackoff {
    /// Creates a quota curve with custom settings.
    #[must_use]
    pub fn new(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            max_delay,
        }
    }

    /// Returns the number of quota waits tolerated.
    #[must_use]
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Decides whether to wait out a quota failure.
    ///
    /// `quota_attempt` is the number of quota failures seen so far (1-indexed).
    /// A server-mandated `retry_after` replaces the computed step when present.
    #[instrument(skip(self), fields(max_quota_attempts = self.max_attempts))]
    pub fn should_retry(&self, quota_attempt: u32, retry_after: Option<Duration>) -> RetryDecision {
        if quota_attempt > self.max_attempts {
            debug!(quota_attempt, "quota budget exhausted");
            return RetryDecision::DoNotRetry {
                reason: format!("quota budget ({}) exhausted", self.max_attempts),
            };
        }

        let delay = retry_after.unwrap_or_else(|| self.calculate_delay(quota_attempt));
        RetryDecision::Retry {
            delay,
            attempt: quota_attempt + 1,
        }
    }

    fn calculate_delay(&self, quota_attempt: u32) -> Duration {
        let exponent = quota_attempt.saturating_sub(1).min(31);
        self.base_delay
            .checked_mul(1u32 << exponent)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

/// Configuration for retry behavior.
///
/// # Default Values
///
/// - `max_attempts`: 3
/// - `base_delay`: 1 second
/// - `max_delay`: 64 seconds
/// - curve: exponential, multiplier 2.0, with up to 500ms jitter
/// - quota: 5 waits, 1 minute doubling up to 16 minutes
///
/// # Delay Calculation
///
/// ```text
/// delay = min(base_delay * multiplier^(attempt-1), max_delay) + jitter
/// ```
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Maximum number of ordinary attempts (including the initial attempt).
    max_attempts: u32,

    /// Base delay for the first retry.
    base_delay: Duration,

    /// Maximum delay cap.
    max_delay: Duration,

    curve: BackoffCurve,

    jitter: bool,

    quota: QuotaBackoff,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_RETRIES,
            base_delay: DEFAULT_BASE_DELAY,
            max_delay: DEFAULT_MAX_DELAY,
            curve: BackoffCurve::Exponential {
                multiplier: DEFAULT_BACKOFF_MULTIPLIER,
            },
            jitter: true,
            quota: QuotaBackoff::default(),
        }
    }
}

impl RetryPolicy {
    /// Creates a new exponential retry policy with custom settings.
    ///
    /// # Arguments
    ///
    /// * `max_attempts` - Maximum attempts including initial (must be >= 1)
    /// * `base_delay` - Base delay for first retry
    /// * `max_delay` - Maximum delay cap
    /// * `backoff_multiplier` - Multiplier for exponential increase
    #[must_use]
    pub fn new(
        max_attempts: u32,
        base_delay: Duration,
        max_delay: Duration,
        backoff_multiplier: f32,
    ) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            max_delay,
            curve: BackoffCurve::Exponential {
                multiplier: backoff_multiplier,
            },
            ..Self::default()
        }
    }

    /// Creates a linear policy: the n-th retry waits `step * n`.
    #[must_use]
    pub fn linear(max_attempts: u32, step: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay: step,
            max_delay: step.saturating_mul(max_attempts.max(1)),
            curve: BackoffCurve::Linear,
            jitter: false,
            ..Self::default()
        }
    }

    /// Creates a fixed-delay policy: every retry waits `delay`.
    #[must_use]
    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay: delay,
            max_delay: delay,
            curve: BackoffCurve::Fixed,
            jitter: false,
            ..Self::default()
        }
    }

    /// Creates a policy with a custom max_attempts, using defaults for other settings.
    #[must_use]
    pub fn with_max_attempts(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            ..Self::default()
        }
    }

    /// Replaces the quota curve.
    #[must_use]
    pub fn with_quota(mut self, quota: QuotaBackoff) -> Self {
        self.quota = quota;
        self
    }

    /// Disables random jitter (deterministic delays).
    #[must_use]
    pub fn without_jitter(mut self) -> Self {
        self.jitter = false;
        self
    }

    /// Returns the maximum number of attempts configured.
    #[must_use]
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Returns the quota curve.
    #[must_use]
    pub fn quota(&self) -> &QuotaBackoff {
        &self.quota
    }

    /// Determines whether to retry after an ordinary failure.
    ///
    /// # Arguments
    ///
    /// * `failure_type` - Classification of the failure
    /// * `attempt` - The ordinary attempt number that just failed (1-indexed)
    ///
    /// Quota failures should go through [`QuotaBackoff::should_retry`]
    /// instead; passed here they share the ordinary budget.
    #[instrument(skip(self), fields(max_attempts = self.max_attempts))]
    pub fn should_retry(&self, failure_type: FailureType, attempt: u32) -> RetryDecision {
        match failure_type {
            FailureType::Permanent => {
                return RetryDecision::DoNotRetry {
                    reason: "permanent failure - retry would not help".to_string(),
                };
            }
            FailureType::NeedsAuth => {
                return RetryDecision::DoNotRetry {
                    reason: "authentication expired - needs refresh, not retry".to_string(),
                };
            }
            FailureType::Transient | FailureType::RateLimited => {}
        }

        if attempt >= self.max_attempts {
            debug!(attempt, max = self.max_attempts, "max attempts reached");
            return RetryDecision::DoNotRetry {
                reason: format!("max attempts ({}) exhausted", self.max_attempts),
            };
        }

        let delay = self.calculate_delay(attempt);

        debug!(
            attempt,
            next_attempt = attempt + 1,
            delay_ms = delay.as_millis(),
            "will retry"
        );

        RetryDecision::Retry {
            delay,
            attempt: attempt + 1,
        }
    }

    /// Calculates the delay for a retry attempt, including jitter when enabled.
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    fn calculate_delay(&self, attempt: u32) -> Duration {
        let base_ms = self.base_delay.as_millis() as f64;

        let delay_ms = match self.curve {
            BackoffCurve::Exponential { multiplier } => {
                // attempt 1 = 2^0 = 1x base
                let exponent = f64::from(attempt.saturating_sub(1));
                base_ms * f64::from(multiplier).powf(exponent)
            }
            BackoffCurve::Linear => base_ms * f64::from(attempt),
            BackoffCurve::Fixed => base_ms,
        };

        let capped_ms = delay_ms.min(self.max_delay.as_millis() as f64);

        let jitter = if self.jitter {
            calculate_jitter()
        } else {
            Duration::ZERO
        };

        Duration::from_millis(capped_ms as u64) + jitter
    }
}

/// Generates random jitter between 0 and `MAX_JITTER`.
#[allow(clippy::cast_possible_truncation)]
fn calculate_jitter() -> Duration {
    let mut rng = rand::thread_rng();
    let jitter_ms = rng.gen_range(0..=MAX_JITTER.as_millis() as u64);
    Duration::from_millis(jitter_ms)
}

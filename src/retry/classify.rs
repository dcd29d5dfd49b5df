//! HTTP status classification and `Retry-After` parsing.

use std::time::Duration;

use tracing::{debug, instrument, warn};

use super::FailureType;

/// Maximum Retry-After value (1 hour) to prevent excessive delays.
pub const MAX_RETRY_AFTER: Duration = Duration::from_secs(3600);

/// Classifies an HTTP status code into a failure type.
///
/// | Status | Type |
/// |--------|------|
/// | 401, 403, 407 | NeedsAuth |
/// | 408 | Transient |
/// | 429 | RateLimited |
/// | other 4xx | Permanent |
/// | 5xx | Transient |
/// | anything else | Permanent |
#[allow(clippy::match_same_arms)]
#[must_use]
pub fn classify_http_status(status: u16) -> FailureType {
    match status {
        401 | 403 | 407 => FailureType::NeedsAuth,
        408 => FailureType::Transient,
        429 => FailureType::RateLimited,
        status if (400..500).contains(&status) => FailureType::Permanent,
        status if (500..600).contains(&status) => FailureType::Transient,
        _ => FailureType::Permanent,
    }
}

/// Parses a Retry-After header value into a Duration.
///
/// Supports two formats as per RFC 7231:
/// - Integer seconds: `Retry-After: 120`
/// - HTTP-date: `Retry-After: Wed, 21 Oct 2025 07:28:00 GMT`
///
/// Returns `None` if the value cannot be parsed. Caps excessive values at 1 hour.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use asset_relay::retry::parse_retry_after;
///
/// assert_eq!(parse_retry_after("120"), Some(Duration::from_secs(120)));
/// assert_eq!(parse_retry_after("0"), Some(Duration::ZERO));
/// assert_eq!(parse_retry_after("invalid"), None);
/// ```
#[must_use]
#[instrument]
pub fn parse_retry_after(header_value: &str) -> Option<Duration> {
    let header_value = header_value.trim();

    if let Ok(seconds) = header_value.parse::<i64>() {
        if seconds < 0 {
            debug!(seconds, "negative Retry-After value, ignoring");
            return None;
        }

        #[allow(clippy::cast_sign_loss)]
        let duration = Duration::from_secs(seconds as u64);

        if duration > MAX_RETRY_AFTER {
            warn!(
                seconds,
                max_seconds = MAX_RETRY_AFTER.as_secs(),
                "Retry-After exceeds maximum, capping at 1 hour"
            );
            return Some(MAX_RETRY_AFTER);
        }

        return Some(duration);
    }

    if let Ok(datetime) = httpdate::parse_http_date(header_value) {
        match datetime.duration_since(std::time::SystemTime::now()) {
            Ok(duration) if duration > MAX_RETRY_AFTER => {
                warn!(
                    delay_secs = duration.as_secs(),
                    max_secs = MAX_RETRY_AFTER.as_secs(),
                    "Retry-After date exceeds maximum, capping at 1 hour"
                );
                Some(MAX_RETRY_AFTER)
            }
            Ok(duration) => Some(duration),
            Err(_) => {
                debug!(header_value, "Retry-After date is in the past, returning zero");
                Some(Duration::ZERO)
            }
        }
    } else {
        debug!(header_value, "unparseable Retry-After value");
        None
    }
}

//! Error types for the transfer module.
//!
//! This module defines structured errors for probe, metadata, chunk and
//! file-assembly operations.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::retry::{FailureType, Retryable, classify_http_status, parse_retry_after};

/// Errors that can occur while transferring a resource.
#[derive(Debug, Error)]
pub enum TransferError {
    /// Network-level error (DNS resolution, connection refused, reset, TLS).
    #[error("network error fetching {url}: {source}")]
    Network {
        /// The URL that failed.
        url: String,
        /// The underlying network error.
        #[source]
        source: reqwest::Error,
    },

    /// Request timed out before completion.
    #[error("timeout fetching {url}")]
    Timeout {
        /// The URL that timed out.
        url: String,
    },

    /// HTTP error response (4xx client errors, 5xx server errors).
    #[error("HTTP {status} fetching {url}")]
    HttpStatus {
        /// The URL that returned an error status.
        url: String,
        /// The HTTP status code.
        status: u16,
        /// The Retry-After header value, if present (for 429 responses).
        retry_after: Option<String>,
    },

    /// The resource locator is malformed.
    #[error("invalid URL: {url}")]
    InvalidUrl {
        /// The invalid URL string.
        url: String,
    },

    /// The metadata request did not reveal a total size.
    #[error("could not determine size of {url}")]
    UnknownSize {
        /// The URL whose size is unknown.
        url: String,
    },

    /// The server answered a range request with something other than the range.
    #[error("range {start}-{end} of {url} answered with {detail}")]
    RangeMismatch {
        /// The URL requested.
        url: String,
        /// First byte requested.
        start: u64,
        /// Last byte requested (inclusive).
        end: u64,
        /// What came back instead.
        detail: String,
    },

    /// File system error while assembling the destination file.
    #[error("IO error writing to {path}: {source}")]
    Io {
        /// The file path where the error occurred.
        path: PathBuf,
        /// The underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// Written byte count does not match the probed total size.
    #[error(
        "integrity check failed for {path}: expected {expected_bytes} bytes, got {actual_bytes}"
    )]
    Integrity {
        /// Destination path that failed verification.
        path: PathBuf,
        /// Expected size in bytes.
        expected_bytes: u64,
        /// Actual size in bytes.
        actual_bytes: u64,
    },

    /// A chunk exhausted its retries; the whole download is abandoned.
    #[error("chunk {index} failed after {attempts} attempts: {source}")]
    ChunkFailed {
        /// Index of the failing chunk.
        index: usize,
        /// Attempts made for the chunk.
        attempts: u32,
        /// The last chunk error.
        #[source]
        source: Box<TransferError>,
    },
}

impl TransferError {
    /// Creates a network error from a reqwest error, mapping timeouts.
    pub fn network(url: impl Into<String>, source: reqwest::Error) -> Self {
        if source.is_timeout() {
            Self::Timeout { url: url.into() }
        } else {
            Self::Network {
                url: url.into(),
                source,
            }
        }
    }

    /// Creates an HTTP status error.
    pub fn http_status(url: impl Into<String>, status: u16) -> Self {
        Self::HttpStatus {
            url: url.into(),
            status,
            retry_after: None,
        }
    }

    /// Creates an HTTP status error with a Retry-After header value.
    pub fn http_status_with_retry_after(
        url: impl Into<String>,
        status: u16,
        retry_after: Option<String>,
    ) -> Self {
        Self::HttpStatus {
            url: url.into(),
            status,
            retry_after,
        }
    }

    /// Creates a timeout error.
    pub fn timeout(url: impl Into<String>) -> Self {
        Self::Timeout { url: url.into() }
    }

    /// Creates an invalid URL error.
    pub fn invalid_url(url: impl Into<String>) -> Self {
        Self::InvalidUrl { url: url.into() }
    }

    /// Creates a range mismatch error.
    pub fn range_mismatch(
        url: impl Into<String>,
        start: u64,
        end: u64,
        detail: impl Into<String>,
    ) -> Self {
        Self::RangeMismatch {
            url: url.into(),
            start,
            end,
            detail: detail.into(),
        }
    }

    /// Creates an IO error.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Creates an integrity mismatch error.
    pub fn integrity(path: impl Into<PathBuf>, expected_bytes: u64, actual_bytes: u64) -> Self {
        Self::Integrity {
            path: path.into(),
            expected_bytes,
            actual_bytes,
        }
    }
}

impl Retryable for TransferError {
    fn failure_type(&self) -> FailureType {
        match self {
            Self::HttpStatus { status, .. } => classify_http_status(*status),
            Self::Network { source, .. } => {
                if is_tls_error(source) {
                    FailureType::Permanent
                } else {
                    FailureType::Transient
                }
            }
            Self::Timeout { .. } | Self::RangeMismatch { .. } | Self::UnknownSize { .. } => {
                FailureType::Transient
            }
            Self::InvalidUrl { .. } | Self::Io { .. } | Self::Integrity { .. } => {
                FailureType::Permanent
            }
            Self::ChunkFailed { source, .. } => source.failure_type(),
        }
    }

    fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::HttpStatus {
                retry_after: Some(value),
                ..
            } => parse_retry_after(value),
            Self::ChunkFailed { source, .. } => source.retry_after(),
            _ => None,
        }
    }
}

/// Checks if a reqwest error is a TLS/certificate error.
fn is_tls_error(error: &reqwest::Error) -> bool {
    let error_string = error.to_string().to_lowercase();
    error_string.contains("certificate")
        || error_string.contains("tls")
        || error_string.contains("ssl")
        || error_string.contains("handshake")
}

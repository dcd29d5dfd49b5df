//! Destination/remote storage collaborator.
//!
//! The pipeline only needs a handful of calls from the storage provider:
//! folder listing, metadata, folder creation, file upload and a same-name
//! existence check. [`RemoteStorage`] captures exactly those, so the API
//! client itself lives outside this crate and tests use in-memory doubles.

mod walk;

pub use walk::discover_tasks;

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::retry::{FailureType, Retryable, classify_http_status, parse_retry_after};

/// MIME type the provider uses for folders.
pub const FOLDER_MIME_TYPE: &str = "application/vnd.google-apps.folder";

/// A file or folder in remote storage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteEntry {
    /// Provider identifier.
    pub id: String,
    /// Display name.
    pub name: String,
    /// True for folders.
    pub is_folder: bool,
    /// MIME type as reported by the provider.
    pub mime_type: String,
    /// Size in bytes, when known.
    #[serde(default)]
    pub size: Option<u64>,
    /// Viewer URL that discovery navigates to.
    #[serde(default)]
    pub web_url: Option<String>,
}

/// Errors reported by a [`RemoteStorage`] implementation.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Temporary provider or network failure.
    #[error("storage request failed: {message}")]
    Transient {
        /// Provider message.
        message: String,
    },

    /// Provider quota or rate limit.
    #[error("storage quota exceeded: {message}")]
    Quota {
        /// Provider message.
        message: String,
        /// Server-mandated wait, if any.
        retry_after: Option<Duration>,
    },

    /// Credentials expired; call [`RemoteStorage::refresh_auth`].
    #[error("storage credentials expired")]
    AuthExpired,

    /// The entry does not exist or is not visible.
    #[error("not found: {id}")]
    NotFound {
        /// Identifier that was looked up.
        id: String,
    },

    /// Any other failure that will not succeed on retry.
    #[error("storage request rejected: {message}")]
    Permanent {
        /// Provider message.
        message: String,
    },

    /// Local file error while reading an upload payload.
    #[error("IO error reading {path}: {source}")]
    Io {
        /// Local path.
        path: String,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },
}

impl StorageError {
    /// Maps an HTTP status from the provider API to a storage error.
    #[must_use]
    pub fn from_status(status: u16, message: impl Into<String>, retry_after: Option<&str>) -> Self {
        let message = message.into();
        match classify_http_status(status) {
            FailureType::Transient => Self::Transient { message },
            FailureType::RateLimited => Self::Quota {
                message,
                retry_after: retry_after.and_then(parse_retry_after),
            },
            FailureType::NeedsAuth => Self::AuthExpired,
            FailureType::Permanent if status == 404 => Self::NotFound { id: message },
            FailureType::Permanent => Self::Permanent { message },
        }
    }

    /// Creates an IO error for a local upload payload.
    pub fn io(path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.display().to_string(),
            source,
        }
    }
}

impl Retryable for StorageError {
    fn failure_type(&self) -> FailureType {
        match self {
            Self::Transient { .. } => FailureType::Transient,
            Self::Quota { .. } => FailureType::RateLimited,
            Self::AuthExpired => FailureType::NeedsAuth,
            Self::NotFound { .. } | Self::Permanent { .. } | Self::Io { .. } => {
                FailureType::Permanent
            }
        }
    }

    fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::Quota { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}

/// Remote storage provider used as both source tree and upload destination.
///
/// # Object Safety
///
/// Uses `async_trait` so the pipeline can hold an `Arc<dyn RemoteStorage>`.
#[async_trait]
pub trait RemoteStorage: Send + Sync {
    /// Lists the direct children of a folder.
    async fn list_children(&self, folder_id: &str) -> Result<Vec<RemoteEntry>, StorageError>;

    /// Returns metadata for a file or folder.
    async fn metadata(&self, id: &str) -> Result<RemoteEntry, StorageError>;

    /// Creates a folder under `parent_id` and returns it.
    async fn create_folder(&self, parent_id: &str, name: &str)
    -> Result<RemoteEntry, StorageError>;

    /// Uploads a local file under `parent_id`. Implementations should use a
    /// resumable upload for large payloads.
    async fn upload_file(
        &self,
        parent_id: &str,
        name: &str,
        local_path: &Path,
        mime_type: &str,
    ) -> Result<RemoteEntry, StorageError>;

    /// Returns true if a file named `name` already exists under `parent_id`.
    async fn file_exists(&self, parent_id: &str, name: &str) -> Result<bool, StorageError>;

    /// Refreshes expired credentials. The default does nothing.
    async fn refresh_auth(&self) -> Result<(), StorageError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_status_classification() {
        assert!(matches!(
            StorageError::from_status(503, "backend", None),
            StorageError::Transient { .. }
        ));
        assert!(matches!(
            StorageError::from_status(401, "expired", None),
            StorageError::AuthExpired
        ));
        assert!(matches!(
            StorageError::from_status(404, "abc", None),
            StorageError::NotFound { .. }
        ));
        assert!(matches!(
            StorageError::from_status(400, "bad", None),
            StorageError::Permanent { .. }
        ));
    }

    #[test]
    fn test_quota_carries_retry_after() {
        let error = StorageError::from_status(429, "userRateLimitExceeded", Some("120"));
        assert_eq!(error.failure_type(), FailureType::RateLimited);
        assert_eq!(error.retry_after(), Some(Duration::from_secs(120)));
    }
}

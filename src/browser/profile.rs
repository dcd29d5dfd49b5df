//! Profiles: isolated, persistent working directories for instances.

use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::InterceptedRequest;

/// Which kind of asset a profile discovers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProfileKind {
    /// Video streams.
    #[default]
    Video,
    /// Rendered documents (PDF and page images).
    Document,
}

impl ProfileKind {
    /// Returns the lowercase label used in paths and logs.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Video => "video",
            Self::Document => "document",
        }
    }

    /// Picks the kind that can discover a file of `mime_type`.
    ///
    /// Returns `None` for types no profile handles.
    #[must_use]
    pub fn from_mime(mime_type: &str) -> Option<Self> {
        let mime = mime_type
            .split(';')
            .next()
            .unwrap_or("")
            .trim()
            .to_ascii_lowercase();
        if mime.starts_with("video/") {
            return Some(Self::Video);
        }
        match mime.as_str() {
            "application/pdf"
            | "application/vnd.google-apps.document"
            | "application/vnd.google-apps.presentation"
            | "application/vnd.google-apps.spreadsheet" => Some(Self::Document),
            _ => None,
        }
    }

    /// MIME type sent with uploads of this kind.
    #[must_use]
    pub fn upload_mime_type(self) -> &'static str {
        match self {
            Self::Video => "video/mp4",
            Self::Document => "application/pdf",
        }
    }

    /// Returns true if an intercepted request carries the asset this kind wants.
    #[must_use]
    pub fn matches(self, request: &InterceptedRequest) -> bool {
        let content_type = request
            .content_type
            .as_deref()
            .unwrap_or("")
            .to_ascii_lowercase();
        let path = request
            .url
            .split(['?', '#'])
            .next()
            .unwrap_or("")
            .to_ascii_lowercase();
        match self {
            Self::Video => {
                request.resource_type == "media"
                    || content_type.starts_with("video/")
                    || path.contains("videoplayback")
            }
            Self::Document => content_type.starts_with("application/pdf") || path.ends_with(".pdf"),
        }
    }
}

impl fmt::Display for ProfileKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Lifecycle of a profile's instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    /// No live instance.
    Idle,
    /// A launch is in progress.
    Launching,
    /// A live instance is leased to at least one task.
    Active,
    /// The instance crashed; the next acquire relaunches.
    Disconnected,
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Idle => "idle",
            Self::Launching => "launching",
            Self::Active => "active",
            Self::Disconnected => "disconnected",
        };
        write!(f, "{label}")
    }
}

/// A named slot backed by its own working directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrowserProfile {
    /// Index of the profile within its pool.
    pub profile_id: usize,
    /// What the profile discovers.
    pub kind: ProfileKind,
    /// Exclusive working directory.
    pub work_dir: PathBuf,
    /// Current lifecycle state.
    pub state: LifecycleState,
}

impl BrowserProfile {
    /// Working directory for profile `profile_id` of `kind` under `base_dir`.
    #[must_use]
    pub fn work_dir_for(base_dir: &Path, kind: ProfileKind, profile_id: usize) -> PathBuf {
        base_dir.join(format!("{kind}_profile_{profile_id}"))
    }
}

/// Creates one working directory per profile index. Existing directories
/// are left untouched.
///
/// # Errors
///
/// Returns the IO error and path of the first directory that could not be
/// created.
pub async fn provision_profiles(
    base_dir: &Path,
    kind: ProfileKind,
    count: usize,
) -> Result<Vec<BrowserProfile>, (PathBuf, std::io::Error)> {
    let mut profiles = Vec::with_capacity(count);
    for profile_id in 0..count {
        let work_dir = BrowserProfile::work_dir_for(base_dir, kind, profile_id);
        if !tokio::fs::try_exists(&work_dir).await.unwrap_or(false) {
            tokio::fs::create_dir_all(&work_dir)
                .await
                .map_err(|e| (work_dir.clone(), e))?;
            debug!(path = %work_dir.display(), "provisioned profile directory");
        }
        profiles.push(BrowserProfile {
            profile_id,
            kind,
            work_dir,
            state: LifecycleState::Idle,
        });
    }
    Ok(profiles)
}

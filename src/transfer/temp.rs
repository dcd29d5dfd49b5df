//! Scoped temporary destination files.

use std::path::{Path, PathBuf};

use tracing::{debug, warn};

/// Suffix appended to in-progress downloads.
const PARTIAL_SUFFIX: &str = ".part";

/// Longest sanitized display-name stem kept in a temp file name, in bytes.
const MAX_STEM_BYTES: usize = 96;

/// Longest token kept in a temp file name, in bytes.
const MAX_TOKEN_BYTES: usize = 64;

/// A temporary file path removed on drop unless [`keep`](Self::keep) is called.
///
/// Covers every exit path of a task: success, error return, panic unwinding,
/// and task cancellation all drop the guard.
#[derive(Debug)]
pub struct ScopedTempFile {
    path: PathBuf,
    armed: bool,
}

impl ScopedTempFile {
    /// Reserves `dir/<token>-<name>.part`; the file itself is not created.
    ///
    /// `token` must be unique among live temp files in `dir`. Both parts are
    /// sanitized and length-capped so the file name stays well under the
    /// usual 255-byte limit.
    #[must_use]
    pub fn new(dir: &Path, token: &str, name: &str) -> Self {
        let file_name = format!(
            "{}-{}{PARTIAL_SUFFIX}",
            truncate_bytes(sanitize_component(token), MAX_TOKEN_BYTES),
            truncate_bytes(sanitize_component(name), MAX_STEM_BYTES)
        );
        Self {
            path: dir.join(file_name),
            armed: true,
        }
    }

    /// Path of the temporary file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Disarms the guard and returns the path; the file is left in place.
    #[must_use]
    pub fn keep(mut self) -> PathBuf {
        self.armed = false;
        std::mem::take(&mut self.path)
    }
}

impl Drop for ScopedTempFile {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        match std::fs::remove_file(&self.path) {
            Ok(()) => debug!(path = %self.path.display(), "removed temporary file"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = %self.path.display(), error = %e, "failed to remove temporary file"),
        }
    }
}

/// Maps a display name to a single safe path segment.
fn sanitize_component(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut prev_sep = false;
    for ch in value.chars() {
        let mapped = match ch {
            c if c.is_alphanumeric() || matches!(c, '-' | '.') => c,
            _ => '_',
        };
        if mapped == '_' {
            if !prev_sep {
                out.push('_');
            }
            prev_sep = true;
        } else {
            out.push(mapped);
            prev_sep = false;
        }
    }
    let trimmed = out.trim_matches(|c| c == '_' || c == '.');
    if trimmed.is_empty() {
        "_".to_string()
    } else {
        trimmed.to_string()
    }
}

/// Cuts `value` to at most `max` bytes on a char boundary.
fn truncate_bytes(mut value: String, max: usize) -> String {
    if value.len() > max {
        let mut end = max;
        while !value.is_char_boundary(end) {
            end -= 1;
        }
        value.truncate(end);
    }
    value
}

//! Append-only process log of per-task lifecycle events (JSON lines).
//!
//! Writes are best-effort: a failure to log never fails a task.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::warn;

use crate::ledger::unix_now;

/// Lifecycle step of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskEventKind {
    /// Task picked up by a worker.
    Started,
    /// Download finished and verified.
    Downloaded,
    /// Upload accepted by the destination.
    Uploaded,
    /// Destination already had the file.
    Skipped,
    /// A run of the task failed.
    Error,
}

/// One line of the process log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskEvent {
    /// Task identifier.
    pub task_id: String,
    /// Display name of the asset.
    pub name: String,
    /// What happened.
    pub event: TaskEventKind,
    /// Free-form context (byte count, error message...).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    /// Unix timestamp in seconds.
    pub timestamp: u64,
}

impl TaskEvent {
    /// Creates an event stamped with the current time.
    #[must_use]
    pub fn now(
        task_id: impl Into<String>,
        name: impl Into<String>,
        event: TaskEventKind,
        detail: Option<String>,
    ) -> Self {
        Self {
            task_id: task_id.into(),
            name: name.into(),
            event,
            detail,
            timestamp: unix_now(),
        }
    }
}

/// JSON-lines event sink.
#[derive(Debug)]
pub struct EventLog {
    path: Option<PathBuf>,
    lock: Mutex<()>,
}

impl EventLog {
    /// Logs to `path`, creating it (and its parent directory) on first write.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: Some(path.into()),
            lock: Mutex::new(()),
        }
    }

    /// A log that discards every event.
    #[must_use]
    pub fn disabled() -> Self {
        Self {
            path: None,
            lock: Mutex::new(()),
        }
    }

    /// Location of the log file, if enabled.
    #[must_use]
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Appends one event.
    pub async fn record(&self, event: &TaskEvent) {
        let Some(path) = &self.path else {
            return;
        };
        let _guard = self.lock.lock().await;
        if let Err(e) = append_line(path, event).await {
            warn!(path = %path.display(), task_id = %event.task_id, error = %e, "failed to write event log");
        }
    }

    /// Reads every event back; malformed lines are skipped.
    ///
    /// # Errors
    ///
    /// Returns the IO error if an existing log cannot be read.
    pub async fn read_all(&self) -> std::io::Result<Vec<TaskEvent>> {
        let Some(path) = &self.path else {
            return Ok(Vec::new());
        };
        let content = match tokio::fs::read_to_string(path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        Ok(content
            .lines()
            .filter_map(|line| serde_json::from_str(line).ok())
            .collect())
    }
}

async fn append_line(path: &Path, event: &TaskEvent) -> std::io::Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await?;
    }
    let mut line = serde_json::to_string(event).map_err(std::io::Error::other)?;
    line.push('\n');
    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await?;
    file.write_all(line.as_bytes()).await?;
    file.flush().await
}

//! Durable dead-letter record of tasks that exhausted their retries.
//!
//! The ledger is a single JSON array on disk. Every append rewrites the
//! whole file through a temporary sibling and an atomic rename, so a crash
//! mid-write leaves either the old or the new contents, never a torn file.
//! Failure volume is low enough that read-modify-write is fine.

use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument};

use crate::browser::ProfileKind;

/// Suffix of the temporary file used for atomic replacement.
const TEMP_SUFFIX: &str = ".tmp";

/// Errors from ledger persistence.
#[derive(Debug, Error)]
pub enum LedgerError {
    /// Reading or writing the ledger file failed.
    #[error("ledger IO error at {path}: {source}")]
    Io {
        /// Path that failed.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// The ledger file is not valid JSON.
    #[error("ledger at {path} is corrupt: {source}")]
    Json {
        /// Path that failed to parse.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: serde_json::Error,
    },
}

impl LedgerError {
    fn io(path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }

    fn json(path: &Path, source: serde_json::Error) -> Self {
        Self::Json {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// One abandoned task. Never mutated after creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureRecord {
    /// Display name of the asset.
    pub file_name: String,
    /// Provider reference the asset was discovered from.
    pub source_ref: String,
    /// Destination parent identifier.
    pub destination: String,
    /// Final error message.
    pub error: String,
    /// Unix timestamp (seconds) of the failure.
    pub timestamp: u64,
    /// Which profile kind discovers this asset.
    #[serde(default)]
    pub kind: ProfileKind,
}

impl FailureRecord {
    /// Creates a record stamped with the current time.
    #[must_use]
    pub fn now(
        file_name: impl Into<String>,
        source_ref: impl Into<String>,
        destination: impl Into<String>,
        error: impl Into<String>,
        kind: ProfileKind,
    ) -> Self {
        Self {
            file_name: file_name.into(),
            source_ref: source_ref.into(),
            destination: destination.into(),
            error: error.into(),
            timestamp: unix_now(),
            kind,
        }
    }
}

/// Seconds since the Unix epoch; zero if the clock is before 1970.
#[must_use]
pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_secs())
        .unwrap_or(0)
}

/// Append-only JSON ledger of [`FailureRecord`]s.
///
/// Writers within a process are serialised by an async mutex.
#[derive(Debug)]
pub struct FailureLedger {
    path: PathBuf,
    lock: Mutex<()>,
}

impl FailureLedger {
    /// Opens a ledger at `path`. The file is created lazily on first append.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    /// Location of the ledger file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Durably appends one record.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError`] if the existing file cannot be read or parsed,
    /// or the new contents cannot be written.
    #[instrument(skip(self, record), fields(file_name = %record.file_name))]
    pub async fn append(&self, record: FailureRecord) -> Result<(), LedgerError> {
        let _guard = self.lock.lock().await;
        let mut records = self.read_records().await?;
        records.push(record);
        self.write_records(&records).await?;
        info!(entries = records.len(), "failure recorded in ledger");
        Ok(())
    }

    /// Returns every record, oldest first. A missing file is an empty ledger.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError`] if the file exists but cannot be read or parsed.
    pub async fn load_all(&self) -> Result<Vec<FailureRecord>, LedgerError> {
        let _guard = self.lock.lock().await;
        self.read_records().await
    }

    /// Number of records in the ledger.
    ///
    /// # Errors
    ///
    /// See [`load_all`](Self::load_all).
    pub async fn len(&self) -> Result<usize, LedgerError> {
        Ok(self.load_all().await?.len())
    }

    /// Returns true when the ledger holds no records.
    ///
    /// # Errors
    ///
    /// See [`load_all`](Self::load_all).
    pub async fn is_empty(&self) -> Result<bool, LedgerError> {
        Ok(self.len().await? == 0)
    }

    /// Removes every record.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::Io`] if the file cannot be removed.
    pub async fn clear(&self) -> Result<(), LedgerError> {
        let _guard = self.lock.lock().await;
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(LedgerError::io(&self.path, e)),
        }
        debug!(path = %self.path.display(), "ledger cleared");
        Ok(())
    }

    /// Atomically replaces the ledger contents with `records`.
    ///
    /// An empty slice removes the file.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError`] on write failure.
    pub async fn replace_all(&self, records: &[FailureRecord]) -> Result<(), LedgerError> {
        if records.is_empty() {
            return self.clear().await;
        }
        let _guard = self.lock.lock().await;
        self.write_records(records).await
    }

    async fn read_records(&self) -> Result<Vec<FailureRecord>, LedgerError> {
        let bytes = match tokio::fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(LedgerError::io(&self.path, e)),
        };
        if bytes.iter().all(u8::is_ascii_whitespace) {
            return Ok(Vec::new());
        }
        serde_json::from_slice(&bytes).map_err(|e| LedgerError::json(&self.path, e))
    }

    async fn write_records(&self, records: &[FailureRecord]) -> Result<(), LedgerError> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| LedgerError::io(parent, e))?;
        }

        let json = serde_json::to_vec_pretty(records).map_err(|e| LedgerError::json(&self.path, e))?;
        let mut temp_name = self.path.as_os_str().to_owned();
        temp_name.push(TEMP_SUFFIX);
        let temp_path = PathBuf::from(temp_name);

        let mut file = tokio::fs::File::create(&temp_path)
            .await
            .map_err(|e| LedgerError::io(&temp_path, e))?;
        file.write_all(&json)
            .await
            .map_err(|e| LedgerError::io(&temp_path, e))?;
        file.sync_all()
            .await
            .map_err(|e| LedgerError::io(&temp_path, e))?;
        drop(file);

        tokio::fs::rename(&temp_path, &self.path)
            .await
            .map_err(|e| LedgerError::io(&self.path, e))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::Arc;

    use super::*;

    fn record(name: &str) -> FailureRecord {
        FailureRecord::now(name, format!("src-{name}"), "dest", "HTTP 404", ProfileKind::Video)
    }

    #[tokio::test]
    async fn test_missing_ledger_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = FailureLedger::new(dir.path().join("failures.json"));
        assert!(ledger.load_all().await.unwrap().is_empty());
        assert!(ledger.is_empty().await.unwrap());
    }

    #[tokio::test]
    async fn test_append_and_load_preserves_order() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = FailureLedger::new(dir.path().join("state").join("failures.json"));
        ledger.append(record("a")).await.unwrap();
        ledger.append(record("b")).await.unwrap();

        let reopened = FailureLedger::new(ledger.path());
        let records = reopened.load_all().await.unwrap();
        let names: Vec<_> = records.iter().map(|r| r.file_name.as_str()).collect();
        assert_eq!(names, ["a", "b"]);
        assert!(!dir.path().join("state").join("failures.json.tmp").exists());
    }

    #[tokio::test]
    async fn test_concurrent_appends_are_not_lost() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = Arc::new(FailureLedger::new(dir.path().join("failures.json")));
        let mut handles = Vec::new();
        for i in 0..20 {
            let ledger = Arc::clone(&ledger);
            handles.push(tokio::spawn(async move {
                ledger.append(record(&format!("f{i}"))).await.unwrap();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(ledger.len().await.unwrap(), 20);
    }

    #[tokio::test]
    async fn test_replace_and_clear() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = FailureLedger::new(dir.path().join("failures.json"));
        ledger.append(record("a")).await.unwrap();
        ledger.append(record("b")).await.unwrap();

        ledger.replace_all(&[record("c")]).await.unwrap();
        let records = ledger.load_all().await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].file_name, "c");

        ledger.clear().await.unwrap();
        assert!(ledger.load_all().await.unwrap().is_empty());
        ledger.clear().await.unwrap();
    }

    #[tokio::test]
    async fn test_corrupt_ledger_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("failures.json");
        std::fs::write(&path, b"{not json").unwrap();
        let ledger = FailureLedger::new(&path);
        assert!(matches!(
            ledger.load_all().await,
            Err(LedgerError::Json { .. })
        ));
    }

    #[test]
    fn test_record_without_kind_defaults() {
        let json = r#"{"file_name":"a","source_ref":"s","destination":"d","error":"e","timestamp":1}"#;
        let record: FailureRecord = serde_json::from_str(json).unwrap();
        assert_eq!(record.kind, ProfileKind::Video);
    }
}

//! The unit of work flowing through the queue.

use serde::{Deserialize, Serialize};

use crate::browser::ProfileKind;
use crate::ledger::FailureRecord;

/// One asset to discover, transfer and upload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferTask {
    /// Unique identifier (the provider id when known).
    pub id: String,
    /// Page that discovery navigates to.
    pub source_ref: String,
    /// File name at the destination.
    pub display_name: String,
    /// Destination parent identifier.
    pub destination: String,
    /// Folder depth below the walk root.
    pub depth: u32,
    /// Failed runs so far.
    pub attempt_count: u32,
    /// Which profile kind discovers it.
    pub kind: ProfileKind,
}

impl TransferTask {
    /// Creates a task at depth 0 whose id is its source reference.
    #[must_use]
    pub fn new(
        source_ref: impl Into<String>,
        display_name: impl Into<String>,
        destination: impl Into<String>,
        kind: ProfileKind,
    ) -> Self {
        let source_ref = source_ref.into();
        Self {
            id: source_ref.clone(),
            source_ref,
            display_name: display_name.into(),
            destination: destination.into(),
            depth: 0,
            attempt_count: 0,
            kind,
        }
    }

    /// Overrides the identifier.
    #[must_use]
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    /// Sets the folder depth.
    #[must_use]
    pub fn with_depth(mut self, depth: u32) -> Self {
        self.depth = depth;
        self
    }

    /// Key used to drop duplicate submissions: destination plus name.
    #[must_use]
    pub fn dedup_key(&self) -> (String, String) {
        (self.destination.clone(), self.display_name.clone())
    }

    /// Rebuilds a fresh task from a ledger entry.
    #[must_use]
    pub fn from_record(record: &FailureRecord) -> Self {
        Self::new(
            record.source_ref.clone(),
            record.file_name.clone(),
            record.destination.clone(),
            record.kind,
        )
    }

    /// Builds the ledger entry recorded when this task is abandoned.
    #[must_use]
    pub fn failure_record(&self, error: impl Into<String>) -> FailureRecord {
        FailureRecord::now(
            self.display_name.clone(),
            self.source_ref.clone(),
            self.destination.clone(),
            error,
            self.kind,
        )
    }
}

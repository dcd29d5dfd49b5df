//! Destination file assembly with positional writes.

use std::collections::HashSet;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};

use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tracing::debug;

use super::chunk::Chunk;
use super::tier::Tier;
use super::TransferError;

/// An open download: owns the destination handle until [`finish`](Self::finish).
///
/// The file is pre-sized to `total_size` so every chunk can be written at its
/// absolute offset the moment it arrives, in any order.
#[derive(Debug)]
pub struct DownloadSession {
    path: PathBuf,
    file: File,
    total_size: u64,
    chunk_size: u64,
    tier: Tier,
    bytes_written: u64,
    written: HashSet<usize>,
}

impl DownloadSession {
    /// Creates (or truncates) `path` and sizes it to `total_size`.
    ///
    /// # Errors
    ///
    /// Returns [`TransferError::Io`] if the file cannot be created or sized.
    pub async fn create(
        path: &Path,
        total_size: u64,
        chunk_size: u64,
        tier: Tier,
    ) -> Result<Self, TransferError> {
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .await
            .map_err(|e| TransferError::io(path, e))?;
        file.set_len(total_size)
            .await
            .map_err(|e| TransferError::io(path, e))?;

        debug!(path = %path.display(), total_size, chunk_size, %tier, "download session opened");

        Ok(Self {
            path: path.to_path_buf(),
            file,
            total_size,
            chunk_size,
            tier,
            bytes_written: 0,
            written: HashSet::new(),
        })
    }

    /// Writes `bytes` at `chunk.start`.
    ///
    /// A chunk that was already written is ignored.
    ///
    /// # Errors
    ///
    /// Returns [`TransferError::Integrity`] when the bytes do not match the
    /// chunk length or would push the written total past `total_size`, and
    /// [`TransferError::Io`] on seek/write failure.
    pub async fn write_chunk(&mut self, chunk: &Chunk, bytes: &[u8]) -> Result<(), TransferError> {
        if self.written.contains(&chunk.index) {
            return Ok(());
        }

        let len = bytes.len() as u64;
        if len != chunk.len() || self.bytes_written + len > self.total_size {
            return Err(TransferError::integrity(
                &self.path,
                self.total_size,
                self.bytes_written + len,
            ));
        }

        self.file
            .seek(SeekFrom::Start(chunk.start))
            .await
            .map_err(|e| TransferError::io(&self.path, e))?;
        self.file
            .write_all(bytes)
            .await
            .map_err(|e| TransferError::io(&self.path, e))?;

        self.written.insert(chunk.index);
        self.bytes_written += len;
        Ok(())
    }

    /// Flushes, syncs and verifies the assembled file, closing the handle.
    ///
    /// # Errors
    ///
    /// Returns [`TransferError::Integrity`] if fewer than `total_size` bytes
    /// were written or the on-disk length differs.
    pub async fn finish(mut self) -> Result<u64, TransferError> {
        self.file
            .flush()
            .await
            .map_err(|e| TransferError::io(&self.path, e))?;
        self.file
            .sync_all()
            .await
            .map_err(|e| TransferError::io(&self.path, e))?;

        if self.bytes_written != self.total_size {
            return Err(TransferError::integrity(
                &self.path,
                self.total_size,
                self.bytes_written,
            ));
        }

        let on_disk = self
            .file
            .metadata()
            .await
            .map_err(|e| TransferError::io(&self.path, e))?
            .len();
        if on_disk != self.total_size {
            return Err(TransferError::integrity(&self.path, self.total_size, on_disk));
        }

        Ok(self.bytes_written)
    }

    /// Destination path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Total size of the resource.
    #[must_use]
    pub fn total_size(&self) -> u64 {
        self.total_size
    }

    /// Chunk size in use.
    #[must_use]
    pub fn chunk_size(&self) -> u64 {
        self.chunk_size
    }

    /// Tier selected for this download.
    #[must_use]
    pub fn tier(&self) -> Tier {
        self.tier
    }

    /// Bytes written so far.
    #[must_use]
    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }
}

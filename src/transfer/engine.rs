//! Chunked parallel download engine.
//!
//! A download runs in four steps:
//!
//! 1. A fixed-size probe request measures effective throughput.
//! 2. The measured throughput selects a [`Tier`] (chunk size, parallelism).
//! 3. A metadata request reveals the total size, which is partitioned into
//!    [`Chunk`]s.
//! 4. Up to `parallelism` range requests run at once; each chunk is written
//!    at its absolute offset as soon as it arrives.
//!
//! Chunks are scheduled through a sliding window rather than fixed batches:
//! a new range request starts as soon as any in-flight one finishes, so the
//! in-flight bound is the same as batching without waiting on the slowest
//! chunk of each batch.
//!
//! Probe and metadata failures abort immediately. A chunk retries on a
//! linear backoff; a chunk that exhausts its retries aborts the download.
//! Cleaning up the partial destination file is the caller's job (see
//! [`ScopedTempFile`](super::ScopedTempFile)).

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::StreamExt;
use futures_util::stream::FuturesUnordered;
use tracing::{debug, info, instrument, warn};

use super::chunk::{Chunk, ChunkStatus, plan_chunks};
use super::fetcher::{RangeFetcher, RequestHeaders};
use super::progress::{ProgressCallback, ProgressMeter};
use super::session::DownloadSession;
use super::tier::{Tier, throughput};
use super::TransferError;
use crate::retry::{RetryPolicy, with_retry};

/// Size of the throughput probe (1 MiB).
pub const DEFAULT_PROBE_BYTES: u64 = 1024 * 1024;

/// Attempts per chunk, including the first.
pub const DEFAULT_CHUNK_RETRIES: u32 = 3;

/// Linear backoff step between chunk attempts.
const DEFAULT_CHUNK_RETRY_STEP: Duration = Duration::from_secs(1);

/// Downloads a resource with parallel range requests.
///
/// Cheap to share behind an `Arc`; holds no per-download state.
pub struct ChunkedTransferEngine {
    fetcher: Arc<dyn RangeFetcher>,
    chunk_policy: RetryPolicy,
    probe_bytes: u64,
    tier_override: Option<Tier>,
    chunk_size_override: Option<u64>,
}

impl std::fmt::Debug for ChunkedTransferEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChunkedTransferEngine")
            .field("chunk_policy", &self.chunk_policy)
            .field("probe_bytes", &self.probe_bytes)
            .field("tier_override", &self.tier_override)
            .field("chunk_size_override", &self.chunk_size_override)
            .finish_non_exhaustive()
    }
}

impl ChunkedTransferEngine {
    /// Creates an engine with default probe size and chunk retry policy.
    #[must_use]
    pub fn new(fetcher: Arc<dyn RangeFetcher>) -> Self {
        Self {
            fetcher,
            chunk_policy: RetryPolicy::linear(DEFAULT_CHUNK_RETRIES, DEFAULT_CHUNK_RETRY_STEP),
            probe_bytes: DEFAULT_PROBE_BYTES,
            tier_override: None,
            chunk_size_override: None,
        }
    }

    /// Sets the per-chunk attempt ceiling and linear backoff step.
    #[must_use]
    pub fn with_chunk_retries(mut self, attempts: u32, step: Duration) -> Self {
        self.chunk_policy = RetryPolicy::linear(attempts, step);
        self
    }

    /// Sets the probe size in bytes.
    #[must_use]
    pub fn with_probe_bytes(mut self, probe_bytes: u64) -> Self {
        self.probe_bytes = probe_bytes.max(1);
        self
    }

    /// Pins the tier instead of deriving it from the probe.
    ///
    /// The probe request is still issued so unreachable resources fail fast.
    #[must_use]
    pub fn with_tier(mut self, tier: Tier) -> Self {
        self.tier_override = Some(tier);
        self
    }

    /// Pins the chunk size; parallelism still follows the tier.
    #[must_use]
    pub fn with_chunk_size(mut self, chunk_size: u64) -> Self {
        self.chunk_size_override = Some(chunk_size.max(1));
        self
    }

    /// Downloads `url` into `dest` and returns the number of bytes written.
    ///
    /// # Errors
    ///
    /// See [`download_with_progress`](Self::download_with_progress).
    pub async fn download(
        &self,
        url: &str,
        headers: &RequestHeaders,
        dest: &Path,
    ) -> Result<u64, TransferError> {
        self.download_with_progress(url, headers, dest, None).await
    }

    /// Downloads `url` into `dest`, reporting progress after each chunk write.
    ///
    /// # Errors
    ///
    /// - Probe or metadata request failures, unretried.
    /// - [`TransferError::ChunkFailed`] when a chunk exhausts its retries.
    /// - [`TransferError::Io`] / [`TransferError::Integrity`] from file assembly.
    #[instrument(skip(self, headers, progress), fields(url = %url, dest = %dest.display()))]
    pub async fn download_with_progress(
        &self,
        url: &str,
        headers: &RequestHeaders,
        dest: &Path,
        progress: Option<&ProgressCallback>,
    ) -> Result<u64, TransferError> {
        let tier = self.select_tier(url, headers).await?;
        let total_size = self.fetcher.content_length(url, headers).await?;

        let chunk_size = self.chunk_size_override.unwrap_or_else(|| tier.chunk_size());
        let chunks = plan_chunks(total_size, chunk_size);
        info!(
            total_size,
            %tier,
            chunk_size,
            parallelism = tier.parallelism(),
            chunks = chunks.len(),
            "starting chunked download"
        );

        let mut session = DownloadSession::create(dest, total_size, chunk_size, tier).await?;
        let mut meter = ProgressMeter::start();
        let mut pending = chunks.into_iter();
        let mut in_flight = FuturesUnordered::new();

        loop {
            while in_flight.len() < tier.parallelism() {
                match pending.next() {
                    Some(chunk) => in_flight.push(self.fetch_chunk(url, headers, chunk)),
                    None => break,
                }
            }

            let Some(result) = in_flight.next().await else {
                break;
            };
            let (mut chunk, bytes) = result?;
            session.write_chunk(&chunk, &bytes).await?;
            chunk.status = ChunkStatus::Done;
            debug!(chunk = chunk.index, bytes = bytes.len(), "chunk written");

            if let Some(callback) = progress {
                callback(&meter.sample(session.bytes_written(), total_size));
            }
        }

        let written = session.finish().await?;
        info!(
            bytes = written,
            elapsed_ms = meter.elapsed().as_millis(),
            "download complete"
        );
        Ok(written)
    }

    async fn select_tier(&self, url: &str, headers: &RequestHeaders) -> Result<Tier, TransferError> {
        let started = Instant::now();
        let received = self.fetcher.probe(url, headers, self.probe_bytes).await?;
        let rate = throughput(received, started.elapsed());
        let measured = Tier::from_throughput(rate);
        debug!(received, bytes_per_sec = rate, %measured, "throughput probe");
        Ok(self.tier_override.unwrap_or(measured))
    }

    async fn fetch_chunk(
        &self,
        url: &str,
        headers: &RequestHeaders,
        mut chunk: Chunk,
    ) -> Result<(Chunk, Vec<u8>), TransferError> {
        chunk.status = ChunkStatus::InFlight;
        let label = format!("chunk {}", chunk.index);
        let (start, end) = (chunk.start, chunk.end);
        let mut attempts = 0u32;

        let result = with_retry(&self.chunk_policy, &label, |call| {
            attempts = call;
            self.fetcher.fetch_range(url, headers, start, end)
        })
        .await;

        match result {
            Ok(bytes) => Ok((chunk, bytes)),
            Err(error) => {
                chunk.status = ChunkStatus::Failed;
                warn!(chunk = chunk.index, attempts, error = %error, "chunk failed, abandoning download");
                Err(TransferError::ChunkFailed {
                    index: chunk.index,
                    attempts,
                    source: Box::new(error.into_inner()),
                })
            }
        }
    }
}

//! Byte-range chunks: the unit of parallel fetch and retry.

/// Lifecycle of a single chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkStatus {
    /// Not yet requested.
    Pending,
    /// Request outstanding.
    InFlight,
    /// Bytes written at the chunk offset.
    Done,
    /// Retries exhausted.
    Failed,
}

/// A contiguous, inclusive byte range `[start, end]` of a resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    /// Position of the chunk in offset order.
    pub index: usize,
    /// First byte of the range.
    pub start: u64,
    /// Last byte of the range (inclusive).
    pub end: u64,
    /// Current status.
    pub status: ChunkStatus,
}

impl Chunk {
    /// Number of bytes covered by the chunk.
    #[must_use]
    pub fn len(&self) -> u64 {
        self.end - self.start + 1
    }

    /// Chunks always cover at least one byte.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        false
    }

    /// Value for the HTTP `Range` header.
    #[must_use]
    pub fn range_header(&self) -> String {
        format!("bytes={}-{}", self.start, self.end)
    }
}

/// Partitions `[0, total_size)` into chunks of `chunk_size` bytes.
///
/// The final chunk may be shorter. A zero total size yields no chunks.
///
/// # Examples
///
/// ```
/// use asset_relay::transfer::plan_chunks;
///
/// let chunks = plan_chunks(25, 10);
/// assert_eq!(chunks.len(), 3);
/// assert_eq!((chunks[2].start, chunks[2].end), (20, 24));
/// ```
#[must_use]
pub fn plan_chunks(total_size: u64, chunk_size: u64) -> Vec<Chunk> {
    let chunk_size = chunk_size.max(1);
    let mut chunks = Vec::new();
    let mut start = 0u64;
    while start < total_size {
        let end = (start + chunk_size).min(total_size) - 1;
        chunks.push(Chunk {
            index: chunks.len(),
            start,
            end,
            status: ChunkStatus::Pending,
        });
        start = end + 1;
    }
    chunks
}

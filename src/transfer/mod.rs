//! Chunked parallel transfer of large resources.
//!
//! [`ChunkedTransferEngine`] probes throughput, picks a [`Tier`], fetches
//! byte ranges concurrently through a [`RangeFetcher`] and assembles them
//! positionally in a [`DownloadSession`].

mod chunk;
mod engine;
mod error;
mod fetcher;
mod progress;
mod session;
mod temp;
mod tier;

pub use chunk::{Chunk, ChunkStatus, plan_chunks};
pub use engine::{ChunkedTransferEngine, DEFAULT_CHUNK_RETRIES, DEFAULT_PROBE_BYTES};
pub use error::TransferError;
pub use fetcher::{
    CONNECT_TIMEOUT_SECS, HttpRangeFetcher, READ_TIMEOUT_SECS, RangeFetcher, RequestHeaders,
};
pub use progress::{ProgressCallback, TransferProgress};
pub use session::DownloadSession;
pub use temp::ScopedTempFile;
pub use tier::{Tier, throughput};

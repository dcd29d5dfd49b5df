//! Asset Relay Library
//!
//! Discovers directly fetchable locators for restricted assets through a pool
//! of automation instances, downloads them with parallel range requests, and
//! re-uploads them to a destination storage backend under bounded
//! concurrency, retry and rate-limit policies.
//!
//! # Architecture
//!
//! - [`browser`] - Automation-instance pool and resource discovery
//! - [`transfer`] - Chunked parallel download engine
//! - [`retry`] - Backoff policies and the retry runner
//! - [`queue`] - Two-tier bounded-concurrency task scheduler
//! - [`upload`] - Upload batch throttling
//! - [`ledger`] - Durable record of abandoned tasks
//! - [`events`] - Per-task process log
//! - [`remote`] - Remote storage collaborator and tree walk
//! - [`pipeline`] - The facade tying them together
//! - [`config`] / [`logging`] - Ambient setup

// Clippy lints - strict for library code
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod browser;
pub mod config;
pub mod events;
pub mod ledger;
pub mod logging;
pub mod pipeline;
pub mod queue;
pub mod remote;
pub mod retry;
pub mod transfer;
pub mod upload;

// Re-export commonly used types
pub use browser::{
    AutomationEngine, BrowserInstance, BrowserPage, BrowserPool, BrowserProfile,
    DiscoveredResource, InterceptedRequest, LifecycleState, ProfileKind,
};
pub use config::{ConfigError, RelayConfig};
pub use ledger::{FailureLedger, FailureRecord, LedgerError};
pub use pipeline::{Pipeline, PipelineError};
pub use queue::{QueueStats, TaskError, TaskProcessor, TransferQueue, TransferTask};
pub use remote::{RemoteEntry, RemoteStorage, StorageError};
pub use retry::{FailureType, QuotaBackoff, RetryDecision, RetryError, RetryPolicy, with_retry};
pub use transfer::{
    ChunkedTransferEngine, HttpRangeFetcher, RangeFetcher, RequestHeaders, Tier, TransferError,
    TransferProgress,
};
pub use upload::UploadBatcher;

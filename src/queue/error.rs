//! Error type for a single run of a task.

use thiserror::Error;

use crate::browser::{DiscoveryError, PoolError};
use crate::remote::StorageError;
use crate::retry::{FailureType, Retryable};
use crate::transfer::TransferError;

/// Why a run of a task failed.
///
/// Stage-local retries have already been spent when one of these reaches
/// the queue; the queue only decides between requeue and the ledger.
#[derive(Debug, Error)]
pub enum TaskError {
    /// No instance could be leased.
    #[error(transparent)]
    Pool(#[from] PoolError),

    /// Discovery did not produce a locator.
    #[error(transparent)]
    Discovery(#[from] DiscoveryError),

    /// The download failed.
    #[error(transparent)]
    Transfer(#[from] TransferError),

    /// A destination storage call failed.
    #[error(transparent)]
    Storage(#[from] StorageError),

    /// The queue's slot semaphores were closed.
    #[error("queue slots closed")]
    SlotsClosed,
}

impl Retryable for TaskError {
    fn failure_type(&self) -> FailureType {
        match self {
            Self::Pool(e) => e.failure_type(),
            Self::Discovery(e) => e.failure_type(),
            Self::Transfer(e) => e.failure_type(),
            Self::Storage(e) => e.failure_type(),
            Self::SlotsClosed => FailureType::Permanent,
        }
    }
}

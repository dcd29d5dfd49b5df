//! Two-tier bounded-concurrency task scheduler.
//!
//! [`TransferQueue`] runs every task through two phases, each bounded by its
//! own semaphore:
//!
//! - discovery holds one `chrome_slots` permit and releases it as soon as a
//!   locator is extracted;
//! - transfer holds one `transfer_slots` permit for the whole
//!   download-and-upload.
//!
//! A slow upload therefore never starves discovery for other tasks, and
//! vice versa. The phases themselves are supplied by a [`TaskProcessor`].
//!
//! # Failure handling
//!
//! Stage-local retries happen inside the processor. When a run still fails,
//! the queue requeues the task with `attempt_count + 1` while it is under the
//! retry ceiling and the failure is not permanent; otherwise the task is
//! written to the [`FailureLedger`] and dropped. Individual failures never
//! stop the run.

mod error;
mod task;

pub use error::TaskError;
pub use task::TransferTask;

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use dashmap::DashSet;
use tokio::sync::{Notify, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, info, instrument, warn};

use crate::ledger::{FailureLedger, FailureRecord};
use crate::retry::{FailureType, Retryable};

/// Default number of requeues before a task is ledgered.
pub const DEFAULT_RETRY_CEILING: u32 = 2;

/// The per-phase work a queue drives.
///
/// # Object Safety
///
/// Uses `async_trait`; implementations are shared across workers behind an
/// `Arc`.
#[async_trait]
pub trait TaskProcessor: Send + Sync + 'static {
    /// What discovery hands to the transfer phase.
    type Discovered: Send + 'static;

    /// Returns true when the task is already done and should be skipped.
    async fn precheck(&self, _task: &TransferTask) -> Result<bool, TaskError> {
        Ok(false)
    }

    /// Discovery phase; runs while holding a chrome slot.
    async fn discover(&self, task: &TransferTask) -> Result<Self::Discovered, TaskError>;

    /// Transfer phase; runs while holding a transfer slot.
    async fn transfer(
        &self,
        task: &TransferTask,
        discovered: Self::Discovered,
    ) -> Result<(), TaskError>;

    /// Called after every failed run, before the requeue-or-ledger decision.
    async fn on_run_failed(&self, _task: &TransferTask, _error: &TaskError) {}

    /// Called once a task has been written to the ledger.
    async fn on_abandoned(&self, _task: &TransferTask, _record: &FailureRecord) {}
}

/// Counters for one [`TransferQueue::run_to_completion`] call.
///
/// Uses atomic counters for updates from concurrent workers.
#[derive(Debug, Default)]
pub struct QueueStats {
    completed: AtomicUsize,
    failed: AtomicUsize,
    retried: AtomicUsize,
    skipped: AtomicUsize,
}

impl QueueStats {
    /// Creates a stats tracker with zero counts.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Tasks that finished transfer and upload.
    #[must_use]
    pub fn completed(&self) -> usize {
        self.completed.load(Ordering::SeqCst)
    }

    /// Tasks written to the ledger.
    #[must_use]
    pub fn failed(&self) -> usize {
        self.failed.load(Ordering::SeqCst)
    }

    /// Requeues performed.
    #[must_use]
    pub fn retried(&self) -> usize {
        self.retried.load(Ordering::SeqCst)
    }

    /// Tasks skipped because the destination already had them.
    #[must_use]
    pub fn skipped(&self) -> usize {
        self.skipped.load(Ordering::SeqCst)
    }

    /// Tasks that reached a terminal state.
    #[must_use]
    pub fn total(&self) -> usize {
        self.completed() + self.failed() + self.skipped()
    }

    fn increment_completed(&self) {
        self.completed.fetch_add(1, Ordering::SeqCst);
    }

    fn increment_failed(&self) {
        self.failed.fetch_add(1, Ordering::SeqCst);
    }

    fn increment_retried(&self) {
        self.retried.fetch_add(1, Ordering::SeqCst);
    }

    fn increment_skipped(&self) {
        self.skipped.fetch_add(1, Ordering::SeqCst);
    }
}

enum RunOutcome {
    Completed,
    Skipped,
}

/// Two-tier bounded-concurrency scheduler with deduplication.
#[derive(Debug)]
pub struct TransferQueue {
    pending: Mutex<VecDeque<TransferTask>>,
    keys: DashSet<(String, String)>,
    chrome_slots: Semaphore,
    transfer_slots: Semaphore,
    chrome_limit: usize,
    transfer_limit: usize,
    retry_ceiling: u32,
    ledger: Arc<FailureLedger>,
    wake: Notify,
}

impl TransferQueue {
    /// Creates a queue. Slot counts below one are raised to one.
    #[must_use]
    pub fn new(
        chrome_slots: usize,
        transfer_slots: usize,
        retry_ceiling: u32,
        ledger: Arc<FailureLedger>,
    ) -> Self {
        let chrome_limit = chrome_slots.max(1);
        let transfer_limit = transfer_slots.max(1);
        debug!(chrome_limit, transfer_limit, retry_ceiling, "creating transfer queue");
        Self {
            pending: Mutex::new(VecDeque::new()),
            keys: DashSet::new(),
            chrome_slots: Semaphore::new(chrome_limit),
            transfer_slots: Semaphore::new(transfer_limit),
            chrome_limit,
            transfer_limit,
            retry_ceiling,
            ledger,
            wake: Notify::new(),
        }
    }

    /// Adds a task. Returns false if a task with the same destination and
    /// display name is already queued or running.
    pub fn enqueue(&self, task: TransferTask) -> bool {
        if !self.keys.insert(task.dedup_key()) {
            debug!(task_id = %task.id, name = %task.display_name, "duplicate task dropped");
            return false;
        }
        debug!(task_id = %task.id, name = %task.display_name, "task enqueued");
        self.lock_pending().push_back(task);
        self.wake.notify_one();
        true
    }

    /// Tasks waiting to start.
    #[must_use]
    pub fn pending_len(&self) -> usize {
        self.lock_pending().len()
    }

    /// Tasks queued or running.
    #[must_use]
    pub fn tracked_len(&self) -> usize {
        self.keys.len()
    }

    /// Discovery slots currently held.
    #[must_use]
    pub fn chrome_in_use(&self) -> usize {
        self.chrome_limit - self.chrome_slots.available_permits()
    }

    /// Transfer slots currently held.
    #[must_use]
    pub fn transfers_in_use(&self) -> usize {
        self.transfer_limit - self.transfer_slots.available_permits()
    }

    /// The ledger abandoned tasks are written to.
    #[must_use]
    pub fn ledger(&self) -> &Arc<FailureLedger> {
        &self.ledger
    }

    /// Runs until no task is pending or in flight, including requeues and
    /// tasks enqueued while running.
    #[instrument(skip_all, fields(chrome_slots = self.chrome_limit, transfer_slots = self.transfer_limit))]
    pub async fn run_to_completion<P: TaskProcessor>(
        self: &Arc<Self>,
        processor: Arc<P>,
    ) -> Arc<QueueStats> {
        let stats = Arc::new(QueueStats::new());
        let mut workers = JoinSet::new();

        info!(pending = self.pending_len(), "starting queue processing");

        loop {
            while let Some(task) = self.pop() {
                let queue = Arc::clone(self);
                let processor = Arc::clone(&processor);
                let stats = Arc::clone(&stats);
                workers.spawn(async move { queue.run_task(&*processor, &stats, task).await });
            }

            if workers.is_empty() {
                break;
            }

            tokio::select! {
                joined = workers.join_next() => {
                    if let Some(Err(e)) = joined {
                        warn!(error = %e, "queue worker panicked");
                    }
                }
                () = self.wake.notified() => {}
            }
        }

        info!(
            completed = stats.completed(),
            failed = stats.failed(),
            retried = stats.retried(),
            skipped = stats.skipped(),
            "queue processing complete"
        );
        stats
    }

    fn pop(&self) -> Option<TransferTask> {
        self.lock_pending().pop_front()
    }

    fn lock_pending(&self) -> MutexGuard<'_, VecDeque<TransferTask>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn run_task<P: TaskProcessor>(&self, processor: &P, stats: &QueueStats, task: TransferTask) {
        match self.run_once(processor, &task).await {
            Ok(RunOutcome::Completed) => {
                stats.increment_completed();
                self.keys.remove(&task.dedup_key());
            }
            Ok(RunOutcome::Skipped) => {
                info!(task_id = %task.id, name = %task.display_name, "already at destination, skipped");
                stats.increment_skipped();
                self.keys.remove(&task.dedup_key());
            }
            Err(error) => self.handle_failure(processor, stats, task, error).await,
        }
    }

    async fn run_once<P: TaskProcessor>(
        &self,
        processor: &P,
        task: &TransferTask,
    ) -> Result<RunOutcome, TaskError> {
        if processor.precheck(task).await? {
            return Ok(RunOutcome::Skipped);
        }

        let discovered = {
            let _slot = self
                .chrome_slots
                .acquire()
                .await
                .map_err(|_| TaskError::SlotsClosed)?;
            debug!(task_id = %task.id, "discovery slot acquired");
            processor.discover(task).await?
        };

        let _slot = self
            .transfer_slots
            .acquire()
            .await
            .map_err(|_| TaskError::SlotsClosed)?;
        debug!(task_id = %task.id, "transfer slot acquired");
        processor.transfer(task, discovered).await?;
        Ok(RunOutcome::Completed)
    }

    async fn handle_failure<P: TaskProcessor>(
        &self,
        processor: &P,
        stats: &QueueStats,
        mut task: TransferTask,
        error: TaskError,
    ) {
        processor.on_run_failed(&task, &error).await;

        let failure_type = error.failure_type();
        if failure_type != FailureType::Permanent && task.attempt_count < self.retry_ceiling {
            task.attempt_count += 1;
            stats.increment_retried();
            warn!(
                task_id = %task.id,
                attempt = task.attempt_count,
                retry_ceiling = self.retry_ceiling,
                error = %error,
                "task failed, requeueing"
            );
            self.lock_pending().push_back(task);
            self.wake.notify_one();
            return;
        }

        warn!(
            task_id = %task.id,
            name = %task.display_name,
            attempts = task.attempt_count + 1,
            ?failure_type,
            error = %error,
            "task abandoned"
        );
        let record = task.failure_record(error.to_string());
        // Best-effort: a ledger write failure is logged, not propagated
        if let Err(e) = self.ledger.append(record.clone()).await {
            warn!(task_id = %task.id, error = %e, "failed to write failure ledger");
        }
        stats.increment_failed();
        self.keys.remove(&task.dedup_key());
        processor.on_abandoned(&task, &record).await;
    }
}

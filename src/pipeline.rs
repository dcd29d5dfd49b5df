//! The relay pipeline: discovery, chunked download and upload wired onto a
//! [`TransferQueue`].
//!
//! [`Pipeline`] is the surface callers use. It owns one [`BrowserPool`] per
//! [`ProfileKind`], the [`ChunkedTransferEngine`], the [`UploadBatcher`], the
//! [`FailureLedger`] and the [`EventLog`], and drives them through a private
//! [`TaskProcessor`]:
//!
//! 1. precheck: skip if the destination already has a same-named file;
//! 2. discover: lease a profile instance and intercept the resource locator;
//! 3. transfer: download into a scoped temp file, wait out any batch pause,
//!    upload, account the success.
//!
//! Every remote-storage call is wrapped in a [`RetryPolicy`].

use std::collections::HashSet;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::browser::{
    AutomationEngine, BrowserPool, DiscoveredResource, PoolError, ProfileKind, discover,
};
use crate::config::{ConfigError, RelayConfig};
use crate::events::{EventLog, TaskEvent, TaskEventKind};
use crate::ledger::{FailureLedger, FailureRecord, LedgerError};
use crate::queue::{QueueStats, TaskError, TaskProcessor, TransferQueue, TransferTask};
use crate::remote::{RemoteEntry, RemoteStorage, StorageError, discover_tasks};
use crate::retry::{FailureType, RetryError, RetryPolicy, Retryable, with_retry};
use crate::transfer::{
    ChunkedTransferEngine, ProgressCallback, RangeFetcher, ScopedTempFile, TransferProgress,
};
use crate::upload::UploadBatcher;

/// Warning threshold for cumulative provider quota delay (30 seconds).
const CUMULATIVE_QUOTA_WARNING_THRESHOLD: Duration = Duration::from_secs(30);

/// Backoff step between chunk attempts.
const CHUNK_RETRY_STEP: Duration = Duration::from_secs(1);

/// Discovery attempts per run, including the first.
const DISCOVERY_ATTEMPTS: u32 = 2;

/// Per-task progress observer: receives the task id and a progress sample.
pub type TaskProgressCallback = Arc<dyn Fn(&str, &TransferProgress) + Send + Sync>;

/// Observer for tasks written to the failure ledger.
pub type FailureCallback = Arc<dyn Fn(&FailureRecord) + Send + Sync>;

/// Errors building a [`Pipeline`].
#[derive(Debug, Error)]
pub enum PipelineError {
    /// Configuration rejected.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// A browser pool could not be provisioned.
    #[error(transparent)]
    Pool(#[from] PoolError),

    /// A working directory could not be created.
    #[error("failed to create directory {path}: {source}")]
    Io {
        /// Directory that failed.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },
}

/// Discover, transfer and upload pipeline.
pub struct Pipeline {
    queue: Arc<TransferQueue>,
    relay: Arc<Relay>,
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("queue", &self.queue)
            .finish_non_exhaustive()
    }
}

impl Pipeline {
    /// Builds a pipeline from validated configuration and its collaborators.
    ///
    /// Provisions the profile working directories and the temp directory.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError`] on invalid configuration or when a
    /// directory cannot be created.
    #[instrument(skip_all)]
    pub async fn new(
        config: RelayConfig,
        storage: Arc<dyn RemoteStorage>,
        automation: Arc<dyn AutomationEngine>,
        fetcher: Arc<dyn RangeFetcher>,
    ) -> Result<Self, PipelineError> {
        config.validate()?;

        tokio::fs::create_dir_all(&config.temp_dir)
            .await
            .map_err(|source| PipelineError::Io {
                path: config.temp_dir.clone(),
                source,
            })?;

        let launch_policy =
            RetryPolicy::fixed(config.launch_retries, config.launch_retry_delay());
        let video_pool = BrowserPool::new(
            Arc::clone(&automation),
            ProfileKind::Video,
            &config.profiles_dir,
            config.max_profiles,
            launch_policy.clone(),
        )
        .await?;
        let document_pool = BrowserPool::new(
            automation,
            ProfileKind::Document,
            &config.profiles_dir,
            config.max_profiles,
            launch_policy,
        )
        .await?;

        let engine = ChunkedTransferEngine::new(fetcher)
            .with_chunk_retries(config.chunk_retries, CHUNK_RETRY_STEP)
            .with_probe_bytes(config.probe_bytes);

        let ledger = Arc::new(FailureLedger::new(&config.ledger_path));
        let queue = Arc::new(TransferQueue::new(
            config.chrome_slots(),
            config.transfer_slots,
            config.retry_ceiling,
            Arc::clone(&ledger),
        ));

        info!(
            max_profiles = config.max_profiles,
            chrome_slots = config.chrome_slots(),
            transfer_slots = config.transfer_slots,
            retry_ceiling = config.retry_ceiling,
            "pipeline ready"
        );

        let relay = Relay {
            storage,
            video_pool,
            document_pool,
            engine,
            batcher: UploadBatcher::new(config.upload_batch_size, config.upload_pause()),
            events: EventLog::new(&config.event_log_path),
            temp_dir: config.temp_dir.clone(),
            discovery_timeout: config.discovery_timeout(),
            request_policy: RetryPolicy::default(),
            discovery_policy: RetryPolicy::linear(DISCOVERY_ATTEMPTS, Duration::from_secs(1)),
            progress: RwLock::new(None),
            failure: RwLock::new(None),
            quota_delay_ms: AtomicU64::new(0),
            temp_seq: AtomicU64::new(0),
        };

        Ok(Self {
            queue,
            relay: Arc::new(relay),
        })
    }

    /// Queues a task. Returns false when an equivalent task is already queued.
    pub fn submit(&self, task: TransferTask) -> bool {
        self.queue.enqueue(task)
    }

    /// Walks `root_id` and queues every supported file, mirroring folders
    /// under `destination_id`. Returns how many tasks were queued.
    ///
    /// # Errors
    ///
    /// Storage errors from listing or folder creation that outlast the
    /// request retry policy.
    pub async fn submit_tree(
        &self,
        root_id: &str,
        destination_id: &str,
    ) -> Result<usize, StorageError> {
        let tasks = discover_tasks(
            self.relay.storage.as_ref(),
            &self.relay.request_policy,
            root_id,
            destination_id,
        )
        .await?;
        let mut queued = 0;
        for task in tasks {
            if self.submit(task) {
                queued += 1;
            }
        }
        Ok(queued)
    }

    /// Registers the progress observer, replacing any previous one.
    pub fn on_progress<F>(&self, callback: F)
    where
        F: Fn(&str, &TransferProgress) + Send + Sync + 'static,
    {
        *self
            .relay
            .progress
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(Arc::new(callback));
    }

    /// Registers the observer for ledgered tasks, replacing any previous one.
    pub fn on_failure<F>(&self, callback: F)
    where
        F: Fn(&FailureRecord) + Send + Sync + 'static,
    {
        *self
            .relay
            .failure
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(Arc::new(callback));
    }

    /// Processes queued tasks until none remain.
    pub async fn run(&self) -> Arc<QueueStats> {
        self.queue
            .run_to_completion(Arc::clone(&self.relay))
            .await
    }

    /// Returns every ledgered failure and clears the ledger.
    ///
    /// # Errors
    ///
    /// Ledger read or removal failures.
    pub async fn drain_failure_ledger(&self) -> Result<Vec<FailureRecord>, LedgerError> {
        let ledger = self.queue.ledger();
        let records = ledger.load_all().await?;
        ledger.clear().await?;
        info!(records = records.len(), "failure ledger drained");
        Ok(records)
    }

    /// Re-runs every ledgered task.
    ///
    /// The ledger keeps its entries while the re-run is in progress. At the
    /// end it holds only the records that failed again, and is removed if
    /// every task succeeded. Records sharing a destination and name are
    /// re-run once.
    ///
    /// # Errors
    ///
    /// Ledger read or write failures.
    #[instrument(skip(self))]
    pub async fn retry_failed(&self) -> Result<Arc<QueueStats>, LedgerError> {
        let ledger = Arc::clone(self.queue.ledger());
        let snapshot = ledger.load_all().await?;
        if snapshot.is_empty() {
            info!("failure ledger is empty, nothing to retry");
            return Ok(Arc::new(QueueStats::new()));
        }

        // One run per destination and name; a task already queued by a
        // caller ledgers itself again if it fails.
        let mut seen = HashSet::new();
        let mut requeued = 0usize;
        for record in &snapshot {
            let task = TransferTask::from_record(record);
            if seen.insert(task.dedup_key()) && self.submit(task) {
                requeued += 1;
            }
        }
        info!(
            requeued,
            not_requeued = snapshot.len() - requeued,
            "retrying ledgered tasks"
        );

        let stats = self.run().await;

        let after = ledger.load_all().await?;
        let remaining: Vec<_> = after.into_iter().skip(snapshot.len()).collect();
        ledger.replace_all(&remaining).await?;

        info!(
            recovered = stats.completed() + stats.skipped(),
            still_failing = remaining.len(),
            "retry of ledgered tasks complete"
        );
        Ok(stats)
    }

    /// Hard-terminates every browser instance in both pools.
    pub async fn kill_browsers(&self) {
        self.relay.video_pool.kill_all().await;
        self.relay.document_pool.kill_all().await;
    }

    /// The scheduler.
    #[must_use]
    pub fn queue(&self) -> &Arc<TransferQueue> {
        &self.queue
    }

    /// The failure ledger.
    #[must_use]
    pub fn ledger(&self) -> &Arc<FailureLedger> {
        self.queue.ledger()
    }

    /// The upload batcher.
    #[must_use]
    pub fn batcher(&self) -> &UploadBatcher {
        &self.relay.batcher
    }

    /// The process event log.
    #[must_use]
    pub fn events(&self) -> &EventLog {
        &self.relay.events
    }

    /// Pool serving `kind`.
    #[must_use]
    pub fn pool(&self, kind: ProfileKind) -> &BrowserPool {
        self.relay.pool(kind)
    }

    /// Total time spent waiting on provider quota backoff.
    #[must_use]
    pub fn quota_delay(&self) -> Duration {
        Duration::from_millis(self.relay.quota_delay_ms.load(Ordering::SeqCst))
    }
}

/// The per-task stages.
struct Relay {
    storage: Arc<dyn RemoteStorage>,
    video_pool: BrowserPool,
    document_pool: BrowserPool,
    engine: ChunkedTransferEngine,
    batcher: UploadBatcher,
    events: EventLog,
    temp_dir: PathBuf,
    discovery_timeout: Duration,
    request_policy: RetryPolicy,
    discovery_policy: RetryPolicy,
    progress: RwLock<Option<TaskProgressCallback>>,
    failure: RwLock<Option<FailureCallback>>,
    quota_delay_ms: AtomicU64,
    temp_seq: AtomicU64,
}

impl Relay {
    fn pool(&self, kind: ProfileKind) -> &BrowserPool {
        match kind {
            ProfileKind::Video => &self.video_pool,
            ProfileKind::Document => &self.document_pool,
        }
    }

    /// Reserves a temp file no other run of this process shares.
    fn temp_file(&self, task: &TransferTask) -> ScopedTempFile {
        let seq = self.temp_seq.fetch_add(1, Ordering::Relaxed);
        let token = format!("{}-{seq}", std::process::id());
        ScopedTempFile::new(&self.temp_dir, &token, &task.display_name)
    }

    async fn record(&self, task: &TransferTask, event: TaskEventKind, detail: Option<String>) {
        self.events
            .record(&TaskEvent::now(&task.id, &task.display_name, event, detail))
            .await;
    }

    fn progress_for(&self, task: &TransferTask) -> Option<ProgressCallback> {
        let callback = self
            .progress
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()?;
        let task_id = task.id.clone();
        Some(Arc::new(move |progress: &TransferProgress| {
            callback(&task_id, progress);
        }))
    }

    /// Adds a completed quota wait to the running total.
    #[allow(clippy::cast_possible_truncation)]
    fn add_quota_delay(&self, delay: Duration) {
        let delay_ms = delay.as_millis() as u64;
        let total = Duration::from_millis(
            self.quota_delay_ms.fetch_add(delay_ms, Ordering::SeqCst) + delay_ms,
        );
        debug!(delay_ms, cumulative_ms = total.as_millis(), "quota wait finished");
        if total >= CUMULATIVE_QUOTA_WARNING_THRESHOLD {
            warn!(
                cumulative_delay_secs = total.as_secs(),
                "excessive provider quota backoff - consider lowering transfer_slots or enabling upload batching"
            );
        }
    }

    /// Runs a storage call under the request policy, accounting quota waits.
    async fn storage_call<T, F, Fut>(
        &self,
        label: &str,
        mut operation: F,
    ) -> Result<T, RetryError<StorageError>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, StorageError>>,
    {
        let quota_hit: Mutex<Option<Instant>> = Mutex::new(None);
        let quota_hit = &quota_hit;

        with_retry(&self.request_policy, label, |_| {
            let previous = quota_hit
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take();
            if let Some(at) = previous {
                self.add_quota_delay(at.elapsed());
            }
            let call = operation();
            async move {
                let result = call.await;
                if let Err(e) = &result
                    && e.failure_type() == FailureType::RateLimited
                {
                    *quota_hit.lock().unwrap_or_else(PoisonError::into_inner) =
                        Some(Instant::now());
                }
                result
            }
        })
        .await
    }

    /// Uploads `path`, refreshing credentials once if they expired.
    async fn upload(&self, task: &TransferTask, path: &Path) -> Result<RemoteEntry, StorageError> {
        let mime_type = task.kind.upload_mime_type();
        let mut refreshed = false;
        loop {
            let result = self
                .storage_call("upload", || {
                    self.storage
                        .upload_file(&task.destination, &task.display_name, path, mime_type)
                })
                .await;
            match result {
                Ok(entry) => return Ok(entry),
                Err(RetryError::NotRetryable {
                    failure_type: FailureType::NeedsAuth,
                    ..
                }) if !refreshed => {
                    warn!(task_id = %task.id, "upload credentials expired, refreshing");
                    refreshed = true;
                    self.storage.refresh_auth().await?;
                }
                Err(e) => return Err(e.into_inner()),
            }
        }
    }
}

#[async_trait]
impl TaskProcessor for Relay {
    type Discovered = DiscoveredResource;

    async fn precheck(&self, task: &TransferTask) -> Result<bool, TaskError> {
        self.record(task, TaskEventKind::Started, None).await;
        let exists = self
            .storage_call("existence check", || {
                self.storage.file_exists(&task.destination, &task.display_name)
            })
            .await
            .map_err(RetryError::into_inner)?;
        if exists {
            self.record(task, TaskEventKind::Skipped, None).await;
        }
        Ok(exists)
    }

    async fn discover(&self, task: &TransferTask) -> Result<DiscoveredResource, TaskError> {
        let pool = self.pool(task.kind);
        let timeout = self.discovery_timeout;
        let found = with_retry(&self.discovery_policy, "discovery", |_| async move {
            let lease = pool.acquire(None).await?;
            debug!(task_id = %task.id, profile_id = lease.profile_id(), "profile leased");
            let found = discover(lease.instance().as_ref(), &task.source_ref, task.kind, timeout)
                .await?;
            Ok::<_, TaskError>(found)
        })
        .await
        .map_err(RetryError::into_inner)?;

        debug!(task_id = %task.id, url = %found.url, "locator discovered");
        Ok(found)
    }

    async fn transfer(&self, task: &TransferTask, found: DiscoveredResource) -> Result<(), TaskError> {
        let temp = self.temp_file(task);
        debug!(task_id = %task.id, path = %temp.path().display(), "downloading to temp file");
        let progress = self.progress_for(task);

        let bytes = self
            .engine
            .download_with_progress(&found.url, &found.headers, temp.path(), progress.as_ref())
            .await?;
        self.record(task, TaskEventKind::Downloaded, Some(format!("{bytes} bytes")))
            .await;

        self.batcher.wait_ready().await;
        let entry = self.upload(task, temp.path()).await?;
        self.batcher.record_success();

        info!(task_id = %task.id, name = %task.display_name, bytes, remote_id = %entry.id, "uploaded");
        self.record(task, TaskEventKind::Uploaded, Some(entry.id)).await;
        Ok(())
    }

    async fn on_run_failed(&self, task: &TransferTask, error: &TaskError) {
        self.record(task, TaskEventKind::Error, Some(error.to_string()))
            .await;
    }

    async fn on_abandoned(&self, _task: &TransferTask, record: &FailureRecord) {
        let callback = self
            .failure
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if let Some(callback) = callback {
            callback(record);
        }
    }
}

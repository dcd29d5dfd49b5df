//! Throughput throttle for destination uploads.
//!
//! After every `batch_size` successful uploads the [`UploadBatcher`] holds
//! back all subsequent upload starts for `pause`. This is a deliberate
//! throttle, independent of the quota backoff in [`crate::retry`]; both can
//! be active at once.
//!
//! # Example
//!
//! ```
//! use std::time::Duration;
//! use asset_relay::upload::UploadBatcher;
//!
//! # async fn example() {
//! let batcher = UploadBatcher::new(5, Duration::from_secs(60));
//! batcher.wait_ready().await;
//! // ... upload ...
//! batcher.record_success();
//! # }
//! ```

use std::sync::Mutex;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

/// Default number of uploads per batch.
pub const DEFAULT_BATCH_SIZE: usize = 5;

/// Warning threshold for cumulative batch pauses (30 seconds).
const CUMULATIVE_PAUSE_WARNING_THRESHOLD: Duration = Duration::from_secs(30);

#[derive(Debug, Default)]
struct BatchState {
    count: usize,
    resume_at: Option<Instant>,
    pauses: usize,
    cumulative_pause: Duration,
}

/// Counts successful uploads and enforces a pause after each full batch.
///
/// Designed to be shared behind an `Arc`. The internal lock is never held
/// across an await.
#[derive(Debug)]
pub struct UploadBatcher {
    batch_size: usize,
    pause: Duration,
    state: Mutex<BatchState>,
}

impl Default for UploadBatcher {
    fn default() -> Self {
        Self::new(DEFAULT_BATCH_SIZE, Duration::ZERO)
    }
}

impl UploadBatcher {
    /// Creates a batcher. A zero `pause` disables throttling.
    #[must_use]
    pub fn new(batch_size: usize, pause: Duration) -> Self {
        Self {
            batch_size: batch_size.max(1),
            pause,
            state: Mutex::new(BatchState::default()),
        }
    }

    /// Returns true when throttling is disabled.
    #[must_use]
    pub fn is_disabled(&self) -> bool {
        self.pause.is_zero()
    }

    /// Configured batch size.
    #[must_use]
    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Records one successful upload, starting a pause when a batch completes.
    #[instrument(level = "debug", skip(self))]
    pub fn record_success(&self) {
        let mut state = self.lock_state();
        state.count += 1;
        if state.count < self.batch_size {
            debug!(count = state.count, batch_size = self.batch_size, "upload counted");
            return;
        }

        state.count = 0;
        if self.is_disabled() {
            return;
        }

        state.resume_at = Some(Instant::now() + self.pause);
        state.pauses += 1;
        state.cumulative_pause += self.pause;
        info!(
            pause_secs = self.pause.as_secs(),
            batch_size = self.batch_size,
            "upload batch complete, pausing"
        );
        if state.cumulative_pause >= CUMULATIVE_PAUSE_WARNING_THRESHOLD {
            warn!(
                cumulative_pause_secs = state.cumulative_pause.as_secs(),
                "excessive upload throttling"
            );
        }
    }

    /// Waits until any active batch pause has elapsed.
    pub async fn wait_ready(&self) {
        loop {
            let resume_at = self.lock_state().resume_at;
            match resume_at {
                Some(at) if at > Instant::now() => {
                    debug!(wait_ms = (at - Instant::now()).as_millis(), "waiting for batch pause");
                    tokio::time::sleep_until(at).await;
                }
                _ => return,
            }
        }
    }

    /// Returns true while a pause is in effect.
    #[must_use]
    pub fn is_paused(&self) -> bool {
        self.lock_state()
            .resume_at
            .is_some_and(|at| at > Instant::now())
    }

    /// Number of pauses started so far.
    #[must_use]
    pub fn pauses_triggered(&self) -> usize {
        self.lock_state().pauses
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, BatchState> {
        // The state is plain counters; a poisoned lock still holds usable data.
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

//! Fixed-size pool of automation-instance profiles.
//!
//! # Concurrency Model
//!
//! - Each profile slot has an async launch gate. An `acquire` holds the gate
//!   while it health-checks or launches, so concurrent acquires of the same
//!   profile queue behind the first and then reuse its instance.
//! - Slot bookkeeping (instance, lifecycle, lease count) sits behind a
//!   short-lived sync lock that is never held across an await.
//! - Every launch bumps the slot generation. The disconnect watcher spawned
//!   for an instance only evicts it if the generation still matches, so a
//!   late notification never removes a newer instance.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use super::profile::{BrowserProfile, LifecycleState, ProfileKind, provision_profiles};
use super::{AutomationEngine, BrowserError, BrowserInstance};
use crate::retry::{FailureType, RetryPolicy, Retryable, with_retry};

/// Launch attempts before giving up on a profile.
pub const DEFAULT_LAUNCH_RETRIES: u32 = 3;

/// Fixed delay between launch attempts.
pub const DEFAULT_LAUNCH_RETRY_DELAY: Duration = Duration::from_secs(2);

/// Upper bound on the responsiveness probe made before reuse.
const HEALTH_CHECK_TIMEOUT: Duration = Duration::from_secs(5);

/// Errors from pool operations.
#[derive(Debug, Error)]
pub enum PoolError {
    /// The instance could not be launched within the retry budget.
    #[error("profile {profile_id} failed to launch after {attempts} attempts: {source}")]
    LaunchFailed {
        /// Profile index.
        profile_id: usize,
        /// Launch attempts made.
        attempts: u32,
        /// Last engine error.
        #[source]
        source: BrowserError,
    },

    /// The requested profile index is outside the pool.
    #[error("unknown profile {profile_id} (pool has {size} profiles)")]
    UnknownProfile {
        /// Requested index.
        profile_id: usize,
        /// Number of profiles in the pool.
        size: usize,
    },

    /// A profile working directory could not be created.
    #[error("failed to provision profile directory {path}: {source}")]
    Provision {
        /// Directory that failed.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },
}

impl Retryable for PoolError {
    fn failure_type(&self) -> FailureType {
        match self {
            Self::LaunchFailed { .. } => FailureType::Transient,
            Self::UnknownProfile { .. } | Self::Provision { .. } => FailureType::Permanent,
        }
    }
}

struct SlotState {
    profile: BrowserProfile,
    instance: Option<Arc<dyn BrowserInstance>>,
    generation: u64,
    leases: usize,
}

struct ProfileSlot {
    launch_gate: tokio::sync::Mutex<()>,
    state: Mutex<SlotState>,
}

impl ProfileSlot {
    fn new(profile: BrowserProfile) -> Self {
        Self {
            launch_gate: tokio::sync::Mutex::new(()),
            state: Mutex::new(SlotState {
                profile,
                instance: None,
                generation: 0,
                leases: 0,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SlotState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

struct PoolInner {
    engine: Arc<dyn AutomationEngine>,
    kind: ProfileKind,
    slots: Vec<ProfileSlot>,
    next: AtomicUsize,
    launch_policy: RetryPolicy,
}

impl PoolInner {
    fn mark_disconnected(&self, profile_id: usize, generation: u64) {
        let Some(slot) = self.slots.get(profile_id) else {
            return;
        };
        let mut state = slot.lock();
        if state.generation != generation || state.instance.is_none() {
            return;
        }
        state.instance = None;
        state.profile.state = LifecycleState::Disconnected;
        warn!(profile_id, kind = %self.kind, "instance disconnected, will relaunch on next acquire");
    }
}

/// Pool of automation instances, one per profile.
///
/// Cheap to clone; clones share the same profiles.
#[derive(Clone)]
pub struct BrowserPool {
    inner: Arc<PoolInner>,
}

impl std::fmt::Debug for BrowserPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BrowserPool")
            .field("kind", &self.inner.kind)
            .field("profiles", &self.inner.slots.len())
            .finish_non_exhaustive()
    }
}

impl BrowserPool {
    /// Creates a pool of `max_profiles` profiles under `base_dir`, provisioning
    /// any missing working directories.
    ///
    /// # Errors
    ///
    /// Returns [`PoolError::Provision`] if a directory cannot be created.
    #[instrument(skip(engine, launch_policy), fields(base_dir = %base_dir.display()))]
    pub async fn new(
        engine: Arc<dyn AutomationEngine>,
        kind: ProfileKind,
        base_dir: &Path,
        max_profiles: usize,
        launch_policy: RetryPolicy,
    ) -> Result<Self, PoolError> {
        let profiles = provision_profiles(base_dir, kind, max_profiles.max(1))
            .await
            .map_err(|(path, source)| PoolError::Provision { path, source })?;

        info!(profiles = profiles.len(), %kind, "browser pool ready");

        Ok(Self {
            inner: Arc::new(PoolInner {
                engine,
                kind,
                slots: profiles.into_iter().map(ProfileSlot::new).collect(),
                next: AtomicUsize::new(0),
                launch_policy,
            }),
        })
    }

    /// Default launch policy: 3 attempts, 2 seconds apart.
    #[must_use]
    pub fn default_launch_policy() -> RetryPolicy {
        RetryPolicy::fixed(DEFAULT_LAUNCH_RETRIES, DEFAULT_LAUNCH_RETRY_DELAY)
    }

    /// Profile kind served by this pool.
    #[must_use]
    pub fn kind(&self) -> ProfileKind {
        self.inner.kind
    }

    /// Number of profiles.
    #[must_use]
    pub fn size(&self) -> usize {
        self.inner.slots.len()
    }

    /// Leases an instance for `profile_id`, or the next profile round-robin.
    ///
    /// Reuses a live instance that passes the health check; otherwise
    /// launches one, retrying on the launch policy. Concurrent calls for the
    /// same profile resolve to the same instance.
    ///
    /// # Errors
    ///
    /// Returns [`PoolError::UnknownProfile`] for an out-of-range index and
    /// [`PoolError::LaunchFailed`] when every launch attempt failed.
    #[instrument(skip(self), fields(kind = %self.inner.kind))]
    pub async fn acquire(&self, profile_id: Option<usize>) -> Result<ProfileLease, PoolError> {
        let size = self.inner.slots.len();
        let profile_id = match profile_id {
            Some(id) if id < size => id,
            Some(id) => {
                return Err(PoolError::UnknownProfile {
                    profile_id: id,
                    size,
                });
            }
            None => self.inner.next.fetch_add(1, Ordering::Relaxed) % size,
        };
        let slot = &self.inner.slots[profile_id];
        let _gate = slot.launch_gate.lock().await;

        let current = slot.lock().instance.clone();
        if let Some(instance) = current {
            if is_healthy(instance.as_ref()).await {
                debug!(profile_id, instance = %instance.id(), "reusing instance");
                return Ok(self.lease(profile_id, instance));
            }
            warn!(profile_id, instance = %instance.id(), "instance unresponsive, evicting");
            {
                let mut state = slot.lock();
                state.instance = None;
                state.generation += 1;
            }
            instance.kill().await;
        }

        let profile = {
            let mut state = slot.lock();
            state.profile.state = LifecycleState::Launching;
            state.profile.clone()
        };

        let mut attempts = 0u32;
        let launched = with_retry(&self.inner.launch_policy, "browser launch", |call| {
            attempts = call;
            self.inner.engine.launch(&profile)
        })
        .await;

        let instance = match launched {
            Ok(instance) => instance,
            Err(error) => {
                let mut state = slot.lock();
                state.profile.state = if state.leases > 0 {
                    LifecycleState::Active
                } else {
                    LifecycleState::Idle
                };
                drop(state);
                warn!(profile_id, attempts, error = %error, "launch failed");
                return Err(PoolError::LaunchFailed {
                    profile_id,
                    attempts,
                    source: error.into_inner(),
                });
            }
        };

        let generation = {
            let mut state = slot.lock();
            state.generation += 1;
            state.instance = Some(Arc::clone(&instance));
            state.generation
        };
        info!(profile_id, instance = %instance.id(), attempts, "instance launched");
        self.watch_disconnect(profile_id, generation, Arc::clone(&instance));

        Ok(self.lease(profile_id, instance))
    }

    /// Returns one lease on `profile_id`. A profile with no remaining leases
    /// goes back to idle; its instance stays alive for reuse.
    pub fn release(&self, profile_id: usize) {
        let Some(slot) = self.inner.slots.get(profile_id) else {
            return;
        };
        let mut state = slot.lock();
        state.leases = state.leases.saturating_sub(1);
        if state.leases == 0 && state.profile.state == LifecycleState::Active {
            state.profile.state = LifecycleState::Idle;
        }
        debug!(profile_id, leases = state.leases, "profile released");
    }

    /// Hard-terminates every instance and resets all profiles to idle.
    pub async fn kill_all(&self) {
        for (profile_id, slot) in self.inner.slots.iter().enumerate() {
            let _gate = slot.launch_gate.lock().await;
            let instance = {
                let mut state = slot.lock();
                state.generation += 1;
                state.profile.state = LifecycleState::Idle;
                state.instance.take()
            };
            if let Some(instance) = instance {
                warn!(profile_id, instance = %instance.id(), "killing instance");
                instance.kill().await;
            }
        }
        info!(kind = %self.inner.kind, "all instances killed");
    }

    /// Snapshot of every profile and its lifecycle state.
    #[must_use]
    pub fn profiles(&self) -> Vec<BrowserProfile> {
        self.inner
            .slots
            .iter()
            .map(|slot| slot.lock().profile.clone())
            .collect()
    }

    /// Number of profiles currently leased.
    #[must_use]
    pub fn active_count(&self) -> usize {
        self.inner
            .slots
            .iter()
            .filter(|slot| slot.lock().profile.state == LifecycleState::Active)
            .count()
    }

    fn lease(&self, profile_id: usize, instance: Arc<dyn BrowserInstance>) -> ProfileLease {
        let mut state = self.inner.slots[profile_id].lock();
        state.leases += 1;
        state.profile.state = LifecycleState::Active;
        ProfileLease {
            pool: self.clone(),
            profile_id,
            instance,
        }
    }

    fn watch_disconnect(
        &self,
        profile_id: usize,
        generation: u64,
        instance: Arc<dyn BrowserInstance>,
    ) {
        let pool: Weak<PoolInner> = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            instance.closed().await;
            if let Some(inner) = pool.upgrade() {
                inner.mark_disconnected(profile_id, generation);
            }
        });
    }
}

async fn is_healthy(instance: &dyn BrowserInstance) -> bool {
    if !instance.is_connected() {
        return false;
    }
    matches!(
        tokio::time::timeout(HEALTH_CHECK_TIMEOUT, instance.page_count()).await,
        Ok(Ok(_))
    )
}

/// A leased instance. Dropping the lease releases the profile.
pub struct ProfileLease {
    pool: BrowserPool,
    profile_id: usize,
    instance: Arc<dyn BrowserInstance>,
}

impl ProfileLease {
    /// Profile index.
    #[must_use]
    pub fn profile_id(&self) -> usize {
        self.profile_id
    }

    /// The leased instance.
    #[must_use]
    pub fn instance(&self) -> &Arc<dyn BrowserInstance> {
        &self.instance
    }
}

impl std::fmt::Debug for ProfileLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProfileLease")
            .field("profile_id", &self.profile_id)
            .field("instance", &self.instance.id())
            .finish()
    }
}

impl Drop for ProfileLease {
    fn drop(&mut self) {
        self.pool.release(self.profile_id);
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicU32};

    use async_trait::async_trait;
    use tokio::sync::watch;

    use super::*;
    use crate::browser::BrowserPage;

    struct FakeInstance {
        id: String,
        connected: AtomicBool,
        responsive: AtomicBool,
        closed_tx: watch::Sender<bool>,
    }

    impl FakeInstance {
        fn disconnect(&self) {
            self.connected.store(false, Ordering::SeqCst);
            self.closed_tx.send_replace(true);
        }
    }

    #[async_trait]
    impl BrowserInstance for FakeInstance {
        fn id(&self) -> String {
            self.id.clone()
        }

        fn is_connected(&self) -> bool {
            self.connected.load(Ordering::SeqCst)
        }

        async fn page_count(&self) -> Result<usize, BrowserError> {
            if self.responsive.load(Ordering::SeqCst) {
                Ok(0)
            } else {
                Err(BrowserError::Page {
                    message: "target closed".into(),
                })
            }
        }

        async fn open_page(&self) -> Result<Arc<dyn BrowserPage>, BrowserError> {
            Err(BrowserError::Page {
                message: "not supported".into(),
            })
        }

        async fn closed(&self) {
            let mut rx = self.closed_tx.subscribe();
            let _ = rx.wait_for(|closed| *closed).await;
        }

        async fn kill(&self) {
            self.disconnect();
        }
    }

    #[derive(Default)]
    struct FakeEngine {
        launches: AtomicU32,
        failures_before_success: AtomicU32,
        launched: Mutex<Vec<Arc<FakeInstance>>>,
    }

    #[async_trait]
    impl AutomationEngine for FakeEngine {
        async fn launch(
            &self,
            profile: &BrowserProfile,
        ) -> Result<Arc<dyn BrowserInstance>, BrowserError> {
            let n = self.launches.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            if self.failures_before_success.load(Ordering::SeqCst) > n {
                return Err(BrowserError::Launch {
                    profile_id: profile.profile_id,
                    message: "crashed on start".into(),
                });
            }
            let (closed_tx, _) = watch::channel(false);
            let instance = Arc::new(FakeInstance {
                id: format!("{}-{n}", profile.profile_id),
                connected: AtomicBool::new(true),
                responsive: AtomicBool::new(true),
                closed_tx,
            });
            self.launched.lock().unwrap().push(Arc::clone(&instance));
            Ok(instance)
        }
    }

    async fn pool(engine: Arc<FakeEngine>, dir: &Path, size: usize) -> BrowserPool {
        BrowserPool::new(
            engine,
            ProfileKind::Video,
            dir,
            size,
            RetryPolicy::fixed(3, Duration::from_millis(1)),
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_concurrent_acquire_coalesces_launch() {
        let dir = tempfile::tempdir().unwrap();
        let engine = Arc::new(FakeEngine::default());
        let pool = pool(Arc::clone(&engine), dir.path(), 2).await;

        let (a, b) = tokio::join!(pool.acquire(Some(0)), pool.acquire(Some(0)));
        let (a, b) = (a.unwrap(), b.unwrap());

        assert_eq!(engine.launches.load(Ordering::SeqCst), 1);
        assert_eq!(a.instance().id(), b.instance().id());
        assert_eq!(pool.active_count(), 1);

        drop(a);
        assert_eq!(pool.profiles()[0].state, LifecycleState::Active);
        drop(b);
        assert_eq!(pool.profiles()[0].state, LifecycleState::Idle);
    }

    #[tokio::test]
    async fn test_round_robin_assignment() {
        let dir = tempfile::tempdir().unwrap();
        let engine = Arc::new(FakeEngine::default());
        let pool = pool(engine, dir.path(), 2).await;

        let first = pool.acquire(None).await.unwrap();
        let second = pool.acquire(None).await.unwrap();
        let third = pool.acquire(None).await.unwrap();

        assert_eq!(first.profile_id(), 0);
        assert_eq!(second.profile_id(), 1);
        assert_eq!(third.profile_id(), 0);
        assert_eq!(first.instance().id(), third.instance().id());
    }

    #[tokio::test]
    async fn test_launch_retried_then_fails() {
        let dir = tempfile::tempdir().unwrap();
        let engine = Arc::new(FakeEngine::default());
        engine.failures_before_success.store(10, Ordering::SeqCst);
        let pool = pool(Arc::clone(&engine), dir.path(), 1).await;

        match pool.acquire(Some(0)).await {
            Err(PoolError::LaunchFailed { attempts, .. }) => assert_eq!(attempts, 3),
            other => panic!("expected LaunchFailed, got {other:?}"),
        }
        assert_eq!(engine.launches.load(Ordering::SeqCst), 3);
        assert_eq!(pool.profiles()[0].state, LifecycleState::Idle);
    }

    #[tokio::test]
    async fn test_launch_succeeds_after_transient_failure() {
        let dir = tempfile::tempdir().unwrap();
        let engine = Arc::new(FakeEngine::default());
        engine.failures_before_success.store(2, Ordering::SeqCst);
        let pool = pool(Arc::clone(&engine), dir.path(), 1).await;

        let lease = pool.acquire(Some(0)).await.unwrap();
        assert_eq!(lease.instance().id(), "0-2");
    }

    #[tokio::test]
    async fn test_crashed_instance_is_relaunched() {
        let dir = tempfile::tempdir().unwrap();
        let engine = Arc::new(FakeEngine::default());
        let pool = pool(Arc::clone(&engine), dir.path(), 1).await;

        let lease = pool.acquire(Some(0)).await.unwrap();
        let first_id = lease.instance().id();
        drop(lease);

        engine.launched.lock().unwrap()[0].disconnect();
        for _ in 0..50 {
            if pool.profiles()[0].state == LifecycleState::Disconnected {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(pool.profiles()[0].state, LifecycleState::Disconnected);

        let lease = pool.acquire(Some(0)).await.unwrap();
        assert_ne!(lease.instance().id(), first_id);
        assert_eq!(engine.launches.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_unresponsive_instance_is_evicted() {
        let dir = tempfile::tempdir().unwrap();
        let engine = Arc::new(FakeEngine::default());
        let pool = pool(Arc::clone(&engine), dir.path(), 1).await;

        drop(pool.acquire(Some(0)).await.unwrap());
        engine.launched.lock().unwrap()[0]
            .responsive
            .store(false, Ordering::SeqCst);

        let lease = pool.acquire(Some(0)).await.unwrap();
        assert_eq!(lease.instance().id(), "0-1");
        assert!(!engine.launched.lock().unwrap()[0].is_connected());
    }

    #[tokio::test]
    async fn test_kill_all_resets_profiles() {
        let dir = tempfile::tempdir().unwrap();
        let engine = Arc::new(FakeEngine::default());
        let pool = pool(Arc::clone(&engine), dir.path(), 2).await;

        drop(pool.acquire(Some(0)).await.unwrap());
        drop(pool.acquire(Some(1)).await.unwrap());
        pool.kill_all().await;

        assert!(
            engine
                .launched
                .lock()
                .unwrap()
                .iter()
                .all(|i| !i.is_connected())
        );
        assert!(
            pool.profiles()
                .iter()
                .all(|p| p.state == LifecycleState::Idle)
        );
        drop(pool.acquire(Some(0)).await.unwrap());
        assert_eq!(engine.launches.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_unknown_profile() {
        let dir = tempfile::tempdir().unwrap();
        let pool = pool(Arc::new(FakeEngine::default()), dir.path(), 2).await;
        assert!(matches!(
            pool.acquire(Some(5)).await,
            Err(PoolError::UnknownProfile { profile_id: 5, size: 2 })
        ));
    }
}

//! Automation-instance pool and resource discovery.
//!
//! The automation engine itself (page navigation, DOM, network interception)
//! is an external collaborator reached through [`AutomationEngine`],
//! [`BrowserInstance`] and [`BrowserPage`]. This module owns the pieces
//! around it:
//!
//! - [`BrowserPool`]: a fixed set of profiles with coalesced launches,
//!   health-checked reuse and crash eviction.
//! - [`discover`]: one async call that hides request interception behind a
//!   timeout and returns the resource locator plus replayable headers.

mod discovery;
mod pool;
mod profile;

pub use discovery::{DEFAULT_DISCOVERY_TIMEOUT, DiscoveryError, PageGuard, discover};
pub use pool::{
    BrowserPool, DEFAULT_LAUNCH_RETRIES, DEFAULT_LAUNCH_RETRY_DELAY, PoolError, ProfileLease,
};
pub use profile::{BrowserProfile, LifecycleState, ProfileKind, provision_profiles};

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use crate::retry::{FailureType, Retryable};
use crate::transfer::RequestHeaders;

/// Errors reported by the automation engine collaborator.
#[derive(Debug, Error)]
pub enum BrowserError {
    /// The instance could not be started.
    #[error("failed to launch instance for profile {profile_id}: {message}")]
    Launch {
        /// Profile that failed to launch.
        profile_id: usize,
        /// Engine message.
        message: String,
    },

    /// The instance went away (crash, killed, connection lost).
    #[error("instance {instance_id} disconnected")]
    Disconnected {
        /// Identifier of the lost instance.
        instance_id: String,
    },

    /// Opening, querying or closing a page failed.
    #[error("page error: {message}")]
    Page {
        /// Engine message.
        message: String,
    },

    /// Navigation to the source failed.
    #[error("navigation to {url} failed: {message}")]
    Navigation {
        /// Target URL.
        url: String,
        /// Engine message.
        message: String,
    },
}

impl Retryable for BrowserError {
    fn failure_type(&self) -> FailureType {
        FailureType::Transient
    }
}

/// An outgoing request observed while a page loads.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct InterceptedRequest {
    /// Request URL.
    pub url: String,
    /// Request headers, including cookies and origin.
    pub headers: RequestHeaders,
    /// Engine resource type (`media`, `document`, `xhr`...).
    pub resource_type: String,
    /// Response content type, when the engine saw the response.
    pub content_type: Option<String>,
}

/// A directly fetchable resource extracted by discovery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredResource {
    /// Locator to fetch with plain HTTP range requests.
    pub url: String,
    /// Headers to replay (cookies, origin, referer).
    pub headers: RequestHeaders,
}

/// Launches isolated automation instances.
///
/// # Object Safety
///
/// Uses `async_trait` so the pool can hold an `Arc<dyn AutomationEngine>`.
#[async_trait]
pub trait AutomationEngine: Send + Sync {
    /// Starts an instance bound to `profile.work_dir`.
    async fn launch(&self, profile: &BrowserProfile)
    -> Result<Arc<dyn BrowserInstance>, BrowserError>;
}

/// A live automation instance.
#[async_trait]
pub trait BrowserInstance: Send + Sync {
    /// Stable identifier, unique per launch.
    fn id(&self) -> String;

    /// Cheap liveness flag; false once the instance disconnected.
    fn is_connected(&self) -> bool;

    /// Number of open pages. Used as the responsiveness probe on reuse.
    async fn page_count(&self) -> Result<usize, BrowserError>;

    /// Opens a new page.
    async fn open_page(&self) -> Result<Arc<dyn BrowserPage>, BrowserError>;

    /// Resolves once the instance disconnects.
    async fn closed(&self);

    /// Hard-terminates the underlying OS process.
    async fn kill(&self);
}

/// A page inside an instance.
#[async_trait]
pub trait BrowserPage: Send + Sync {
    /// Navigates to `url`.
    async fn navigate(&self, url: &str) -> Result<(), BrowserError>;

    /// Waits for the next intercepted request; `None` once the page is done.
    async fn next_request(&self) -> Result<Option<InterceptedRequest>, BrowserError>;

    /// Closes the page.
    async fn close(&self) -> Result<(), BrowserError>;
}

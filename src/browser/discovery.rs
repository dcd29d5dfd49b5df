//! Discovery: extract a directly fetchable locator from a restricted page.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, instrument, warn};
use url::Url;

use super::profile::ProfileKind;
use super::{BrowserError, BrowserInstance, BrowserPage, DiscoveredResource};
use crate::retry::{FailureType, Retryable};

/// Default hard ceiling on one discovery attempt (30 seconds).
pub const DEFAULT_DISCOVERY_TIMEOUT: Duration = Duration::from_secs(30);

/// Errors from a discovery attempt.
#[derive(Debug, Error)]
pub enum DiscoveryError {
    /// The automation engine reported an error.
    #[error("discovery failed: {source}")]
    Browser {
        /// Engine error.
        #[source]
        source: BrowserError,
    },

    /// No matching request was seen before the deadline.
    #[error("discovery of {url} timed out after {timeout_secs}s")]
    Timeout {
        /// Source page.
        url: String,
        /// Deadline that elapsed.
        timeout_secs: u64,
    },

    /// The page finished without issuing a matching request.
    #[error("no {kind} resource found on {url}")]
    NoResource {
        /// Source page.
        url: String,
        /// What was being looked for.
        kind: ProfileKind,
    },

    /// The source reference is not a URL.
    #[error("invalid source URL: {url}")]
    InvalidUrl {
        /// The rejected value.
        url: String,
    },
}

impl DiscoveryError {
    fn browser(source: BrowserError) -> Self {
        Self::Browser { source }
    }
}

impl Retryable for DiscoveryError {
    fn failure_type(&self) -> FailureType {
        match self {
            Self::Browser { .. } | Self::Timeout { .. } | Self::NoResource { .. } => {
                FailureType::Transient
            }
            Self::InvalidUrl { .. } => FailureType::Permanent,
        }
    }
}

/// Scoped page: closed explicitly on normal paths, and in the background if
/// dropped while still open (error, timeout or task cancellation).
pub struct PageGuard {
    page: Arc<dyn BrowserPage>,
    open: bool,
}

impl PageGuard {
    /// Takes ownership of an open page.
    #[must_use]
    pub fn new(page: Arc<dyn BrowserPage>) -> Self {
        Self { page, open: true }
    }

    /// The guarded page.
    #[must_use]
    pub fn page(&self) -> &dyn BrowserPage {
        self.page.as_ref()
    }

    /// Closes the page now.
    pub async fn close(mut self) {
        self.open = false;
        if let Err(e) = self.page.close().await {
            debug!(error = %e, "page close failed");
        }
    }
}

impl Drop for PageGuard {
    fn drop(&mut self) {
        if !self.open {
            return;
        }
        let page = Arc::clone(&self.page);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = page.close().await {
                        debug!(error = %e, "deferred page close failed");
                    }
                });
            }
            Err(_) => warn!("page dropped outside a runtime; left open"),
        }
    }
}

/// Opens a page on `instance`, navigates to `source_url` and returns the
/// first intercepted request that `kind` accepts.
///
/// The page is always closed, whatever the outcome.
///
/// # Errors
///
/// Returns [`DiscoveryError::Timeout`] when nothing matched within
/// `timeout`, [`DiscoveryError::NoResource`] when the page went quiet
/// without a match, and [`DiscoveryError::Browser`] for engine failures.
#[instrument(skip(instance), fields(instance = %instance.id()))]
pub async fn discover(
    instance: &dyn BrowserInstance,
    source_url: &str,
    kind: ProfileKind,
    timeout: Duration,
) -> Result<DiscoveredResource, DiscoveryError> {
    Url::parse(source_url).map_err(|_| DiscoveryError::InvalidUrl {
        url: source_url.to_string(),
    })?;

    let attempt = async {
        let page = instance
            .open_page()
            .await
            .map_err(DiscoveryError::browser)?;
        let guard = PageGuard::new(page);
        let result = intercept(guard.page(), source_url, kind).await;
        guard.close().await;
        result
    };

    match tokio::time::timeout(timeout, attempt).await {
        Ok(result) => result,
        Err(_) => Err(DiscoveryError::Timeout {
            url: source_url.to_string(),
            timeout_secs: timeout.as_secs(),
        }),
    }
}

async fn intercept(
    page: &dyn BrowserPage,
    source_url: &str,
    kind: ProfileKind,
) -> Result<DiscoveredResource, DiscoveryError> {
    page.navigate(source_url)
        .await
        .map_err(DiscoveryError::browser)?;

    while let Some(request) = page.next_request().await.map_err(DiscoveryError::browser)? {
        if kind.matches(&request) {
            debug!(url = %request.url, headers = request.headers.len(), "resource discovered");
            return Ok(DiscoveredResource {
                url: request.url,
                headers: request.headers,
            });
        }
    }

    Err(DiscoveryError::NoResource {
        url: source_url.to_string(),
        kind,
    })
}

//! In-memory collaborators: storage, automation engine and range fetcher.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use asset_relay::browser::BrowserError;
use asset_relay::remote::FOLDER_MIME_TYPE;
use asset_relay::{
    AutomationEngine, BrowserInstance, BrowserPage, BrowserProfile, InterceptedRequest,
    ProfileKind, RangeFetcher, RemoteEntry, RemoteStorage, RequestHeaders, StorageError,
    TransferError,
};
use async_trait::async_trait;

/// Locator discovery hands out for a source page.
pub fn resource_url(source_ref: &str) -> String {
    format!("{source_ref}/videoplayback")
}

/// Deterministic payload of `len` bytes.
pub fn sample_bytes(len: usize, seed: u8) -> Vec<u8> {
    (0..len)
        .map(|i| ((i * 31 + usize::from(seed)) % 251) as u8)
        .collect()
}

/// Remote storage keeping uploads in memory.
#[derive(Default)]
pub struct MemoryStorage {
    /// (parent, name) -> uploaded bytes.
    pub uploads: Mutex<HashMap<(String, String), Vec<u8>>>,
    /// Number of `upload_file` calls.
    pub upload_calls: AtomicUsize,
    /// Number of `refresh_auth` calls.
    pub refreshes: AtomicUsize,
    /// Upload calls left that fail with an expired credential.
    pub expire_next_uploads: AtomicUsize,
    /// Folder id -> children, for tree walks.
    pub tree: Mutex<HashMap<String, Vec<RemoteEntry>>>,
    next_id: AtomicUsize,
}

impl MemoryStorage {
    pub fn uploaded(&self, parent: &str, name: &str) -> Option<Vec<u8>> {
        self.uploads
            .lock()
            .unwrap()
            .get(&(parent.to_string(), name.to_string()))
            .cloned()
    }

    pub fn upload_count(&self) -> usize {
        self.upload_calls.load(Ordering::SeqCst)
    }

    fn next_id(&self, prefix: &str) -> String {
        format!("{prefix}-{}", self.next_id.fetch_add(1, Ordering::SeqCst))
    }
}

#[async_trait]
impl RemoteStorage for MemoryStorage {
    async fn list_children(&self, folder_id: &str) -> Result<Vec<RemoteEntry>, StorageError> {
        Ok(self
            .tree
            .lock()
            .unwrap()
            .get(folder_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn metadata(&self, id: &str) -> Result<RemoteEntry, StorageError> {
        Err(StorageError::NotFound { id: id.to_string() })
    }

    async fn create_folder(
        &self,
        parent_id: &str,
        name: &str,
    ) -> Result<RemoteEntry, StorageError> {
        let entry = RemoteEntry {
            id: self.next_id("folder"),
            name: name.to_string(),
            is_folder: true,
            mime_type: FOLDER_MIME_TYPE.to_string(),
            size: None,
            web_url: None,
        };
        self.tree
            .lock()
            .unwrap()
            .entry(parent_id.to_string())
            .or_default()
            .push(entry.clone());
        Ok(entry)
    }

    async fn upload_file(
        &self,
        parent_id: &str,
        name: &str,
        local_path: &Path,
        mime_type: &str,
    ) -> Result<RemoteEntry, StorageError> {
        self.upload_calls.fetch_add(1, Ordering::SeqCst);
        if self
            .expire_next_uploads
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(StorageError::AuthExpired);
        }

        let bytes = tokio::fs::read(local_path)
            .await
            .map_err(|e| StorageError::io(local_path, e))?;
        let size = bytes.len() as u64;
        self.uploads
            .lock()
            .unwrap()
            .insert((parent_id.to_string(), name.to_string()), bytes);
        Ok(RemoteEntry {
            id: self.next_id("file"),
            name: name.to_string(),
            is_folder: false,
            mime_type: mime_type.to_string(),
            size: Some(size),
            web_url: None,
        })
    }

    async fn file_exists(&self, parent_id: &str, name: &str) -> Result<bool, StorageError> {
        Ok(self
            .uploads
            .lock()
            .unwrap()
            .contains_key(&(parent_id.to_string(), name.to_string())))
    }

    async fn refresh_auth(&self) -> Result<(), StorageError> {
        self.refreshes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Automation engine whose pages always intercept [`resource_url`].
#[derive(Default)]
pub struct StaticEngine {
    pub launches: AtomicUsize,
    pub active_pages: Arc<AtomicUsize>,
    pub max_active_pages: Arc<AtomicUsize>,
}

#[async_trait]
impl AutomationEngine for StaticEngine {
    async fn launch(
        &self,
        profile: &BrowserProfile,
    ) -> Result<Arc<dyn BrowserInstance>, BrowserError> {
        let n = self.launches.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(StaticInstance {
            id: format!("{}-{}-{n}", profile.kind, profile.profile_id),
            active_pages: Arc::clone(&self.active_pages),
            max_active_pages: Arc::clone(&self.max_active_pages),
        }))
    }
}

struct StaticInstance {
    id: String,
    active_pages: Arc<AtomicUsize>,
    max_active_pages: Arc<AtomicUsize>,
}

#[async_trait]
impl BrowserInstance for StaticInstance {
    fn id(&self) -> String {
        self.id.clone()
    }

    fn is_connected(&self) -> bool {
        true
    }

    async fn page_count(&self) -> Result<usize, BrowserError> {
        Ok(self.active_pages.load(Ordering::SeqCst))
    }

    async fn open_page(&self) -> Result<Arc<dyn BrowserPage>, BrowserError> {
        let now = self.active_pages.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active_pages.fetch_max(now, Ordering::SeqCst);
        Ok(Arc::new(StaticPage {
            navigated: Mutex::new(None),
            active_pages: Arc::clone(&self.active_pages),
        }))
    }

    async fn closed(&self) {
        std::future::pending::<()>().await;
    }

    async fn kill(&self) {}
}

struct StaticPage {
    navigated: Mutex<Option<String>>,
    active_pages: Arc<AtomicUsize>,
}

#[async_trait]
impl BrowserPage for StaticPage {
    async fn navigate(&self, url: &str) -> Result<(), BrowserError> {
        *self.navigated.lock().unwrap() = Some(url.to_string());
        Ok(())
    }

    async fn next_request(&self) -> Result<Option<InterceptedRequest>, BrowserError> {
        let Some(source) = self.navigated.lock().unwrap().take() else {
            return Ok(None);
        };
        let mut headers = RequestHeaders::new();
        headers.insert("cookie".into(), "session=test".into());
        Ok(Some(InterceptedRequest {
            url: resource_url(&source),
            headers,
            resource_type: "media".into(),
            content_type: Some("video/mp4".into()),
        }))
    }

    async fn close(&self) -> Result<(), BrowserError> {
        self.active_pages.fetch_sub(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Range fetcher over in-memory resources keyed by URL.
#[derive(Default)]
pub struct MemoryFetcher {
    pub resources: Mutex<HashMap<String, Vec<u8>>>,
    /// URLs whose probe answers 503.
    pub unavailable: Mutex<HashSet<String>>,
}

impl MemoryFetcher {
    pub fn serve(&self, url: impl Into<String>, bytes: Vec<u8>) {
        self.resources.lock().unwrap().insert(url.into(), bytes);
    }

    pub fn set_unavailable(&self, url: &str, unavailable: bool) {
        let mut set = self.unavailable.lock().unwrap();
        if unavailable {
            set.insert(url.to_string());
        } else {
            set.remove(url);
        }
    }

    fn resource(&self, url: &str) -> Result<Vec<u8>, TransferError> {
        if self.unavailable.lock().unwrap().contains(url) {
            return Err(TransferError::http_status(url, 503));
        }
        self.resources
            .lock()
            .unwrap()
            .get(url)
            .cloned()
            .ok_or_else(|| TransferError::http_status(url, 404))
    }
}

#[async_trait]
impl RangeFetcher for MemoryFetcher {
    async fn probe(
        &self,
        url: &str,
        _: &RequestHeaders,
        max_bytes: u64,
    ) -> Result<u64, TransferError> {
        Ok((self.resource(url)?.len() as u64).min(max_bytes))
    }

    async fn content_length(&self, url: &str, _: &RequestHeaders) -> Result<u64, TransferError> {
        Ok(self.resource(url)?.len() as u64)
    }

    async fn fetch_range(
        &self,
        url: &str,
        _: &RequestHeaders,
        start: u64,
        end: u64,
    ) -> Result<Vec<u8>, TransferError> {
        let data = self.resource(url)?;
        Ok(data[start as usize..=end as usize].to_vec())
    }
}

/// A video task whose source is `https://provider.example/<name>`.
pub fn video_task(name: &str, destination: &str) -> asset_relay::TransferTask {
    asset_relay::TransferTask::new(
        format!("https://provider.example/{name}"),
        name,
        destination,
        ProfileKind::Video,
    )
}

//! Range-request transport used by the chunked transfer engine.
//!
//! [`RangeFetcher`] is the seam between the engine and the network;
//! [`HttpRangeFetcher`] is the reqwest-backed implementation.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::header::{CONTENT_LENGTH, CONTENT_RANGE, RANGE, RETRY_AFTER};
use reqwest::{Client, Response, StatusCode};
use tracing::{debug, instrument};
use url::Url;

use super::TransferError;

/// Default HTTP connect timeout (30 seconds).
pub const CONNECT_TIMEOUT_SECS: u64 = 30;

/// Default per-request timeout (5 minutes for large chunks).
pub const READ_TIMEOUT_SECS: u64 = 300;

/// Headers replayed on every request (cookies, origin, referer...).
pub type RequestHeaders = BTreeMap<String, String>;

/// Headers that the fetcher owns and never replays from discovery.
const RESERVED_HEADERS: &[&str] = &["range", "content-length", "host", "accept-encoding"];

/// Transport for probe, size and byte-range requests.
///
/// # Object Safety
///
/// Uses `async_trait` so the engine can hold an `Arc<dyn RangeFetcher>`.
#[async_trait]
pub trait RangeFetcher: Send + Sync {
    /// Reads up to `max_bytes` from the start of the resource and returns the
    /// number of bytes received.
    async fn probe(
        &self,
        url: &str,
        headers: &RequestHeaders,
        max_bytes: u64,
    ) -> Result<u64, TransferError>;

    /// Returns the total size of the resource in bytes.
    async fn content_length(&self, url: &str, headers: &RequestHeaders)
    -> Result<u64, TransferError>;

    /// Fetches the inclusive byte range `[start, end]`.
    async fn fetch_range(
        &self,
        url: &str,
        headers: &RequestHeaders,
        start: u64,
        end: u64,
    ) -> Result<Vec<u8>, TransferError>;
}

/// reqwest-backed [`RangeFetcher`].
///
/// Created once and shared, taking advantage of connection pooling.
#[derive(Debug, Clone)]
pub struct HttpRangeFetcher {
    client: Client,
}

impl HttpRangeFetcher {
    /// Creates a fetcher with default timeouts.
    ///
    /// # Errors
    ///
    /// Returns the reqwest builder error if the TLS backend cannot initialise.
    pub fn new() -> Result<Self, reqwest::Error> {
        Self::with_timeouts(
            Duration::from_secs(CONNECT_TIMEOUT_SECS),
            Duration::from_secs(READ_TIMEOUT_SECS),
        )
    }

    /// Creates a fetcher with an explicit connect timeout and per-request timeout.
    ///
    /// # Errors
    ///
    /// Returns the reqwest builder error if the TLS backend cannot initialise.
    pub fn with_timeouts(
        connect_timeout: Duration,
        read_timeout: Duration,
    ) -> Result<Self, reqwest::Error> {
        let client = Client::builder()
            .connect_timeout(connect_timeout)
            .timeout(read_timeout)
            // Byte ranges must address the stored representation.
            .gzip(false)
            .user_agent(concat!("asset-relay/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self { client })
    }

    async fn send(
        &self,
        url: &str,
        headers: &RequestHeaders,
        range: &str,
    ) -> Result<Response, TransferError> {
        Url::parse(url).map_err(|_| TransferError::invalid_url(url))?;

        let mut request = self.client.get(url).header(RANGE, range);
        for (name, value) in headers {
            if RESERVED_HEADERS.contains(&name.to_ascii_lowercase().as_str()) {
                continue;
            }
            request = request.header(name.as_str(), value.as_str());
        }

        request
            .send()
            .await
            .map_err(|e| TransferError::network(url, e))
    }
}

/// Converts a non-success response into [`TransferError::HttpStatus`].
fn ensure_success(url: &str, response: Response) -> Result<Response, TransferError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let retry_after = response
        .headers()
        .get(RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    Err(TransferError::http_status_with_retry_after(
        url,
        status.as_u16(),
        retry_after,
    ))
}

#[async_trait]
impl RangeFetcher for HttpRangeFetcher {
    #[instrument(skip(self, headers), fields(url = %url))]
    async fn probe(
        &self,
        url: &str,
        headers: &RequestHeaders,
        max_bytes: u64,
    ) -> Result<u64, TransferError> {
        let range = format!("bytes=0-{}", max_bytes.saturating_sub(1));
        let response = self.send(url, headers, &range).await?;
        if response.status() == StatusCode::RANGE_NOT_SATISFIABLE {
            // Nothing to read: the resource is empty.
            return Ok(0);
        }
        let response = ensure_success(url, response)?;

        let mut received = 0u64;
        let mut stream = response.bytes_stream();
        while let Some(item) = stream.next().await {
            let bytes = item.map_err(|e| TransferError::network(url, e))?;
            received += bytes.len() as u64;
            if received >= max_bytes {
                break;
            }
        }

        debug!(received, "probe complete");
        Ok(received.min(max_bytes))
    }

    #[instrument(skip(self, headers), fields(url = %url))]
    async fn content_length(
        &self,
        url: &str,
        headers: &RequestHeaders,
    ) -> Result<u64, TransferError> {
        let response = self.send(url, headers, "bytes=0-0").await?;
        let status = response.status();
        let response = if status == StatusCode::RANGE_NOT_SATISFIABLE {
            // `Content-Range: bytes */0` on an empty resource.
            response
        } else {
            ensure_success(url, response)?
        };

        let total = if status == StatusCode::PARTIAL_CONTENT
            || status == StatusCode::RANGE_NOT_SATISFIABLE
        {
            response
                .headers()
                .get(CONTENT_RANGE)
                .and_then(|v| v.to_str().ok())
                .and_then(parse_content_range_total)
        } else {
            // Server ignored the range; the full-body length is the size.
            response
                .headers()
                .get(CONTENT_LENGTH)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.trim().parse::<u64>().ok())
        };

        total.ok_or_else(|| TransferError::UnknownSize {
            url: url.to_string(),
        })
    }

    #[instrument(skip(self, headers), fields(url = %url, start, end))]
    async fn fetch_range(
        &self,
        url: &str,
        headers: &RequestHeaders,
        start: u64,
        end: u64,
    ) -> Result<Vec<u8>, TransferError> {
        let range = format!("bytes={start}-{end}");
        let response = ensure_success(url, self.send(url, headers, &range).await?)?;

        let status = response.status();
        if status != StatusCode::PARTIAL_CONTENT {
            return Err(TransferError::range_mismatch(
                url,
                start,
                end,
                format!("status {}", status.as_u16()),
            ));
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|e| TransferError::network(url, e))?;

        let expected = end - start + 1;
        if bytes.len() as u64 != expected {
            return Err(TransferError::range_mismatch(
                url,
                start,
                end,
                format!("{} bytes instead of {expected}", bytes.len()),
            ));
        }

        Ok(bytes.to_vec())
    }
}

/// Extracts the total from a `Content-Range: bytes 0-0/12345` value.
fn parse_content_range_total(value: &str) -> Option<u64> {
    let (_, total) = value.trim().rsplit_once('/')?;
    total.trim().parse::<u64>().ok()
}

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::StreamExt;
use futures_util::stream::BoxStream;
use log::{debug, warn};
use reqwest::header::{CACHE_CONTROL, CONTENT_LENGTH, ETAG, HeaderMap, IF_NONE_MATCH};
use reqwest::{Client, StatusCode};

use crate::error::{SyncError, SyncResult};

const HEAD_TIMEOUT: Duration = Duration::from_secs(15);

/// Outcome of a HEAD request for an asset.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Head {
    /// The cached tag still matches; nothing to download.
    NotModified { size: Option<u64> },
    Available { size: Option<u64> },
}

impl Head {
    pub fn size(&self) -> Option<u64> {
        match self {
            Head::NotModified { size } | Head::Available { size } => *size,
        }
    }
}

pub type BodyStream = BoxStream<'static, SyncResult<Bytes>>;

/// An opened download: the server tag plus the body as a chunk stream.
pub struct Fetched {
    pub etag: Option<String>,
    pub body: BodyStream,
}

/// How the updater talks to asset hosts.
#[async_trait]
pub trait AssetTransport: Send + Sync {
    async fn head(&self, url: &str, cached_tag: Option<&str>) -> SyncResult<Head>;

    async fn fetch(&self, url: &str) -> SyncResult<Fetched>;
}

#[derive(Clone)]
pub struct HttpTransport {
    client: Client,
    head_timeout: Duration,
}

impl HttpTransport {
    pub fn new() -> Self {
        Self::with_head_timeout(HEAD_TIMEOUT)
    }

    pub fn with_head_timeout(head_timeout: Duration) -> Self {
        let client = Client::builder()
            .user_agent(concat!("mmc-sync/", env!("CARGO_PKG_VERSION")))
            .build()
            .unwrap_or_else(|err| {
                warn!("network client: falling back to default HTTP client configuration ({err})");
                Client::new()
            });
        Self {
            client,
            head_timeout,
        }
    }
}

impl Default for HttpTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AssetTransport for HttpTransport {
    async fn head(&self, url: &str, cached_tag: Option<&str>) -> SyncResult<Head> {
        let mut request = self.client.head(url).timeout(self.head_timeout);
        if let Some(tag) = cached_tag.filter(|tag| !tag.is_empty()) {
            request = request.header(IF_NONE_MATCH, quote_tag(tag));
        }
        let resp = request
            .send()
            .await
            .map_err(|e| SyncError::network(url, format!("HEAD failed: {e}")))?;
        let status = resp.status();
        // HEAD bodies are empty, so read the advertised length from the header.
        let size = header_length(resp.headers());
        debug!("head {url}: {status} size={size:?}");
        if status == StatusCode::NOT_MODIFIED {
            return Ok(Head::NotModified { size });
        }
        resp.error_for_status()
            .map_err(|e| SyncError::network(url, format!("HEAD status error: {e}")))?;
        Ok(Head::Available { size })
    }

    async fn fetch(&self, url: &str) -> SyncResult<Fetched> {
        let resp = self
            .client
            .get(url)
            .header(CACHE_CONTROL, "no-cache")
            .send()
            .await
            .map_err(|e| SyncError::network(url, format!("download request failed: {e}")))?
            .error_for_status()
            .map_err(|e| SyncError::network(url, format!("download status error: {e}")))?;
        let etag = resp
            .headers()
            .get(ETAG)
            .and_then(|value| value.to_str().ok())
            .map(unquote_tag)
            .filter(|tag| !tag.is_empty());
        let owned_url = url.to_owned();
        let body = resp
            .bytes_stream()
            .map(move |chunk| {
                chunk.map_err(|e| SyncError::network(&owned_url, format!("stream error: {e}")))
            })
            .boxed();
        Ok(Fetched { etag, body })
    }
}

fn header_length(headers: &HeaderMap) -> Option<u64> {
    headers
        .get(CONTENT_LENGTH)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.trim().parse::<u64>().ok())
        .filter(|len| *len > 0)
}

/// Strip surrounding quotes and a weak validator prefix from an ETag.
pub fn unquote_tag(raw: &str) -> String {
    raw.trim()
        .trim_start_matches("W/")
        .trim_matches('"')
        .trim()
        .to_owned()
}

fn quote_tag(tag: &str) -> String {
    format!("\"{}\"", tag.trim_matches('"'))
}

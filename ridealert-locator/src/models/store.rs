//! Artifact retrieval
//!
//! [`ArtifactStore`] is the seam to wherever model files live. Production
//! uses [`HttpArtifactStore`]; tests plug in an in-memory store.

use super::{ArtifactKind, LoadError};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

const USER_AGENT: &str = concat!("ridealert-locator/", env!("CARGO_PKG_VERSION"));

/// Upper bound on the buffer reserved up front from `Content-Length`
const MAX_PREALLOC_BYTES: u64 = 16 * 1024 * 1024;

/// Fetch failure classification
#[derive(Debug, Clone, Error)]
pub enum FetchError {
    /// Worth retrying (connection reset, timeout, 5xx, 429)
    #[error("transient: {0}")]
    Transient(String),

    /// Retrying will not help (4xx)
    #[error("permanent: {0}")]
    Permanent(String),

    /// No URL is configured for the artifact
    #[error("no URL configured")]
    MissingUrl,
}

/// Byte counters for one artifact download
///
/// Written by the downloader, read by status queries.
#[derive(Debug, Default)]
pub struct ArtifactProgress {
    expected: AtomicU64,
    downloaded: AtomicU64,
}

impl ArtifactProgress {
    /// Expected size, 0 when unknown
    pub fn expected_bytes(&self) -> u64 {
        self.expected.load(Ordering::Relaxed)
    }

    pub fn downloaded_bytes(&self) -> u64 {
        self.downloaded.load(Ordering::Relaxed)
    }

    pub fn set_expected(&self, bytes: u64) {
        self.expected.store(bytes, Ordering::Relaxed);
    }

    pub fn add_downloaded(&self, bytes: u64) {
        self.downloaded.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn reset(&self) {
        self.expected.store(0, Ordering::Relaxed);
        self.downloaded.store(0, Ordering::Relaxed);
    }
}

/// Source of artifact bytes
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    /// Fetch the full contents of one artifact
    ///
    /// Implementations should update `progress` as bytes arrive.
    async fn fetch(
        &self,
        artifact: ArtifactKind,
        progress: &ArtifactProgress,
    ) -> Result<Vec<u8>, FetchError>;
}

/// Retry budget for a single artifact
#[derive(Debug, Clone)]
pub struct FetchPolicy {
    /// Retries after the first attempt
    pub max_retries: u32,
    pub initial_backoff: Duration,
    pub backoff_multiplier: u32,
}

impl Default for FetchPolicy {
    fn default() -> Self {
        Self {
            max_retries: 1,
            initial_backoff: Duration::from_secs(1),
            backoff_multiplier: 4,
        }
    }
}

/// Fetch with bounded exponential backoff
///
/// Only [`FetchError::Transient`] is retried. The number of attempts is
/// `1 + max_retries`, so an unreachable source fails in finite time.
pub async fn fetch_with_retry(
    store: &dyn ArtifactStore,
    artifact: ArtifactKind,
    policy: &FetchPolicy,
    progress: &ArtifactProgress,
) -> Result<Vec<u8>, LoadError> {
    let mut backoff = policy.initial_backoff;
    let mut attempt = 0u32;

    loop {
        attempt += 1;
        progress.reset();

        match store.fetch(artifact, progress).await {
            Ok(bytes) => {
                if attempt > 1 {
                    debug!(artifact = %artifact, attempt, "Artifact fetch succeeded after retry");
                }
                return Ok(bytes);
            }
            Err(FetchError::MissingUrl) => {
                return Err(LoadError::MissingUrl {
                    artifact,
                    env_var: artifact.url_env_var(),
                });
            }
            Err(FetchError::Permanent(reason)) => {
                return Err(LoadError::Fetch { artifact, reason });
            }
            Err(FetchError::Transient(reason)) => {
                if attempt > policy.max_retries {
                    return Err(LoadError::TransientFetch {
                        artifact,
                        attempts: attempt,
                        reason,
                    });
                }

                warn!(
                    artifact = %artifact,
                    attempt,
                    backoff_ms = backoff.as_millis() as u64,
                    error = %reason,
                    "Artifact fetch failed, retrying"
                );
                tokio::time::sleep(backoff).await;
                backoff = backoff.saturating_mul(policy.backoff_multiplier.max(1));
            }
        }
    }
}

/// Download URL per artifact
#[derive(Debug, Clone, Default)]
pub struct ArtifactUrls {
    urls: HashMap<ArtifactKind, String>,
}

impl ArtifactUrls {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, artifact: ArtifactKind, url: impl Into<String>) -> Self {
        self.set(artifact, url);
        self
    }

    /// Blank URLs are ignored
    pub fn set(&mut self, artifact: ArtifactKind, url: impl Into<String>) {
        let url = url.into();
        if !url.trim().is_empty() {
            self.urls.insert(artifact, url);
        }
    }

    pub fn get(&self, artifact: ArtifactKind) -> Option<&str> {
        self.urls.get(&artifact).map(String::as_str)
    }

    pub fn missing(&self) -> Vec<ArtifactKind> {
        ArtifactKind::LOAD_ORDER
            .into_iter()
            .filter(|a| !self.urls.contains_key(a))
            .collect()
    }
}

/// Streams artifacts over HTTP(S)
pub struct HttpArtifactStore {
    http_client: reqwest::Client,
    urls: ArtifactUrls,
}

impl HttpArtifactStore {
    pub fn new(urls: ArtifactUrls, request_timeout: Duration) -> Result<Self, FetchError> {
        let http_client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(request_timeout)
            .build()
            .map_err(|e| FetchError::Permanent(e.to_string()))?;

        Ok(Self { http_client, urls })
    }
}

fn classify(err: reqwest::Error) -> FetchError {
    if err.is_timeout() || err.is_connect() || err.is_request() || err.is_body() {
        FetchError::Transient(err.to_string())
    } else {
        FetchError::Permanent(err.to_string())
    }
}

fn initial_capacity(content_length: u64) -> usize {
    usize::try_from(content_length.min(MAX_PREALLOC_BYTES)).unwrap_or(0)
}

#[async_trait]
impl ArtifactStore for HttpArtifactStore {
    async fn fetch(
        &self,
        artifact: ArtifactKind,
        progress: &ArtifactProgress,
    ) -> Result<Vec<u8>, FetchError> {
        let url = self.urls.get(artifact).ok_or(FetchError::MissingUrl)?;

        debug!(artifact = %artifact, "Requesting artifact");
        let mut response = self.http_client.get(url).send().await.map_err(classify)?;

        let status = response.status();
        if status.is_server_error() || status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(FetchError::Transient(format!("HTTP {}", status)));
        }
        if !status.is_success() {
            return Err(FetchError::Permanent(format!("HTTP {}", status)));
        }

        let expected = response.content_length().unwrap_or(0);
        progress.set_expected(expected);

        // the header is only a hint; the buffer grows with the chunks
        let mut body = Vec::with_capacity(initial_capacity(expected));
        while let Some(chunk) = response.chunk().await.map_err(classify)? {
            progress.add_downloaded(chunk.len() as u64);
            body.extend_from_slice(&chunk);
        }

        if expected > 0 && body.len() as u64 != expected {
            return Err(FetchError::Transient(format!(
                "truncated body: {} of {} bytes",
                body.len(),
                expected
            )));
        }

        Ok(body)
    }
}

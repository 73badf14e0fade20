//! # Remote-Proxy Backend
//!
//! [`StorageAdapter`] that forwards every call to a server's generic
//! collection API instead of keeping data locally.
//!
//! ## Request Mapping
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  connect()                  GET    /status          (health timeout)    │
//! │  get_collection(c)          GET    /{c}             404 → []            │
//! │  get_document(c, id)        GET    /{c}/{id}        404 → None          │
//! │  save_document(c, r)        PUT    /{c}/{id}                            │
//! │  save_collection(c, rs)     PUT    /{c}/{id}  × n   (no bulk replace)   │
//! │  delete_document(c, id)     DELETE /{c}/{id}        404 → Ok            │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The endpoint is validated before every request. A base URL that is
//! empty, unparsable, not http(s), hostless, or carries a placeholder such
//! as `undefined` fails with [`StoreError::Configuration`] and nothing is
//! sent.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Response, StatusCode};
use tracing::{debug, info, warn};
use url::Url;

use till_core::Record;

use crate::adapter::StorageAdapter;
use crate::error::{StoreError, StoreResult};

/// Tokens that show an endpoint was assembled from an unset variable.
const PLACEHOLDERS: &[&str] = &["undefined", "null"];

/// Remote-proxy backend configuration.
#[derive(Debug, Clone)]
pub struct RemoteConfig {
    /// Server base URL, e.g. `http://10.0.0.5:8080/api`.
    pub base_url: String,
    /// Timeout for collection requests.
    pub request_timeout: Duration,
    /// Timeout for the `/status` probe.
    pub health_timeout: Duration,
}

impl RemoteConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        RemoteConfig {
            base_url: base_url.into(),
            request_timeout: Duration::from_secs(20),
            health_timeout: Duration::from_secs(3),
        }
    }
}

/// Backend that proxies every operation to a server.
#[derive(Debug, Clone)]
pub struct RemoteStore {
    config: RemoteConfig,
    client: Client,
}

impl RemoteStore {
    /// Creates the store. The URL is checked on use, not here.
    pub fn new(config: RemoteConfig) -> StoreResult<Self> {
        let client = Client::builder()
            .timeout(config.request_timeout)
            .user_agent(concat!("till-store/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| StoreError::Configuration(format!("HTTP client: {e}")))?;

        Ok(RemoteStore { config, client })
    }

    /// Validated base URL.
    pub fn base_url(&self) -> StoreResult<Url> {
        validate_endpoint(&self.config.base_url)
    }

    /// Builds `{base}/{segments...}` with each segment percent-encoded.
    fn endpoint(&self, segments: &[&str]) -> StoreResult<Url> {
        let mut url = self.base_url()?;
        {
            let mut path = url.path_segments_mut().map_err(|_| {
                StoreError::Configuration(format!("base URL cannot have a path: {}", self.config.base_url))
            })?;
            path.pop_if_empty();
            for segment in segments {
                path.push(segment);
            }
        }
        Ok(url)
    }

    async fn put(&self, collection: &str, record: &Record) -> StoreResult<()> {
        let url = self.endpoint(&[collection, record.id()])?;
        let response = self.client.put(url).json(record).send().await?;
        ensure_success(response).await?;
        Ok(())
    }
}

/// Checks a base URL without touching the network.
pub fn validate_endpoint(raw: &str) -> StoreResult<Url> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(StoreError::Configuration("remote base URL is empty".into()));
    }

    let lowered = trimmed.to_ascii_lowercase();
    if let Some(token) = lowered
        .split(|c: char| !c.is_ascii_alphanumeric())
        .find(|token| PLACEHOLDERS.contains(token))
    {
        return Err(StoreError::Configuration(format!(
            "remote base URL contains placeholder '{token}': {trimmed}"
        )));
    }

    let url = Url::parse(trimmed)
        .map_err(|e| StoreError::Configuration(format!("invalid remote base URL '{trimmed}': {e}")))?;

    if !matches!(url.scheme(), "http" | "https") {
        return Err(StoreError::Configuration(format!(
            "remote base URL must be http(s), got '{}'",
            url.scheme()
        )));
    }
    if url.host_str().map_or(true, str::is_empty) {
        return Err(StoreError::Configuration(format!(
            "remote base URL has no host: {trimmed}"
        )));
    }

    Ok(url)
}

/// Turns a non-2xx response into [`StoreError::Rejected`].
async fn ensure_success(response: Response) -> StoreResult<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let message = response.text().await.unwrap_or_default();
    Err(StoreError::Rejected {
        status: status.as_u16(),
        message,
    })
}

#[async_trait]
impl StorageAdapter for RemoteStore {
    fn backend_name(&self) -> &'static str {
        "remote"
    }

    async fn connect(&self) -> StoreResult<()> {
        let url = self.endpoint(&["status"])?;
        let response = self
            .client
            .get(url)
            .timeout(self.config.health_timeout)
            .send()
            .await?;
        ensure_success(response).await?;
        info!(base_url = %self.config.base_url, "Remote store reachable");
        Ok(())
    }

    async fn disconnect(&self) -> StoreResult<()> {
        Ok(())
    }

    async fn get_collection(&self, name: &str) -> StoreResult<Vec<Record>> {
        let url = self.endpoint(&[name])?;
        let response = self.client.get(url).send().await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(Vec::new());
        }
        let bytes = ensure_success(response).await?.bytes().await?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// Issues one `PUT` per record. Bulk replace is never sent to a server:
    /// records other terminals added would be wiped. The first failure stops
    /// the loop and reports how far it got.
    async fn save_collection(&self, name: &str, records: Vec<Record>) -> StoreResult<()> {
        let total = records.len();
        for (written, record) in records.iter().enumerate() {
            if let Err(e) = self.put(name, record).await {
                warn!(collection = %name, written, total, error = %e, "Remote bulk save stopped");
                return Err(StoreError::PartialWrite {
                    written,
                    total,
                    source: Box::new(e),
                });
            }
        }
        debug!(collection = %name, total, "Remote bulk save complete");
        Ok(())
    }

    async fn save_document(&self, name: &str, record: Record) -> StoreResult<()> {
        self.put(name, &record).await
    }

    async fn get_document(&self, name: &str, id: &str) -> StoreResult<Option<Record>> {
        let url = self.endpoint(&[name, id])?;
        let response = self.client.get(url).send().await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let bytes = ensure_success(response).await?.bytes().await?;
        Ok(Some(serde_json::from_slice(&bytes)?))
    }

    async fn delete_document(&self, name: &str, id: &str) -> StoreResult<()> {
        let url = self.endpoint(&[name, id])?;
        let response = self.client.delete(url).send().await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(());
        }
        ensure_success(response).await?;
        Ok(())
    }
}

//! # Sync Server Client
//!
//! [`SyncApi`] is the seam between the engine and the network. Production
//! uses [`HttpSyncApi`]; tests plug in an in-process fake.
//!
//! ## Request Policy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  request ──► per-request timeout ──► response                           │
//! │                                         │                               │
//! │        2xx ──► decode envelope ─────────┤                               │
//! │        401 ──► Unauthorized (drop token)│                               │
//! │      other ──► ServerRejection          │                               │
//! │                                                                         │
//! │  GET + transport failure ──► backoff ──► retry (max_request_retries)    │
//! │  POST + transport failure ──► fail now; next cycle re-sends             │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::time::Duration;

use async_trait::async_trait;
use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use reqwest::{Client, RequestBuilder, StatusCode};
use tracing::{debug, warn};
use url::Url;

use till_core::{Record, StockMovement};
use till_store::remote::validate_endpoint;

use crate::config::ServerSettings;
use crate::error::{SyncError, SyncResult};
use crate::protocol::{
    decode_envelope, AuthRequest, AuthResponse, DeltaResponse, MovementAck, MovementPush,
    TransactionAck, TransactionPush, TOKEN_HEADER,
};

// =============================================================================
// SyncApi Trait
// =============================================================================

/// Operations the engine needs from the sync server.
#[async_trait]
pub trait SyncApi: Send + Sync {
    /// Connectivity probe (`GET /status`).
    async fn health(&self) -> SyncResult<()>;

    /// Requests a session token for a terminal.
    async fn authenticate(&self, terminal_id: &str) -> SyncResult<AuthResponse>;

    /// Pulls changes for one collection since a watermark, or everything.
    async fn pull_delta(
        &self,
        token: &str,
        collection: &str,
        since: Option<&str>,
    ) -> SyncResult<DeltaResponse>;

    /// Pushes transaction-like records.
    async fn push_transactions(&self, token: &str, items: &[Record])
        -> SyncResult<TransactionAck>;

    /// Pushes inventory-movement ledger entries.
    async fn push_movements(&self, token: &str, items: &[StockMovement])
        -> SyncResult<MovementAck>;
}

// =============================================================================
// HTTP Implementation
// =============================================================================

/// [`SyncApi`] over HTTP.
#[derive(Debug, Clone)]
pub struct HttpSyncApi {
    base: Url,
    client: Client,
    settings: ServerSettings,
}

impl HttpSyncApi {
    /// Creates a client.
    ///
    /// ## Errors
    /// [`SyncError::InvalidConfig`] if the URL is missing or detectably
    /// wrong. No request is sent in that case.
    pub fn new(settings: ServerSettings) -> SyncResult<Self> {
        let raw = settings
            .url
            .as_deref()
            .ok_or_else(|| SyncError::InvalidConfig("server URL is not set".into()))?;
        let base = validate_endpoint(raw).map_err(|e| SyncError::InvalidConfig(e.to_string()))?;

        let client = Client::builder()
            .timeout(settings.request_timeout())
            .user_agent(concat!("till-sync/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| SyncError::InvalidConfig(format!("HTTP client: {e}")))?;

        Ok(HttpSyncApi {
            base,
            client,
            settings,
        })
    }

    /// `{base}/{segments...}` with each segment percent-encoded.
    fn endpoint(&self, segments: &[&str]) -> SyncResult<Url> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|_| SyncError::InvalidConfig("server URL cannot have a path".into()))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn create_backoff(&self) -> ExponentialBackoff {
        ExponentialBackoff {
            initial_interval: Duration::from_millis(self.settings.initial_backoff_ms),
            max_interval: Duration::from_millis(self.settings.max_backoff_ms),
            multiplier: 2.0,
            max_elapsed_time: None,
            ..Default::default()
        }
    }

    /// Sends a request once and classifies the response.
    async fn send_once(request: RequestBuilder) -> SyncResult<Vec<u8>> {
        let response = request.send().await?;
        let status = response.status();

        if status == StatusCode::UNAUTHORIZED {
            return Err(SyncError::Unauthorized);
        }
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(SyncError::ServerRejection {
                status: status.as_u16(),
                message,
            });
        }

        Ok(response.bytes().await?.to_vec())
    }

    /// Sends an idempotent GET, retrying transport failures with backoff.
    async fn get_with_retry<F>(&self, build: F) -> SyncResult<Vec<u8>>
    where
        F: Fn() -> RequestBuilder,
    {
        let mut backoff = self.create_backoff();
        let mut attempt = 0u32;

        loop {
            match Self::send_once(build()).await {
                Err(SyncError::Transport(reason)) if attempt < self.settings.max_request_retries => {
                    attempt += 1;
                    let delay = backoff
                        .next_backoff()
                        .unwrap_or_else(|| Duration::from_millis(self.settings.max_backoff_ms));
                    warn!(attempt, ?delay, reason = %reason, "GET failed, retrying");
                    tokio::time::sleep(delay).await;
                }
                other => return other,
            }
        }
    }
}

#[async_trait]
impl SyncApi for HttpSyncApi {
    async fn health(&self) -> SyncResult<()> {
        let url = self.endpoint(&["status"])?;
        let response = self
            .client
            .get(url)
            .timeout(self.settings.health_timeout())
            .send()
            .await?;

        if response.status().is_success() {
            Ok(())
        } else {
            Err(SyncError::ServerRejection {
                status: response.status().as_u16(),
                message: "health check failed".into(),
            })
        }
    }

    async fn authenticate(&self, terminal_id: &str) -> SyncResult<AuthResponse> {
        let url = self.endpoint(&["sync", "auth"])?;
        let body = AuthRequest {
            terminal_id: terminal_id.to_string(),
        };

        debug!(terminal_id = %terminal_id, "Requesting session token");
        match Self::send_once(self.client.post(url).json(&body)).await {
            Ok(bytes) => decode_envelope(&bytes).map_err(|e| match e {
                SyncError::ServerFailure(message) => SyncError::AuthRejected(message),
                other => other,
            }),
            Err(SyncError::Unauthorized) => {
                Err(SyncError::AuthRejected("terminal not allowed".into()))
            }
            Err(SyncError::ServerRejection { status: 403, message }) => {
                Err(SyncError::AuthRejected(message))
            }
            Err(e) => Err(e),
        }
    }

    async fn pull_delta(
        &self,
        token: &str,
        collection: &str,
        since: Option<&str>,
    ) -> SyncResult<DeltaResponse> {
        let mut url = self.endpoint(&["sync", "delta", collection])?;
        if let Some(since) = since {
            url.query_pairs_mut().append_pair("since", since);
        }

        let bytes = self
            .get_with_retry(|| self.client.get(url.clone()).header(TOKEN_HEADER, token))
            .await?;
        decode_envelope(&bytes)
    }

    async fn push_transactions(
        &self,
        token: &str,
        items: &[Record],
    ) -> SyncResult<TransactionAck> {
        let url = self.endpoint(&["sync", "transactions"])?;
        let body = TransactionPush {
            items: items.to_vec(),
        };
        let bytes = Self::send_once(self.client.post(url).header(TOKEN_HEADER, token).json(&body))
            .await?;
        decode_envelope(&bytes)
    }

    async fn push_movements(
        &self,
        token: &str,
        items: &[StockMovement],
    ) -> SyncResult<MovementAck> {
        let url = self.endpoint(&["sync", "inventory", "movements"])?;
        let body = MovementPush {
            items: items.to_vec(),
        };
        let bytes = Self::send_once(self.client.post(url).header(TOKEN_HEADER, token).json(&body))
            .await?;
        decode_envelope(&bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::extract::{Path, Query};
    use axum::http::{HeaderMap, StatusCode as AxumStatus};
    use axum::routing::{get, post};
    use axum::{Json, Router};
    use serde_json::{json, Value};
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    async fn serve(app: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}")
    }

    fn api(url: &str) -> HttpSyncApi {
        HttpSyncApi::new(ServerSettings {
            url: Some(url.to_string()),
            initial_backoff_ms: 1,
            max_backoff_ms: 5,
            ..ServerSettings::default()
        })
        .unwrap()
    }

    fn router() -> Router {
        Router::new()
            .route("/status", get(|| async { "ok" }))
            .route(
                "/sync/auth",
                post(|Json(body): Json<Value>| async move {
                    Json(json!({
                        "success": true,
                        "token": "tok-1",
                        "terminalId": body["terminalId"],
                        "expiresIn": 3600
                    }))
                }),
            )
            .route(
                "/sync/delta/{collection}",
                get(
                    |Path(collection): Path<String>,
                     Query(query): Query<HashMap<String, String>>,
                     headers: HeaderMap| async move {
                        if headers.get("X-Sync-Token").and_then(|v| v.to_str().ok()) != Some("tok-1") {
                            return Err(AxumStatus::UNAUTHORIZED);
                        }
                        Ok(Json(json!({
                            "success": true,
                            "items": [{ "id": format!("{collection}-1") }],
                            "isFullDownload": !query.contains_key("since"),
                            "serverTime": "2024-05-01T10:00:00Z"
                        })))
                    },
                ),
            )
            .route(
                "/sync/inventory/movements",
                post(|Json(body): Json<Value>| async move {
                    let ids: Vec<Value> = body["items"]
                        .as_array()
                        .map(|items| items.iter().map(|i| i["id"].clone()).collect())
                        .unwrap_or_default();
                    Json(json!({
                        "success": true,
                        "addedCount": ids.len(),
                        "processedIds": ids
                    }))
                }),
            )
            .route(
                "/sync/transactions",
                post(|| async { (AxumStatus::UNPROCESSABLE_ENTITY, "bad transaction") }),
            )
    }

    #[test]
    fn test_misconfigured_url_fails_fast() {
        for url in [None, Some("".to_string()), Some("http://undefined".to_string())] {
            let settings = ServerSettings {
                url,
                ..ServerSettings::default()
            };
            assert!(HttpSyncApi::new(settings).unwrap_err().is_config_error());
        }
    }

    #[tokio::test]
    async fn test_auth_and_pull() {
        let base = serve(router()).await;
        let api = api(&base);

        api.health().await.unwrap();

        let auth = api.authenticate("term-1").await.unwrap();
        assert_eq!(auth.token, "tok-1");
        assert_eq!(auth.terminal_id, "term-1");

        let full = api.pull_delta("tok-1", "products", None).await.unwrap();
        assert!(full.is_full_download);
        assert_eq!(full.items[0]["id"], "products-1");

        let delta = api
            .pull_delta("tok-1", "products", Some("2024-05-01T09:00:00.000Z"))
            .await
            .unwrap();
        assert!(!delta.is_full_download);
    }

    #[tokio::test]
    async fn test_bad_token_is_unauthorized() {
        let base = serve(router()).await;
        let err = api(&base)
            .pull_delta("stale", "products", None)
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::Unauthorized));
    }

    #[tokio::test]
    async fn test_push_movements_and_rejection() {
        let base = serve(router()).await;
        let api = api(&base);

        let movements = vec![StockMovement::new("P1", "W1", 1), StockMovement::new("P1", "W1", 2)];
        let ack = api.push_movements("tok-1", &movements).await.unwrap();
        assert_eq!(ack.added_count, 2);
        assert_eq!(ack.processed_ids, vec![movements[0].id.clone(), movements[1].id.clone()]);

        let err = api
            .push_transactions("tok-1", &[Record::new("t1")])
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::ServerRejection { status: 422, .. }));
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn test_get_retries_then_gives_up() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let err = api(&format!("http://{addr}"))
            .pull_delta("tok", "products", None)
            .await
            .unwrap_err();
        assert!(err.is_offline());
    }

    #[tokio::test]
    async fn test_server_error_is_not_retried_as_transport() {
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        let app = Router::new().route(
            "/sync/delta/{collection}",
            get(move || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    AxumStatus::SERVICE_UNAVAILABLE
                }
            }),
        );
        let base = serve(app).await;

        let err = api(&base)
            .pull_delta("tok", "products", None)
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::ServerRejection { status: 503, .. }));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }
}

//! # Terminal Identity & Session
//!
//! A terminal has a stable id (generated once, persisted in the `_terminal`
//! collection) and, while online, a short-lived session token obtained from
//! `POST /sync/auth`.
//!
//! ## Token Lifecycle
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                                                         │
//! │   restore() ──► persisted token still usable? ──yes──► held in memory   │
//! │                                                                         │
//! │   ensure_session()                                                      │
//! │     ├─ held token usable ─────────────────────────────► return it       │
//! │     └─ none / near expiry ──► POST /sync/auth ──► hold + persist        │
//! │                                                                         │
//! │   invalidate()   (401 from server)    ──► clear memory + persisted      │
//! │   logout()                            ──► clear memory + persisted      │
//! │   reidentify(id) (new terminal id)    ──► persist id, clear token       │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::sync::Arc;

use chrono::{SecondsFormat, Utc};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use uuid::Uuid;

use till_core::collection::TERMINAL;
use till_core::{Record, SessionToken};
use till_store::StorageAdapter;

use crate::client::SyncApi;
use crate::error::{SyncError, SyncResult};

/// `_terminal` document holding the identity.
const IDENTITY_DOC: &str = "identity";

/// `_terminal` document holding the persisted session token.
const SESSION_DOC: &str = "session";

/// Field of the identity document holding the terminal id.
const TERMINAL_ID_FIELD: &str = "terminalId";

// =============================================================================
// Identity
// =============================================================================

/// Loads the persisted terminal id, creating one if needed.
///
/// A configured id wins over the persisted one and replaces it. Otherwise
/// the persisted id is reused, and on first run a UUID is generated.
pub async fn load_or_create_identity(
    store: &dyn StorageAdapter,
    configured: Option<&str>,
) -> SyncResult<String> {
    let persisted = store
        .get_document(TERMINAL, IDENTITY_DOC)
        .await?
        .and_then(|doc| doc.get_str(TERMINAL_ID_FIELD).map(str::to_string));

    match (configured, persisted) {
        (Some(configured), Some(persisted)) if configured == persisted => Ok(persisted),
        (Some(configured), _) => {
            info!(terminal_id = %configured, "Using configured terminal id");
            persist_identity(store, configured).await?;
            Ok(configured.to_string())
        }
        (None, Some(persisted)) => {
            debug!(terminal_id = %persisted, "Loaded terminal id");
            Ok(persisted)
        }
        (None, None) => {
            let id = Uuid::new_v4().to_string();
            info!(terminal_id = %id, "Generated new terminal id");
            persist_identity(store, &id).await?;
            Ok(id)
        }
    }
}

async fn persist_identity(store: &dyn StorageAdapter, terminal_id: &str) -> SyncResult<()> {
    let doc = Record::new(IDENTITY_DOC)
        .with(TERMINAL_ID_FIELD, terminal_id)
        .with(
            "updatedAt",
            Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
        );
    store.save_document(TERMINAL, doc).await?;
    Ok(())
}

// =============================================================================
// Session Manager
// =============================================================================

/// Holds the terminal id and session token, authenticating on demand.
pub struct SessionManager {
    store: Arc<dyn StorageAdapter>,
    api: Arc<dyn SyncApi>,
    terminal_id: RwLock<String>,
    token: RwLock<Option<SessionToken>>,
}

impl SessionManager {
    pub fn new(
        store: Arc<dyn StorageAdapter>,
        api: Arc<dyn SyncApi>,
        terminal_id: impl Into<String>,
    ) -> Self {
        SessionManager {
            store,
            api,
            terminal_id: RwLock::new(terminal_id.into()),
            token: RwLock::new(None),
        }
    }

    /// Current terminal id.
    pub async fn terminal_id(&self) -> String {
        self.terminal_id.read().await.clone()
    }

    /// Reloads a persisted token if it is still usable by this terminal.
    ///
    /// Returns whether a token was restored. An unreadable or stale
    /// persisted token is discarded.
    pub async fn restore(&self) -> SyncResult<bool> {
        let Some(doc) = self.store.get_document(TERMINAL, SESSION_DOC).await? else {
            return Ok(false);
        };

        let terminal_id = self.terminal_id().await;
        match SessionToken::from_record(&doc) {
            Ok(token) if token.is_usable_by(&terminal_id, Utc::now()) => {
                debug!(expires_at = %token.expires_at(), "Restored session token");
                *self.token.write().await = Some(token);
                Ok(true)
            }
            Ok(_) => {
                debug!("Persisted session token is stale, discarding");
                self.store.delete_document(TERMINAL, SESSION_DOC).await?;
                Ok(false)
            }
            Err(e) => {
                warn!(error = %e, "Unreadable persisted session token, discarding");
                self.store.delete_document(TERMINAL, SESSION_DOC).await?;
                Ok(false)
            }
        }
    }

    /// True when a usable token is held.
    pub async fn has_valid_token(&self) -> bool {
        let terminal_id = self.terminal_id().await;
        self.token
            .read()
            .await
            .as_ref()
            .is_some_and(|t| t.is_usable_by(&terminal_id, Utc::now()))
    }

    /// Returns a usable token value, authenticating first if needed.
    pub async fn ensure_session(&self) -> SyncResult<String> {
        let terminal_id = self.terminal_id().await;

        {
            let guard = self.token.read().await;
            if let Some(token) = guard.as_ref() {
                if token.is_usable_by(&terminal_id, Utc::now()) {
                    return Ok(token.value.clone());
                }
            }
        }

        let mut guard = self.token.write().await;

        // Double-check after acquiring write lock
        if let Some(token) = guard.as_ref() {
            if token.is_usable_by(&terminal_id, Utc::now()) {
                return Ok(token.value.clone());
            }
        }

        let token = self
            .api
            .authenticate(&terminal_id)
            .await?
            .into_session(&terminal_id)?;

        info!(
            terminal_id = %terminal_id,
            expires_at = %token.expires_at(),
            "Authenticated with sync server"
        );

        let record = token.to_record(SESSION_DOC)?;
        self.store.save_document(TERMINAL, record).await?;

        let value = token.value.clone();
        *guard = Some(token);
        Ok(value)
    }

    /// Drops the held token after the server refused it.
    pub async fn invalidate(&self) -> SyncResult<()> {
        let had_token = self.token.write().await.take().is_some();
        self.store.delete_document(TERMINAL, SESSION_DOC).await?;
        if had_token {
            info!("Session token invalidated");
        }
        Ok(())
    }

    /// Clears the session from memory and storage.
    pub async fn logout(&self) -> SyncResult<()> {
        self.token.write().await.take();
        self.store.delete_document(TERMINAL, SESSION_DOC).await?;
        info!("Logged out");
        Ok(())
    }

    /// Switches to a new terminal id and clears the session.
    pub async fn reidentify(&self, new_terminal_id: &str) -> SyncResult<()> {
        if new_terminal_id.trim().is_empty() {
            return Err(SyncError::InvalidConfig("terminal id is empty".into()));
        }

        persist_identity(self.store.as_ref(), new_terminal_id).await?;
        let previous = std::mem::replace(
            &mut *self.terminal_id.write().await,
            new_terminal_id.to_string(),
        );
        self.logout().await?;

        info!(from = %previous, to = %new_terminal_id, "Terminal re-identified");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{AuthResponse, DeltaResponse, MovementAck, TransactionAck};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use till_core::StockMovement;
    use till_store::KeyValueStore;

    #[derive(Default)]
    struct AuthOnly {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl SyncApi for AuthOnly {
        async fn health(&self) -> SyncResult<()> {
            Ok(())
        }

        async fn authenticate(&self, terminal_id: &str) -> SyncResult<AuthResponse> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(AuthResponse {
                success: true,
                token: format!("tok-{n}"),
                terminal_id: terminal_id.to_string(),
                expires_in: 3600,
            })
        }

        async fn pull_delta(&self, _: &str, _: &str, _: Option<&str>) -> SyncResult<DeltaResponse> {
            Err(SyncError::Transport("unused".into()))
        }

        async fn push_transactions(&self, _: &str, _: &[Record]) -> SyncResult<TransactionAck> {
            Err(SyncError::Transport("unused".into()))
        }

        async fn push_movements(&self, _: &str, _: &[StockMovement]) -> SyncResult<MovementAck> {
            Err(SyncError::Transport("unused".into()))
        }
    }

    fn setup() -> (Arc<KeyValueStore>, Arc<AuthOnly>, SessionManager) {
        let store = Arc::new(KeyValueStore::in_memory());
        let api = Arc::new(AuthOnly::default());
        let manager = SessionManager::new(store.clone(), api.clone(), "term-1");
        (store, api, manager)
    }

    #[tokio::test]
    async fn test_identity_generated_once() {
        let store = KeyValueStore::in_memory();
        let first = load_or_create_identity(&store, None).await.unwrap();
        let second = load_or_create_identity(&store, None).await.unwrap();
        assert_eq!(first, second);
        assert!(!first.is_empty());

        let configured = load_or_create_identity(&store, Some("till-7")).await.unwrap();
        assert_eq!(configured, "till-7");
        assert_eq!(load_or_create_identity(&store, None).await.unwrap(), "till-7");
    }

    #[tokio::test]
    async fn test_ensure_session_caches_and_persists() {
        let (store, api, manager) = setup();

        assert_eq!(manager.ensure_session().await.unwrap(), "tok-1");
        assert_eq!(manager.ensure_session().await.unwrap(), "tok-1");
        assert_eq!(api.calls.load(Ordering::SeqCst), 1);
        assert!(store.get_document(TERMINAL, SESSION_DOC).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_invalidate_forces_reauth() {
        let (store, api, manager) = setup();
        manager.ensure_session().await.unwrap();

        manager.invalidate().await.unwrap();
        assert!(!manager.has_valid_token().await);
        assert!(store.get_document(TERMINAL, SESSION_DOC).await.unwrap().is_none());

        assert_eq!(manager.ensure_session().await.unwrap(), "tok-2");
        assert_eq!(api.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_restore_after_restart() {
        let (store, api, manager) = setup();
        manager.ensure_session().await.unwrap();

        let restarted = SessionManager::new(store.clone(), api.clone(), "term-1");
        assert!(restarted.restore().await.unwrap());
        assert_eq!(restarted.ensure_session().await.unwrap(), "tok-1");
        assert_eq!(api.calls.load(Ordering::SeqCst), 1);

        // A token for another terminal is not reused
        let other = SessionManager::new(store.clone(), api.clone(), "term-2");
        assert!(!other.restore().await.unwrap());
    }

    #[tokio::test]
    async fn test_reidentify_clears_token() {
        let (store, _api, manager) = setup();
        manager.ensure_session().await.unwrap();

        manager.reidentify("term-9").await.unwrap();
        assert_eq!(manager.terminal_id().await, "term-9");
        assert!(!manager.has_valid_token().await);
        assert_eq!(
            load_or_create_identity(store.as_ref(), None).await.unwrap(),
            "term-9"
        );

        assert!(manager.reidentify("  ").await.is_err());
    }

    #[tokio::test]
    async fn test_logout_clears_everything() {
        let (store, _api, manager) = setup();
        manager.ensure_session().await.unwrap();
        manager.logout().await.unwrap();
        assert!(!manager.has_valid_token().await);
        assert!(!manager.restore().await.unwrap());
        assert!(store.get_document(TERMINAL, SESSION_DOC).await.unwrap().is_none());
    }
}

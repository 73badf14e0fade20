//! In-process fake sync server shared by the outbox, engine and runtime tests.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use serde_json::Value;

use till_core::{Record, StockMovement};

use crate::client::SyncApi;
use crate::error::{SyncError, SyncResult};
use crate::protocol::{AuthResponse, DeltaResponse, MovementAck, TransactionAck};

#[derive(Debug)]
pub(crate) struct FakeState {
    pub online: bool,
    pub auth_calls: usize,
    /// Server-side collections returned on a full download.
    pub collections: HashMap<String, Vec<Record>>,
    /// Items returned when the client sends a watermark.
    pub deltas: HashMap<String, Vec<Record>>,
    pub server_time: DateTime<Utc>,
    /// `(collection, since)` for every pull.
    pub pulls: Vec<(String, Option<String>)>,
    /// Pull of this collection answers 401 while the counter is non-zero.
    pub unauthorized_on: Option<(String, usize)>,
    /// Raw items appended to every pull of a collection.
    pub malformed: HashMap<String, Vec<Value>>,
    /// Pushes fail with a transport error while `/status` still answers.
    pub drop_pushes: bool,
    /// Items the server refuses with a 422.
    pub reject_ids: HashSet<String>,
    /// Movement ids accepted but left out of `processedIds`.
    pub withhold_ids: HashSet<String>,
    pub transactions: BTreeMap<String, Record>,
    pub movements: BTreeMap<String, StockMovement>,
    pub transaction_pushes: usize,
    pub movement_pushes: usize,
}

impl Default for FakeState {
    fn default() -> Self {
        FakeState {
            online: true,
            auth_calls: 0,
            collections: HashMap::new(),
            deltas: HashMap::new(),
            server_time: Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap(),
            pulls: Vec::new(),
            malformed: HashMap::new(),
            drop_pushes: false,
            unauthorized_on: None,
            reject_ids: HashSet::new(),
            withhold_ids: HashSet::new(),
            transactions: BTreeMap::new(),
            movements: BTreeMap::new(),
            transaction_pushes: 0,
            movement_pushes: 0,
        }
    }
}

#[derive(Debug, Default)]
pub(crate) struct FakeServer {
    pub state: Mutex<FakeState>,
}

impl FakeServer {
    pub fn with<R>(&self, f: impl FnOnce(&mut FakeState) -> R) -> R {
        f(&mut self.state.lock().unwrap())
    }

    fn check_online(state: &FakeState) -> SyncResult<()> {
        if state.online {
            Ok(())
        } else {
            Err(SyncError::Transport("connection refused".into()))
        }
    }

    fn check_push(state: &FakeState) -> SyncResult<()> {
        Self::check_online(state)?;
        if state.drop_pushes {
            return Err(SyncError::Transport("connection reset".into()));
        }
        Ok(())
    }

    fn check_rejected<'a>(state: &FakeState, mut ids: impl Iterator<Item = &'a str>) -> SyncResult<()> {
        match ids.find(|id| state.reject_ids.contains(*id)) {
            Some(id) => Err(SyncError::ServerRejection {
                status: 422,
                message: format!("invalid item {id}"),
            }),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl SyncApi for FakeServer {
    async fn health(&self) -> SyncResult<()> {
        self.with(|s| Self::check_online(s))
    }

    async fn authenticate(&self, terminal_id: &str) -> SyncResult<AuthResponse> {
        self.with(|s| {
            Self::check_online(s)?;
            s.auth_calls += 1;
            Ok(AuthResponse {
                success: true,
                token: format!("tok-{}", s.auth_calls),
                terminal_id: terminal_id.to_string(),
                expires_in: 3600,
            })
        })
    }

    async fn pull_delta(
        &self,
        _token: &str,
        collection: &str,
        since: Option<&str>,
    ) -> SyncResult<DeltaResponse> {
        self.with(|s| {
            Self::check_online(s)?;
            s.pulls.push((collection.to_string(), since.map(str::to_string)));

            if let Some((target, remaining)) = s.unauthorized_on.as_mut() {
                if target == collection && *remaining > 0 {
                    *remaining -= 1;
                    return Err(SyncError::Unauthorized);
                }
            }

            let (records, is_full_download) = match since {
                None => (s.collections.get(collection).cloned().unwrap_or_default(), true),
                Some(_) => (s.deltas.get(collection).cloned().unwrap_or_default(), false),
            };
            let mut items: Vec<Value> = records.into_iter().map(Value::from).collect();
            items.extend(s.malformed.get(collection).cloned().unwrap_or_default());
            Ok(DeltaResponse {
                success: true,
                items,
                is_full_download,
                server_time: s.server_time,
            })
        })
    }

    async fn push_transactions(&self, _token: &str, items: &[Record]) -> SyncResult<TransactionAck> {
        self.with(|s| {
            Self::check_push(s)?;
            s.transaction_pushes += 1;
            Self::check_rejected(s, items.iter().map(Record::id))?;

            let mut added = 0;
            for item in items {
                if s.transactions.insert(item.id().to_string(), item.clone()).is_none() {
                    added += 1;
                }
            }
            Ok(TransactionAck {
                success: true,
                added_count: added,
            })
        })
    }

    async fn push_movements(&self, _token: &str, items: &[StockMovement]) -> SyncResult<MovementAck> {
        self.with(|s| {
            Self::check_push(s)?;
            s.movement_pushes += 1;
            Self::check_rejected(s, items.iter().map(|m| m.id.as_str()))?;

            let mut added = 0;
            let mut processed = Vec::new();
            for item in items {
                if s.withhold_ids.contains(&item.id) {
                    continue;
                }
                if s.movements.insert(item.id.clone(), item.clone()).is_none() {
                    added += 1;
                }
                processed.push(item.id.clone());
            }
            Ok(MovementAck {
                success: true,
                added_count: added,
                processed_ids: processed,
            })
        })
    }
}

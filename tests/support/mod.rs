//! Shared test fixtures: an in-memory sync server implementing the
//! transport trait, plus an event recorder.

use cipherpad_core::api::{
    ApiClient, ApiError, AuthResponse, ChangePasswordRequest, ConflictEntry, ConflictType,
    RegisterRequest, Session, SignInRequest, SyncRequest, SyncResponse, User,
};
use cipherpad_core::crypto::sha256_hex;
use cipherpad_core::events::ApplicationEvent;
use cipherpad_core::keys::KeyParams;
use cipherpad_core::payload::RawPayload;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use uuid::Uuid;

#[derive(Clone)]
struct StoredItem {
    raw: RawPayload,
    seq: i64,
}

struct Account {
    user: User,
    server_password: String,
    key_params: KeyParams,
    items: BTreeMap<Uuid, StoredItem>,
}

#[derive(Default)]
struct ServerState {
    accounts: HashMap<String, Account>,
    sessions: HashMap<String, String>,
    seq: i64,
    clock: i64,
}

impl ServerState {
    fn next_seq(&mut self) -> i64 {
        self.seq += 1;
        self.seq
    }

    /// Strictly increasing microsecond timestamps.
    fn next_timestamp(&mut self) -> i64 {
        let now = chrono::Utc::now().timestamp_micros();
        self.clock = self.clock.max(now) + 1;
        self.clock
    }

    fn account_for_session(&self, session: &Session) -> Result<&str, ApiError> {
        self.sessions
            .get(&session.access_token)
            .map(String::as_str)
            .ok_or(ApiError::InvalidSession)
    }
}

/// In-memory stand-in for the sync server. Sees only what a real server
/// would: ciphertext, metadata and the server-password half of accounts.
#[derive(Default)]
pub struct MockServer {
    state: Mutex<ServerState>,
}

impl MockServer {
    pub fn new() -> Arc<MockServer> {
        Arc::new(MockServer::default())
    }

    fn issue_session(state: &mut ServerState, email: &str) -> Session {
        let token = Uuid::new_v4().to_string();
        state.sessions.insert(token.clone(), email.to_string());
        Session {
            access_token: token,
            expires_at: chrono::Utc::now().timestamp() + 3_600,
        }
    }

    /// Test hook: silently bump an item's server timestamp without
    /// advancing its sequence, so integrity hashes diverge while normal
    /// incremental syncs never re-deliver it.
    pub fn corrupt_touch_item(&self, email: &str, uuid: &Uuid) {
        let mut state = self.state.lock().unwrap();
        let timestamp = state.next_timestamp();
        if let Some(account) = state.accounts.get_mut(email) {
            if let Some(item) = account.items.get_mut(uuid) {
                item.raw.updated_at = timestamp;
            }
        }
    }

    /// Number of live (non-deleted) items stored for an account.
    pub fn live_item_count(&self, email: &str) -> usize {
        let state = self.state.lock().unwrap();
        state
            .accounts
            .get(email)
            .map(|a| a.items.values().filter(|i| !i.raw.deleted).count())
            .unwrap_or(0)
    }
}

impl ApiClient for MockServer {
    fn key_params(&self, email: &str) -> Result<KeyParams, ApiError> {
        let state = self.state.lock().unwrap();
        state
            .accounts
            .get(email)
            .map(|a| a.key_params.clone())
            .ok_or(ApiError::Server {
                status: 404,
                message: "No such account".to_string(),
            })
    }

    fn register(&self, request: &RegisterRequest) -> Result<AuthResponse, ApiError> {
        let mut state = self.state.lock().unwrap();
        if state.accounts.contains_key(&request.email) {
            return Err(ApiError::Server {
                status: 400,
                message: "Email already registered".to_string(),
            });
        }
        let user = User {
            uuid: Uuid::new_v4(),
            email: request.email.clone(),
        };
        state.accounts.insert(
            request.email.clone(),
            Account {
                user: user.clone(),
                server_password: request.password.clone(),
                key_params: request.key_params.clone(),
                items: BTreeMap::new(),
            },
        );
        let session = Self::issue_session(&mut state, &request.email);
        Ok(AuthResponse {
            user,
            session,
            key_params: None,
        })
    }

    fn sign_in(&self, request: &SignInRequest) -> Result<AuthResponse, ApiError> {
        let mut state = self.state.lock().unwrap();
        let account = state.accounts.get(&request.email).ok_or(ApiError::Server {
            status: 401,
            message: "Invalid credentials".to_string(),
        })?;
        if account.server_password != request.password {
            return Err(ApiError::Server {
                status: 401,
                message: "Invalid credentials".to_string(),
            });
        }
        let user = account.user.clone();
        let key_params = account.key_params.clone();
        let session = Self::issue_session(&mut state, &request.email);
        Ok(AuthResponse {
            user,
            session,
            key_params: Some(key_params),
        })
    }

    fn change_password(
        &self,
        request: &ChangePasswordRequest,
        session: &Session,
    ) -> Result<AuthResponse, ApiError> {
        let mut state = self.state.lock().unwrap();
        let email = state.account_for_session(session)?.to_string();
        let account = state.accounts.get_mut(&email).ok_or(ApiError::InvalidSession)?;
        if account.server_password != request.current_password {
            return Err(ApiError::Server {
                status: 401,
                message: "Current password incorrect".to_string(),
            });
        }
        account.server_password = request.new_password.clone();
        account.key_params = request.key_params.clone();
        let user = account.user.clone();
        let session = session.clone();
        Ok(AuthResponse {
            user,
            session,
            key_params: None,
        })
    }

    fn sync(&self, request: &SyncRequest, session: &Session) -> Result<SyncResponse, ApiError> {
        let mut state = self.state.lock().unwrap();
        let email = state.account_for_session(session)?.to_string();

        let since: i64 = request
            .cursor_token
            .as_deref()
            .or(request.sync_token.as_deref())
            .and_then(|t| t.parse().ok())
            .unwrap_or(0);

        // Apply uploads.
        let mut saved_items = Vec::new();
        let mut conflicts = Vec::new();
        let mut saved_uuids = Vec::new();
        for incoming in &request.items {
            let existing = state
                .accounts
                .get(&email)
                .and_then(|a| a.items.get(&incoming.uuid))
                .cloned();

            if let Some(existing) = &existing {
                // Stale base: the client last saw an older server copy.
                if existing.raw.updated_at != incoming.updated_at {
                    conflicts.push(ConflictEntry {
                        conflict_type: ConflictType::SyncConflict,
                        server_item: Some(existing.raw.clone()),
                        unsaved_item: Some(incoming.clone()),
                    });
                    continue;
                }
            }

            let timestamp = state.next_timestamp();
            let seq = state.next_seq();
            let mut stored = incoming.clone();
            stored.updated_at = timestamp;
            if stored.created_at == 0 {
                stored.created_at = timestamp;
            }
            stored.dirty = false;
            stored.dirtied_at = None;
            stored.last_sync_began = None;
            stored.last_sync_end = None;

            let account = state.accounts.get_mut(&email).unwrap();
            account.items.insert(
                stored.uuid,
                StoredItem {
                    raw: stored.clone(),
                    seq,
                },
            );

            let mut ack = stored.clone();
            ack.content = None;
            ack.enc_item_key = None;
            saved_items.push(ack);
            saved_uuids.push(stored.uuid);
        }

        // Collect downloads newer than the client's token, excluding the
        // items just saved in this request.
        let account = state.accounts.get(&email).unwrap();
        let mut pending: Vec<&StoredItem> = account
            .items
            .values()
            .filter(|item| item.seq > since && !saved_uuids.contains(&item.raw.uuid))
            .collect();
        pending.sort_by_key(|item| item.seq);

        let limit = request.limit.unwrap_or(100_000) as usize;
        let page: Vec<RawPayload> = pending
            .iter()
            .take(limit)
            .map(|item| item.raw.clone())
            .collect();
        let cursor_token = if pending.len() > limit {
            pending.get(limit - 1).map(|item| item.seq.to_string())
        } else {
            None
        };

        let integrity_hash = request.compute_integrity.then(|| {
            let mut timestamps: Vec<i64> = account
                .items
                .values()
                .filter(|item| !item.raw.deleted)
                .map(|item| item.raw.updated_at)
                .collect();
            timestamps.sort_unstable_by(|a, b| b.cmp(a));
            let joined = timestamps
                .iter()
                .map(i64::to_string)
                .collect::<Vec<_>>()
                .join(",");
            sha256_hex(&joined)
        });

        let sync_token = state.seq.to_string();
        Ok(SyncResponse {
            retrieved_items: page,
            saved_items,
            conflicts,
            sync_token,
            cursor_token,
            integrity_hash,
        })
    }

    fn sign_out(&self, session: &Session) -> Result<(), ApiError> {
        let mut state = self.state.lock().unwrap();
        state.sessions.remove(&session.access_token);
        Ok(())
    }
}

/// Records every published lifecycle event for assertions.
pub struct EventRecorder {
    events: Arc<Mutex<Vec<ApplicationEvent>>>,
}

impl EventRecorder {
    pub fn attach(bus: &cipherpad_core::events::EventBus) -> EventRecorder {
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        bus.add_observer(move |event| {
            sink.lock().unwrap().push(event);
        });
        EventRecorder { events }
    }

    pub fn contains(&self, event: ApplicationEvent) -> bool {
        self.events.lock().unwrap().contains(&event)
    }

    pub fn count(&self, event: ApplicationEvent) -> usize {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|e| **e == event)
            .count()
    }
}

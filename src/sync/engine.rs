//! The sync operation state machine.
//!
//! One sync runs at a time. Requests arriving mid-sync either resolve
//! with the next completed sync (`ResolveOnNext`) or enqueue a fresh
//! operation (`ForceSpawnNew`). Within a round the engine guarantees
//! persist-before-network for every dirty payload.

use crate::api::models::API_VERSION;
use crate::api::{ApiClient, ApiError, ConflictType, SyncRequest, SyncResponse};
use crate::events::{ApplicationEvent, EventBus, MAJOR_DATA_CHANGE_THRESHOLD};
use crate::payload::{Payload, PayloadManager, PayloadSource};
use crate::protocol::{EncryptionIntent, ProtocolService};
use crate::session::SessionService;
use crate::storage::{StorageService, LAST_SYNC_TOKEN_KEY, PAGINATION_TOKEN_KEY};
use crate::sync::deltas::{
    delta_out_of_sync, delta_remote_conflicts, delta_remote_rejected, delta_remote_retrieved,
    delta_remote_saved, delta_uuid_conflicts,
};
use crate::sync::integrity::{compute_integrity_hash, MAX_DISCORDANCE};
use crate::sync::SyncError;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Items requested per download page.
const DOWN_LIMIT: u32 = 150;
/// Cap on chained syncs within one operation (conflict duplicates
/// converge well before this).
const MAX_CHAINED_SYNCS: u32 = 5;
/// Cap on pagination rounds within one operation.
const MAX_PAGINATION_ROUNDS: u32 = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SyncMode {
    /// Upload dirty items, download changes.
    #[default]
    Default,
    /// Download first, upload nothing; used on first sign-in so existing
    /// items keys are discovered before new ones are created.
    Initial,
}

/// What to do when a sync is already in progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TimingStrategy {
    /// Piggy-back on the next completed sync.
    #[default]
    ResolveOnNext,
    /// Enqueue a fresh sync to run after the current one.
    ForceSpawnNew,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SyncOptions {
    pub mode: SyncMode,
    pub timing: TimingStrategy,
    pub check_integrity: bool,
}

/// Outcome of a sync request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncStatus {
    /// The operation ran to completion.
    Completed,
    /// An operation was already running; this request was queued per its
    /// timing strategy.
    Queued,
}

#[derive(Default)]
struct SyncState {
    in_progress: bool,
    pending_resolve: bool,
    spawn_queue: VecDeque<SyncOptions>,
    last_pre_sync_save: i64,
    discordance: u32,
    out_of_sync: bool,
    completed_initial_sync: bool,
}

/// The queued sync state machine.
pub struct SyncService {
    payloads: Arc<PayloadManager>,
    protocol: Arc<ProtocolService>,
    storage: Arc<StorageService>,
    api: Arc<dyn ApiClient>,
    session: Arc<SessionService>,
    events: Arc<EventBus>,
    state: Mutex<SyncState>,
}

impl SyncService {
    pub fn new(
        payloads: Arc<PayloadManager>,
        protocol: Arc<ProtocolService>,
        storage: Arc<StorageService>,
        api: Arc<dyn ApiClient>,
        session: Arc<SessionService>,
        events: Arc<EventBus>,
    ) -> Arc<SyncService> {
        Arc::new(SyncService {
            payloads,
            protocol,
            storage,
            api,
            session,
            events,
            state: Mutex::new(SyncState::default()),
        })
    }

    pub fn is_out_of_sync(&self) -> bool {
        self.state.lock().unwrap().out_of_sync
    }

    pub fn completed_initial_sync(&self) -> bool {
        self.state.lock().unwrap().completed_initial_sync
    }

    /// Run (or queue) a sync operation.
    pub fn sync(&self, options: SyncOptions) -> Result<SyncStatus, SyncError> {
        {
            let mut state = self.state.lock().unwrap();
            if state.in_progress {
                match options.timing {
                    TimingStrategy::ResolveOnNext => state.pending_resolve = true,
                    TimingStrategy::ForceSpawnNew => state.spawn_queue.push_back(options),
                }
                return Ok(SyncStatus::Queued);
            }
            state.in_progress = true;
        }

        let result = self.execute(options, 0);

        let (resolve, spawned) = {
            let mut state = self.state.lock().unwrap();
            state.in_progress = false;
            (
                std::mem::take(&mut state.pending_resolve),
                std::mem::take(&mut state.spawn_queue),
            )
        };

        if result.is_ok() {
            if resolve {
                self.sync(SyncOptions::default())?;
            }
            for queued in spawned {
                self.sync(queued)?;
            }
        }

        result.map(|_| SyncStatus::Completed)
    }

    fn execute(&self, options: SyncOptions, chain_depth: u32) -> Result<(), SyncError> {
        self.events.publish(ApplicationEvent::WillSync);
        let now = chrono::Utc::now().timestamp_micros();

        // Pre-flight: collect dirty items, drop never-uploaded deletions.
        let mut dirty = self.payloads.dirty_payloads();
        let never_uploaded: Vec<Payload> = dirty
            .iter()
            .filter(|p| p.deleted && p.never_synced())
            .cloned()
            .collect();
        if !never_uploaded.is_empty() {
            dirty.retain(|p| !(p.deleted && p.never_synced()));
            let tombstones: Vec<Payload> = never_uploaded
                .iter()
                .map(|p| p.to_builder().dirty(false).build())
                .collect();
            self.payloads
                .emit_payloads(tombstones, PayloadSource::LocalSaved);
            for payload in &never_uploaded {
                let _ = self.storage.remove_payload(&payload.uuid);
            }
        }

        // Crash-safety: persist anything dirtied since the last pre-sync
        // save before any network I/O.
        let last_save = self.state.lock().unwrap().last_pre_sync_save;
        let needs_save: Vec<Payload> = dirty
            .iter()
            .filter(|p| p.dirtied_at.unwrap_or(0) > last_save)
            .cloned()
            .collect();
        self.persist_payloads(&needs_save)?;
        self.state.lock().unwrap().last_pre_sync_save = now;

        let Some(mut session) = self.session.session() else {
            return self.complete_offline_round(dirty);
        };

        // Mark in-flight payloads so a mid-sync edit is detectable.
        let in_flight: Vec<Payload> = if options.mode == SyncMode::Initial {
            Vec::new()
        } else {
            dirty
                .iter()
                .map(|p| p.to_builder().last_sync_began(Some(now)).build())
                .collect()
        };
        if !in_flight.is_empty() {
            self.payloads
                .emit_payloads(in_flight.clone(), PayloadSource::LocalSaved);
        }

        let mut upload = Vec::with_capacity(in_flight.len());
        for payload in &in_flight {
            upload.push(
                self.protocol
                    .encrypt_payload(payload, EncryptionIntent::Sync)?
                    .to_wire(),
            );
        }

        let mut touched_total = 0usize;
        let mut rounds = 0u32;
        loop {
            let request = SyncRequest {
                api: API_VERSION.to_string(),
                items: std::mem::take(&mut upload),
                sync_token: self.storage.get_value(LAST_SYNC_TOKEN_KEY)?,
                cursor_token: self.storage.get_value(PAGINATION_TOKEN_KEY)?,
                limit: Some(DOWN_LIMIT),
                compute_integrity: options.check_integrity,
            };

            let response = match self.api.sync(&request, &session) {
                Ok(response) => response,
                Err(ApiError::InvalidSession) => {
                    // One reauthentication attempt, then one retry.
                    if !self.session.handle_invalid_session() {
                        self.events.publish(ApplicationEvent::FailedSync);
                        return Err(ApiError::InvalidSession.into());
                    }
                    session = self
                        .session
                        .session()
                        .ok_or(SyncError::Aborted("Reauthentication lost session".into()))?;
                    match self.api.sync(&request, &session) {
                        Ok(response) => response,
                        Err(e) => {
                            self.events.publish(ApplicationEvent::FailedSync);
                            return Err(e.into());
                        }
                    }
                }
                Err(e) => {
                    self.events.publish(ApplicationEvent::FailedSync);
                    return Err(e.into());
                }
            };

            self.storage
                .set_value(LAST_SYNC_TOKEN_KEY, &response.sync_token)?;
            match &response.cursor_token {
                Some(token) => self.storage.set_value(PAGINATION_TOKEN_KEY, token)?,
                None => self.storage.remove_value(PAGINATION_TOKEN_KEY)?,
            }

            touched_total += self.process_response(&response)?;

            if let Some(server_hash) = &response.integrity_hash {
                self.check_integrity(server_hash);
            }

            if response.cursor_token.is_none() {
                break;
            }
            rounds += 1;
            if rounds > MAX_PAGINATION_ROUNDS {
                warn!("pagination exceeded {} rounds; aborting", MAX_PAGINATION_ROUNDS);
                break;
            }
        }

        if options.mode == SyncMode::Initial {
            self.state.lock().unwrap().completed_initial_sync = true;
            self.events.publish(ApplicationEvent::CompletedFullSync);
            // Items keys are now known; run the held-back upload.
            self.execute(
                SyncOptions {
                    mode: SyncMode::Default,
                    ..options
                },
                chain_depth,
            )?;
        } else {
            self.events.publish(ApplicationEvent::CompletedIncrementalSync);
        }

        if touched_total >= MAJOR_DATA_CHANGE_THRESHOLD {
            self.events.publish(ApplicationEvent::MajorDataChange);
        }

        // Conflict duplicates come out dirty; chain a follow-up sync.
        if options.mode == SyncMode::Default && !self.payloads.dirty_payloads().is_empty() {
            if chain_depth < MAX_CHAINED_SYNCS {
                debug!(chain_depth, "dirty items remain; chaining sync");
                self.execute(options, chain_depth + 1)?;
            } else {
                warn!("chained sync limit reached with dirty items remaining");
            }
        }

        Ok(())
    }

    /// No account: persist dirty payloads locally and clear their flags.
    fn complete_offline_round(&self, dirty: Vec<Payload>) -> Result<(), SyncError> {
        if !dirty.is_empty() {
            let now = chrono::Utc::now().timestamp_micros();
            let cleaned: Vec<Payload> = dirty
                .iter()
                .map(|p| {
                    p.to_builder()
                        .dirty(false)
                        .dirtied_at(None)
                        .last_sync_end(Some(now))
                        .build()
                })
                .collect();
            self.persist_payloads(&cleaned)?;
            self.payloads
                .emit_payloads(cleaned, PayloadSource::LocalSaved);
        }
        self.events.publish(ApplicationEvent::CompletedIncrementalSync);
        Ok(())
    }

    fn process_response(&self, response: &SyncResponse) -> Result<usize, SyncError> {
        let mut touched = 0usize;

        // Retrieved items: decrypt, then reconcile against master.
        let retrieved: Vec<Payload> = response
            .retrieved_items
            .iter()
            .cloned()
            .map(Payload::from_raw)
            .map(|p| self.decrypt_incoming(p))
            .collect();
        if !retrieved.is_empty() {
            let base = self.payloads.master_collection();
            let result = delta_remote_retrieved(&base, &retrieved);
            touched += self.emit_and_persist(result.into_payloads(), PayloadSource::RemoteRetrieved)?;
        }

        // Saved items: metadata-only acknowledgements.
        let saved: Vec<Payload> = response
            .saved_items
            .iter()
            .cloned()
            .map(Payload::from_raw)
            .collect();
        if !saved.is_empty() {
            let base = self.payloads.master_collection();
            let result = delta_remote_saved(&base, &saved);
            touched += self.emit_and_persist(result.into_payloads(), PayloadSource::RemoteSaved)?;
        }

        // Conflicts: partition by kind.
        let mut conflict_items: Vec<Payload> = Vec::new();
        let mut uuid_conflicts: Vec<Uuid> = Vec::new();
        let mut rejected: Vec<Payload> = Vec::new();
        for entry in &response.conflicts {
            match entry.conflict_type {
                ConflictType::SyncConflict => match &entry.server_item {
                    Some(raw) => conflict_items
                        .push(self.decrypt_incoming(Payload::from_raw(raw.clone()))),
                    None => {
                        if let Some(raw) = &entry.unsaved_item {
                            rejected.push(Payload::from_raw(raw.clone()));
                        }
                    }
                },
                ConflictType::UuidConflict => {
                    if let Some(raw) = &entry.unsaved_item {
                        uuid_conflicts.push(raw.uuid);
                    }
                }
            }
        }

        if !conflict_items.is_empty() {
            let base = self.payloads.master_collection();
            let result = delta_remote_conflicts(&base, &conflict_items);
            touched += self.emit_and_persist(result.into_payloads(), PayloadSource::ConflictData)?;
        }
        if !uuid_conflicts.is_empty() {
            let base = self.payloads.master_collection();
            let result = delta_uuid_conflicts(&base, &uuid_conflicts);
            touched += self.emit_and_persist(result.into_payloads(), PayloadSource::ConflictUuid)?;
        }
        if !rejected.is_empty() {
            let base = self.payloads.master_collection();
            let result = delta_remote_rejected(&base, &rejected);
            touched += self.emit_and_persist(result.into_payloads(), PayloadSource::RemoteRejected)?;
        }

        Ok(touched)
    }

    fn decrypt_incoming(&self, payload: Payload) -> Payload {
        if payload.deleted || payload.content.is_absent() {
            return payload;
        }
        self.protocol.decrypt_payload(&payload)
    }

    fn emit_and_persist(
        &self,
        payloads: Vec<Payload>,
        source: PayloadSource,
    ) -> Result<usize, SyncError> {
        if payloads.is_empty() {
            return Ok(0);
        }
        let outcome = self.payloads.emit_payloads(payloads, source);
        let applied: Vec<Payload> = outcome.applied().cloned().collect();
        self.persist_payloads(&applied)?;
        for payload in &outcome.discarded {
            let _ = self.storage.remove_payload(&payload.uuid);
        }
        Ok(outcome.touched())
    }

    /// Persist payloads encrypted-at-rest when keys exist, falling back to
    /// the `000` framing per payload otherwise.
    fn persist_payloads(&self, payloads: &[Payload]) -> Result<(), SyncError> {
        if payloads.is_empty() {
            return Ok(());
        }
        let mut stored = Vec::with_capacity(payloads.len());
        for payload in payloads {
            let encrypted = self
                .protocol
                .encrypt_payload(payload, EncryptionIntent::LocalStorageEncrypted)
                .or_else(|_| {
                    self.protocol
                        .encrypt_payload(payload, EncryptionIntent::LocalStorageDecrypted)
                })?;
            stored.push(encrypted);
        }
        self.storage.save_payloads(&stored)?;
        Ok(())
    }

    fn check_integrity(&self, server_hash: &str) {
        let local_hash = {
            let payloads = self.payloads.all_payloads();
            compute_integrity_hash(payloads.iter())
        };

        let event = {
            let mut state = self.state.lock().unwrap();
            if local_hash == server_hash {
                state.discordance = 0;
                if state.out_of_sync {
                    state.out_of_sync = false;
                    Some(ApplicationEvent::ExitedOutOfSync)
                } else {
                    None
                }
            } else {
                state.discordance += 1;
                debug!(discordance = state.discordance, "integrity hash mismatch");
                if state.discordance > MAX_DISCORDANCE && !state.out_of_sync {
                    state.out_of_sync = true;
                    Some(ApplicationEvent::EnteredOutOfSync)
                } else {
                    None
                }
            }
        };
        if let Some(event) = event {
            self.events.publish(event);
        }
    }

    /// Recover from a detected divergence: download the full server state,
    /// reconcile through the out-of-sync delta, then run an
    /// integrity-checked sync.
    pub fn resolve_out_of_sync(&self) -> Result<SyncStatus, SyncError> {
        let session = self
            .session
            .session()
            .ok_or(SyncError::Aborted("No session".into()))?;
        info!("resolving out-of-sync state with full download");

        let mut cursor: Option<String> = None;
        let mut final_token: Option<String> = None;
        let mut rounds = 0u32;
        loop {
            let request = SyncRequest {
                api: API_VERSION.to_string(),
                items: Vec::new(),
                sync_token: None,
                cursor_token: cursor.clone(),
                limit: Some(DOWN_LIMIT),
                compute_integrity: false,
            };
            let response = self.api.sync(&request, &session).map_err(|e| {
                self.events.publish(ApplicationEvent::FailedSync);
                SyncError::from(e)
            })?;

            let incoming: Vec<Payload> = response
                .retrieved_items
                .iter()
                .cloned()
                .map(Payload::from_raw)
                .map(|p| self.decrypt_incoming(p))
                .collect();
            let base = self.payloads.master_collection();
            let result = delta_out_of_sync(&base, &incoming);
            self.emit_and_persist(result.into_payloads(), PayloadSource::RemoteRetrieved)?;

            final_token = Some(response.sync_token.clone());
            cursor = response.cursor_token.clone();
            if cursor.is_none() {
                break;
            }
            rounds += 1;
            if rounds > MAX_PAGINATION_ROUNDS {
                break;
            }
        }

        if let Some(token) = final_token {
            self.storage.set_value(LAST_SYNC_TOKEN_KEY, &token)?;
        }

        self.sync(SyncOptions {
            mode: SyncMode::Default,
            timing: TimingStrategy::ForceSpawnNew,
            check_integrity: true,
        })
    }
}

//! Key recovery: out-of-band rescue of undecryptable items keys.
//!
//! An items key that arrives from the server with `error_decrypting=true`
//! usually means the account password changed on another device while
//! this client held an older root key. Each such key is persisted (so it
//! survives restart), queued, and probed with passwords supplied through
//! the challenge interface. A successful probe that matches the server's
//! key params replaces the client root key.

use crate::api::ApiClient;
use crate::challenge::{ChallengeReason, ChallengeResponder};
use crate::events::{ApplicationEvent, EventBus};
use crate::items::ItemManager;
use crate::keys::{KeyParams, RootKey};
use crate::payload::{ContentType, Payload, PayloadManager, PayloadSource, RawPayload};
use crate::protocol::ProtocolService;
use crate::session::SessionService;
use crate::storage::{StorageService, UNDECRYPTABLE_ITEMS_KEY};
use crate::sync::{SyncMode, SyncOptions, SyncService, TimingStrategy};
use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex, Weak};
use tracing::{info, warn};

/// How many probe attempts a queued key survives before being parked
/// until the next launch.
const MAX_ATTEMPTS: u32 = 3;

struct DecryptionQueueItem {
    key_payload: Payload,
    /// Params believed to have produced this key; absent until either the
    /// server or a sign-in supplies them.
    key_params: Option<KeyParams>,
    attempts: u32,
}

/// Rescues items keys the current root key cannot decrypt.
pub struct KeyRecoveryService {
    payloads: Arc<PayloadManager>,
    items: Arc<ItemManager>,
    protocol: Arc<ProtocolService>,
    storage: Arc<StorageService>,
    api: Arc<dyn ApiClient>,
    session: Arc<SessionService>,
    sync: Arc<SyncService>,
    challenges: Arc<dyn ChallengeResponder>,
    events: Arc<EventBus>,
    queue: Mutex<VecDeque<DecryptionQueueItem>>,
    is_processing_queue: Mutex<bool>,
    server_params: Mutex<Option<KeyParams>>,
}

impl KeyRecoveryService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        payloads: Arc<PayloadManager>,
        items: Arc<ItemManager>,
        protocol: Arc<ProtocolService>,
        storage: Arc<StorageService>,
        api: Arc<dyn ApiClient>,
        session: Arc<SessionService>,
        sync: Arc<SyncService>,
        challenges: Arc<dyn ChallengeResponder>,
        events: Arc<EventBus>,
    ) -> Arc<KeyRecoveryService> {
        let service = Arc::new(KeyRecoveryService {
            payloads: Arc::clone(&payloads),
            items,
            protocol,
            storage,
            api,
            session,
            sync,
            challenges,
            events,
            queue: Mutex::new(VecDeque::new()),
            is_processing_queue: Mutex::new(false),
            server_params: Mutex::new(None),
        });

        let weak: Weak<KeyRecoveryService> = Arc::downgrade(&service);
        payloads.add_observer(move |outcome| {
            let Some(service) = weak.upgrade() else { return };
            if !outcome.source.is_from_server() {
                return;
            }
            let errored_keys: Vec<Payload> = outcome
                .applied()
                .chain(outcome.ignored.iter())
                .filter(|p| p.content_type == ContentType::ItemsKey && p.error_decrypting)
                .cloned()
                .collect();
            for payload in errored_keys {
                service.handle_undecryptable_key(payload);
            }
        });

        service
    }

    /// Queued keys persisted from a previous run, re-enqueued at launch.
    pub fn restore(&self) {
        let Ok(Some(record)) = self
            .storage
            .get_value::<BTreeMap<String, RawPayload>>(UNDECRYPTABLE_ITEMS_KEY)
        else {
            return;
        };
        for raw in record.into_values() {
            self.enqueue(Payload::from_raw(raw));
        }
    }

    fn handle_undecryptable_key(&self, payload: Payload) {
        info!(uuid = %payload.uuid, "items key failed decryption; queueing for recovery");
        self.persist_undecryptable(&payload);
        self.enqueue(payload);
        self.process_queue();
    }

    fn persist_undecryptable(&self, payload: &Payload) {
        let mut record = self
            .storage
            .get_value::<BTreeMap<String, RawPayload>>(UNDECRYPTABLE_ITEMS_KEY)
            .ok()
            .flatten()
            .unwrap_or_default();
        record.insert(payload.uuid.to_string(), payload.to_stored());
        if let Err(e) = self.storage.set_value(UNDECRYPTABLE_ITEMS_KEY, &record) {
            warn!(error = %e, "failed to persist undecryptable items key");
        }
    }

    fn clear_undecryptable(&self, payload: &Payload) {
        let Ok(Some(mut record)) = self
            .storage
            .get_value::<BTreeMap<String, RawPayload>>(UNDECRYPTABLE_ITEMS_KEY)
        else {
            return;
        };
        record.remove(&payload.uuid.to_string());
        let _ = self.storage.set_value(UNDECRYPTABLE_ITEMS_KEY, &record);
    }

    fn enqueue(&self, payload: Payload) {
        // Legacy payloads embed their own params; otherwise fall back to
        // the recorded server params, then the client's.
        let embedded = payload
            .auth_params
            .as_ref()
            .and_then(|v| serde_json::from_value::<KeyParams>(v.clone()).ok());
        let params = embedded
            .or_else(|| self.server_params.lock().unwrap().clone())
            .or_else(|| self.protocol.root_key().map(|r| r.key_params.clone()));

        let mut queue = self.queue.lock().unwrap();
        if queue.iter().any(|item| item.key_payload.uuid == payload.uuid) {
            return;
        }
        queue.push_back(DecryptionQueueItem {
            key_payload: payload,
            key_params: params,
            attempts: 0,
        });
    }

    /// Drive the queue until it drains or the user cancels.
    pub fn process_queue(&self) {
        {
            let mut processing = self.is_processing_queue.lock().unwrap();
            if *processing {
                return;
            }
            *processing = true;
        }

        self.record_server_params();

        if !self.ensure_credentials() {
            *self.is_processing_queue.lock().unwrap() = false;
            return;
        }

        while let Some(mut item) = self.pop_item() {
            let reason = ChallengeReason::KeyRecovery {
                key_uuid: item.key_payload.uuid,
            };
            let Some(password) = self.challenges.prompt_password(&reason) else {
                // Cancelled: park the item and stop processing.
                self.queue.lock().unwrap().push_front(item);
                break;
            };

            let params = match self
                .server_params
                .lock()
                .unwrap()
                .clone()
                .or_else(|| item.key_params.clone())
                .or_else(|| self.protocol.root_key().map(|r| r.key_params.clone()))
            {
                Some(params) => params,
                None => {
                    item.attempts += 1;
                    self.requeue(item);
                    continue;
                }
            };

            let candidate = match RootKey::derive(&password, &params) {
                Ok(candidate) => candidate,
                Err(e) => {
                    warn!(error = %e, "root key derivation failed during recovery");
                    self.requeue(item);
                    continue;
                }
            };

            let decrypted = self
                .protocol
                .decrypt_payload_with_root_key(&item.key_payload, &candidate);
            if decrypted.error_decrypting {
                item.attempts += 1;
                self.requeue(item);
                continue;
            }

            self.accept_recovered_key(&decrypted, candidate, &params);
        }

        self.finish_processing();
        *self.is_processing_queue.lock().unwrap() = false;
    }

    fn pop_item(&self) -> Option<DecryptionQueueItem> {
        self.queue.lock().unwrap().pop_front()
    }

    fn requeue(&self, item: DecryptionQueueItem) {
        if item.attempts >= MAX_ATTEMPTS {
            warn!(
                uuid = %item.key_payload.uuid,
                "recovery attempts exhausted; key stays persisted for next launch"
            );
            return;
        }
        self.queue.lock().unwrap().push_back(item);
    }

    /// Step 3: remember the server's key params when they are at least as
    /// new as the client's.
    fn record_server_params(&self) {
        if self.server_params.lock().unwrap().is_some() {
            return;
        }
        let Some(user) = self.session.user() else { return };
        let Ok(params) = self.api.key_params(&user.email) else {
            return;
        };
        let newer_or_equal = match self.protocol.root_key() {
            Some(root) => params.version >= root.key_params.version,
            None => true,
        };
        if newer_or_equal {
            *self.server_params.lock().unwrap() = Some(params);
        }
    }

    /// Step 4: without local credentials, a successful sign-in using the
    /// queued key's params establishes the root key.
    fn ensure_credentials(&self) -> bool {
        if self.protocol.has_root_key() {
            return true;
        }
        let params = {
            let queue = self.queue.lock().unwrap();
            let from_queue = queue.front().and_then(|item| item.key_params.clone());
            from_queue.or_else(|| self.server_params.lock().unwrap().clone())
        };
        let Some(params) = params else { return false };

        let Some(password) = self
            .challenges
            .prompt_password(&ChallengeReason::AccountPassword)
        else {
            return false;
        };
        let Ok(root) = RootKey::derive(&password, &params) else {
            return false;
        };
        match self
            .session
            .sign_in_with_root_key(&params.identifier, root)
        {
            Ok(_) => true,
            Err(e) => {
                warn!(error = %e, "recovery sign-in failed");
                false
            }
        }
    }

    /// Step 5 success path: emit the recovered key, replace the root key
    /// when the probe matches server params and the key is newest.
    fn accept_recovered_key(&self, decrypted: &Payload, candidate: RootKey, params: &KeyParams) {
        let server_params = self.server_params.lock().unwrap().clone();
        let matches_server = server_params
            .as_ref()
            .map(|sp| sp == params)
            .unwrap_or(false);

        let newest_local = self
            .items
            .items_keys()
            .into_iter()
            .map(|k| k.updated_at)
            .max()
            .unwrap_or(0);
        let is_newer = decrypted.updated_at >= newest_local;

        if matches_server && is_newer {
            info!("recovered items key matches server params; replacing root key");
            if let Err(e) = self.session.replace_root_key(candidate) {
                warn!(error = %e, "failed to persist recovered root key");
            }

            // Other queued keys under the same params decrypt for free.
            let root = self.protocol.root_key();
            if let Some(root) = root {
                let mut rescued = Vec::new();
                let mut queue = self.queue.lock().unwrap();
                queue.retain(|queued| {
                    let probe = self
                        .protocol
                        .decrypt_payload_with_root_key(&queued.key_payload, &root);
                    if probe.error_decrypting {
                        true
                    } else {
                        rescued.push(probe);
                        false
                    }
                });
                drop(queue);
                for payload in rescued {
                    self.clear_undecryptable(&payload);
                    self.payloads
                        .emit_payloads(vec![payload], PayloadSource::DecryptedTransient);
                }
            }
        }

        self.clear_undecryptable(decrypted);
        self.payloads
            .emit_payloads(vec![decrypted.clone()], PayloadSource::DecryptedTransient);
        self.events.publish(ApplicationEvent::KeyStatusChanged);
    }

    /// Step 6: queue drained. Correct a params divergence with a fresh
    /// sign-in; repair integrity if the account was out of sync.
    fn finish_processing(&self) {
        if !self.queue.lock().unwrap().is_empty() {
            return;
        }

        let server_params = self.server_params.lock().unwrap().clone();
        let client_params = self.protocol.root_key().map(|r| r.key_params.clone());
        if let (Some(server), Some(client)) = (server_params, client_params) {
            if server != client {
                info!("client key params diverge from server after recovery; corrective sign-in");
                if let Some(user) = self.session.user() {
                    if let Some(password) = self
                        .challenges
                        .prompt_password(&ChallengeReason::AccountPassword)
                    {
                        if let Err(e) = self.session.sign_in(&user.email, &password) {
                            warn!(error = %e, "corrective sign-in failed");
                        }
                    }
                }
            }
        }

        if self.sync.is_out_of_sync() {
            let _ = self.sync.sync(SyncOptions {
                mode: SyncMode::Default,
                timing: TimingStrategy::ForceSpawnNew,
                check_integrity: true,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{
        ApiError, AuthResponse, ChangePasswordRequest, RegisterRequest, Session, SignInRequest,
        SyncRequest, SyncResponse, User,
    };
    use crate::challenge::ScriptedChallengeResponder;
    use crate::crypto::{generate_random_key, v004};
    use crate::device::MemoryDevice;
    use crate::items::{ItemManager, ItemsKey, ItemsKeyContent};
    use crate::payload::PayloadContent;
    use crate::protocol::ProtocolService;
    use crate::storage::USER_KEY;
    use uuid::Uuid;

    /// Serves fixed key params; the recovery flow under test never needs
    /// the other endpoints.
    struct ParamsOnlyApi {
        params: KeyParams,
    }

    impl ApiClient for ParamsOnlyApi {
        fn key_params(&self, _email: &str) -> Result<KeyParams, ApiError> {
            Ok(self.params.clone())
        }

        fn register(&self, _request: &RegisterRequest) -> Result<AuthResponse, ApiError> {
            Err(ApiError::Network("not available".to_string()))
        }

        fn sign_in(&self, _request: &SignInRequest) -> Result<AuthResponse, ApiError> {
            Err(ApiError::Network("not available".to_string()))
        }

        fn change_password(
            &self,
            _request: &ChangePasswordRequest,
            _session: &Session,
        ) -> Result<AuthResponse, ApiError> {
            Err(ApiError::Network("not available".to_string()))
        }

        fn sync(&self, _request: &SyncRequest, _session: &Session) -> Result<SyncResponse, ApiError> {
            Err(ApiError::Network("not available".to_string()))
        }

        fn sign_out(&self, _session: &Session) -> Result<(), ApiError> {
            Ok(())
        }
    }

    /// An items key encrypted under a root key this client does not hold
    /// arrives from the server; the password prompt supplies the newer
    /// account password, the key decrypts, and the root key advances.
    #[test]
    fn recovers_key_from_changed_password() {
        let email = "user@example.org";
        let new_password = "the password changed elsewhere";

        // The account's current (server-side) root key.
        let server_params = KeyParams::generate(email);
        let server_root = RootKey::derive(new_password, &server_params).unwrap();

        // An items key encrypted under that newer root key.
        let key_uuid = Uuid::new_v4();
        let key_content = ItemsKeyContent {
            items_key: generate_random_key(32),
            data_authentication_key: None,
            version: crate::crypto::ProtocolVersion::V004,
            is_default: true,
        };
        let plaintext =
            serde_json::to_vec(&key_content.to_item_content()).unwrap();
        let aad = format!("{}::004", key_uuid);
        let item_key = generate_random_key(32);
        let enc_item_key =
            v004::encrypt(item_key.as_bytes(), &server_root.master_key, &aad).unwrap();
        let encrypted_content = v004::encrypt(&plaintext, &item_key, &aad).unwrap();

        let incoming_key = Payload::builder(key_uuid, ContentType::ItemsKey)
            .content(PayloadContent::Encrypted(encrypted_content))
            .enc_item_key(Some(enc_item_key))
            .updated_at(10_000)
            .error_decrypting(true)
            .build();

        // Wire the services with the stale local root key.
        let events = Arc::new(EventBus::new());
        let storage = Arc::new(StorageService::new(
            Arc::new(MemoryDevice::new()),
            "app",
            Arc::clone(&events),
        ));
        let payloads = Arc::new(PayloadManager::new());
        let items = ItemManager::new(Arc::clone(&payloads));
        let protocol = ProtocolService::new(Arc::clone(&items));
        let stale_root =
            RootKey::derive("the old password", &KeyParams::generate(email)).unwrap();
        protocol.set_root_key(Some(stale_root));

        let api: Arc<dyn ApiClient> = Arc::new(ParamsOnlyApi {
            params: server_params.clone(),
        });
        let challenges = Arc::new(ScriptedChallengeResponder::new());
        challenges.push_response(Some(new_password));

        let session = SessionService::new(
            Arc::clone(&api),
            Arc::clone(&storage),
            Arc::clone(&protocol),
            Arc::clone(&payloads),
            Arc::clone(&challenges) as Arc<dyn crate::challenge::ChallengeResponder>,
            Arc::clone(&events),
        );
        storage
            .set_value(
                USER_KEY,
                &User {
                    uuid: Uuid::new_v4(),
                    email: email.to_string(),
                },
            )
            .unwrap();
        session.restore().unwrap();

        let sync = SyncService::new(
            Arc::clone(&payloads),
            Arc::clone(&protocol),
            Arc::clone(&storage),
            Arc::clone(&api),
            Arc::clone(&session),
            Arc::clone(&events),
        );
        let _recovery = KeyRecoveryService::new(
            Arc::clone(&payloads),
            Arc::clone(&items),
            Arc::clone(&protocol),
            Arc::clone(&storage),
            api,
            session,
            sync,
            challenges,
            Arc::clone(&events),
        );

        // The errored key lands from the server; recovery runs inline.
        payloads.emit_payloads(vec![incoming_key], PayloadSource::RemoteRetrieved);

        let recovered = payloads.get(&key_uuid).expect("key still present");
        assert!(!recovered.error_decrypting);
        let parsed = ItemsKey::from_payload(&recovered).expect("key decrypted");
        assert_eq!(parsed.material(), key_content.items_key);

        // Root key advanced to the server's params.
        let root = protocol.root_key().expect("root key present");
        assert_eq!(root.key_params, server_params);
        assert_eq!(root.master_key, server_root.master_key);

        // The persisted undecryptable record was cleared.
        let record = storage
            .get_value::<BTreeMap<String, RawPayload>>(UNDECRYPTABLE_ITEMS_KEY)
            .unwrap()
            .unwrap_or_default();
        assert!(record.is_empty());
    }

    /// Cancelling the challenge parks the key for a later attempt instead
    /// of dropping it.
    #[test]
    fn cancelled_challenge_keeps_key_queued() {
        let events = Arc::new(EventBus::new());
        let storage = Arc::new(StorageService::new(
            Arc::new(MemoryDevice::new()),
            "app",
            Arc::clone(&events),
        ));
        let payloads = Arc::new(PayloadManager::new());
        let items = ItemManager::new(Arc::clone(&payloads));
        let protocol = ProtocolService::new(Arc::clone(&items));
        protocol.set_root_key(Some(RootKey {
            master_key: generate_random_key(32),
            server_password: generate_random_key(32),
            data_authentication_key: None,
            key_params: KeyParams::generate("user@example.org"),
        }));

        let api: Arc<dyn ApiClient> = Arc::new(ParamsOnlyApi {
            params: KeyParams::generate("user@example.org"),
        });
        let challenges = Arc::new(ScriptedChallengeResponder::new());
        // No responses queued: every prompt cancels.

        let session = SessionService::new(
            Arc::clone(&api),
            Arc::clone(&storage),
            Arc::clone(&protocol),
            Arc::clone(&payloads),
            Arc::clone(&challenges) as Arc<dyn crate::challenge::ChallengeResponder>,
            Arc::clone(&events),
        );
        let sync = SyncService::new(
            Arc::clone(&payloads),
            Arc::clone(&protocol),
            Arc::clone(&storage),
            Arc::clone(&api),
            Arc::clone(&session),
            Arc::clone(&events),
        );
        let recovery = KeyRecoveryService::new(
            Arc::clone(&payloads),
            Arc::clone(&items),
            Arc::clone(&protocol),
            Arc::clone(&storage),
            api,
            session,
            sync,
            challenges,
            Arc::clone(&events),
        );

        let errored = Payload::builder(Uuid::new_v4(), ContentType::ItemsKey)
            .content(PayloadContent::Encrypted("004:a:b:c".to_string()))
            .error_decrypting(true)
            .build();
        payloads.emit_payloads(vec![errored.clone()], PayloadSource::RemoteRetrieved);

        // Still errored locally, still persisted for the next attempt.
        assert!(payloads.get(&errored.uuid).unwrap().error_decrypting);
        let record = storage
            .get_value::<BTreeMap<String, RawPayload>>(UNDECRYPTABLE_ITEMS_KEY)
            .unwrap()
            .unwrap();
        assert!(record.contains_key(&errored.uuid.to_string()));
        assert_eq!(recovery.queue.lock().unwrap().len(), 1);
    }
}

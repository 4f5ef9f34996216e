//! The protocol service: versioned encryption and decryption of payloads.
//!
//! Dispatches by the 3-digit version tag, manages the in-memory root key,
//! and selects items keys for new encryptions. Decryption never returns an
//! error: failures are recorded on the produced payload as
//! `error_decrypting` or `waiting_for_key`, per the sync engine's
//! requirement that no error crosses the protocol boundary.

pub mod intent;

pub use intent::EncryptionIntent;

use crate::crypto::version::{version_tag_of, UNENCRYPTED_PREFIX};
use crate::crypto::{generate_random_key, v003, v004, CryptoError, ProtocolVersion};
use crate::items::{ItemManager, ItemsKey, ItemsKeyContent, MutationType};
use crate::keys::{KeyParams, RootKey};
use crate::payload::{ContentType, ItemContent, Payload, PayloadContent};
use serde_json::json;
use std::sync::{Arc, RwLock};
use tracing::warn;
use uuid::Uuid;

/// Versioned encryption/decryption over payloads.
pub struct ProtocolService {
    items: Arc<ItemManager>,
    root_key: RwLock<Option<RootKey>>,
}

impl ProtocolService {
    pub fn new(items: Arc<ItemManager>) -> Arc<ProtocolService> {
        Arc::new(ProtocolService {
            items,
            root_key: RwLock::new(None),
        })
    }

    // --- Root key ---

    pub fn set_root_key(&self, key: Option<RootKey>) {
        *self.root_key.write().unwrap() = key;
    }

    pub fn root_key(&self) -> Option<RootKey> {
        self.root_key.read().unwrap().clone()
    }

    pub fn has_root_key(&self) -> bool {
        self.root_key.read().unwrap().is_some()
    }

    /// Create a fresh 004 root key for a new account or password change.
    pub fn create_root_key(
        &self,
        identifier: &str,
        password: &str,
    ) -> Result<RootKey, CryptoError> {
        RootKey::derive(password, &KeyParams::generate(identifier))
    }

    /// Re-derive a root key from a password and stored params.
    pub fn compute_root_key(
        &self,
        password: &str,
        params: &KeyParams,
    ) -> Result<RootKey, CryptoError> {
        RootKey::derive(password, params)
    }

    // --- Items keys ---

    pub fn default_items_key(&self) -> Option<ItemsKey> {
        self.items.default_items_key()
    }

    pub fn items_key_for_id(&self, uuid: &Uuid) -> Option<ItemsKey> {
        self.items.items_keys().into_iter().find(|k| &k.uuid == uuid)
    }

    /// True when something can encrypt new content: a root key (accounts)
    /// or an existing default items key (offline usage).
    pub fn has_encryption_source(&self) -> bool {
        self.has_root_key() || self.default_items_key().is_some()
    }

    /// Create a new default items key, demoting any previous default.
    /// Key material is immutable; rotation always mints a new key.
    pub fn create_new_default_items_key(&self) -> crate::Result<ItemsKey> {
        for existing in self.items.items_keys() {
            if existing.is_default() {
                self.items
                    .change_item(&existing.uuid, MutationType::Internal, |mutator| {
                        mutator
                            .content_mut()
                            .extra
                            .insert("isDefault".to_string(), json!(false));
                    })?;
            }
        }

        let content = ItemsKeyContent {
            items_key: generate_random_key(v004::KEY_BYTES),
            data_authentication_key: None,
            version: ProtocolVersion::V004,
            is_default: true,
        };
        let item = self
            .items
            .create_item(ContentType::ItemsKey, content.to_item_content())?;
        ItemsKey::from_payload(item.payload())
            .ok_or_else(|| crate::CoreError::InvalidInput("Items key creation failed".to_string()))
    }

    // --- Encryption ---

    pub fn encrypt_payloads(
        &self,
        payloads: &[Payload],
        intent: EncryptionIntent,
    ) -> Result<Vec<Payload>, CryptoError> {
        payloads
            .iter()
            .map(|p| self.encrypt_payload(p, intent))
            .collect()
    }

    /// Encrypt a payload's content per the intent. Tombstones and already
    /// encrypted content pass through unchanged.
    pub fn encrypt_payload(
        &self,
        payload: &Payload,
        intent: EncryptionIntent,
    ) -> Result<Payload, CryptoError> {
        if payload.deleted {
            return Ok(payload
                .to_builder()
                .content(PayloadContent::Absent)
                .enc_item_key(None)
                .items_key_id(None)
                .build());
        }

        let content = match &payload.content {
            PayloadContent::Decrypted(content) => content,
            // Errored payloads keep their ciphertext verbatim.
            PayloadContent::Encrypted(_) | PayloadContent::Absent => return Ok(payload.clone()),
        };

        if !intent.is_encrypted() {
            let framed = format!(
                "{}{}",
                UNENCRYPTED_PREFIX,
                serde_json::to_string(content).map_err(|e| {
                    CryptoError::EncryptionFailed(format!("Content serialization failed: {}", e))
                })?
            );
            return Ok(payload
                .to_builder()
                .content(PayloadContent::Encrypted(framed))
                .enc_item_key(None)
                .items_key_id(None)
                .build());
        }

        let plaintext = serde_json::to_vec(content).map_err(|e| {
            CryptoError::EncryptionFailed(format!("Content serialization failed: {}", e))
        })?;

        let (wrapping_key_hex, items_key_id) = if payload.content_type == ContentType::ItemsKey {
            let root = self.root_key().ok_or_else(|| {
                CryptoError::EncryptionFailed("No root key to encrypt items key".to_string())
            })?;
            (root.master_key.clone(), None)
        } else {
            let key = self.default_items_key().ok_or_else(|| {
                CryptoError::EncryptionFailed("No items key available".to_string())
            })?;
            (key.material().to_string(), Some(key.uuid))
        };

        let aad = additional_data(&payload.uuid, items_key_id.as_ref());
        let item_key = generate_random_key(v004::KEY_BYTES);
        let enc_item_key = v004::encrypt(item_key.as_bytes(), &wrapping_key_hex, &aad)?;
        let encrypted_content = v004::encrypt(&plaintext, &item_key, &aad)?;

        Ok(payload
            .to_builder()
            .content(PayloadContent::Encrypted(encrypted_content))
            .enc_item_key(Some(enc_item_key))
            .items_key_id(items_key_id)
            .build())
    }

    // --- Decryption ---

    pub fn decrypt_payloads(&self, payloads: &[Payload]) -> Vec<Payload> {
        payloads.iter().map(|p| self.decrypt_payload(p)).collect()
    }

    /// Decrypt a payload. Never fails: undecryptable payloads come back
    /// flagged with their ciphertext preserved.
    pub fn decrypt_payload(&self, payload: &Payload) -> Payload {
        self.decrypt_payload_inner(payload, None)
    }

    /// Decrypt under a candidate root key instead of the stored one. Key
    /// recovery probes undecryptable items keys this way.
    pub fn decrypt_payload_with_root_key(&self, payload: &Payload, root: &RootKey) -> Payload {
        self.decrypt_payload_inner(payload, Some(root))
    }

    fn decrypt_payload_inner(&self, payload: &Payload, root_override: Option<&RootKey>) -> Payload {
        let encrypted = match &payload.content {
            // Already decrypted (or nothing to decrypt): identity.
            PayloadContent::Decrypted(_) | PayloadContent::Absent => return payload.clone(),
            PayloadContent::Encrypted(s) => s.clone(),
        };

        let tag = match version_tag_of(&encrypted) {
            Ok(tag) => tag.to_string(),
            Err(_) => return errored(payload),
        };

        match tag.as_str() {
            UNENCRYPTED_PREFIX => self.decrypt_000(payload, &encrypted),
            "004" => self.decrypt_004(payload, &encrypted, root_override),
            "001" | "002" | "003" => self.decrypt_legacy(payload, &encrypted, &tag, root_override),
            other => {
                warn!(version = other, uuid = %payload.uuid, "unknown protocol version");
                errored(payload)
            }
        }
    }

    fn decrypt_000(&self, payload: &Payload, encrypted: &str) -> Payload {
        let json = &encrypted[UNENCRYPTED_PREFIX.len()..];
        match serde_json::from_str::<ItemContent>(json) {
            Ok(content) => decrypted(payload, content),
            Err(_) => errored(payload),
        }
    }

    fn decrypt_004(
        &self,
        payload: &Payload,
        encrypted: &str,
        root_override: Option<&RootKey>,
    ) -> Payload {
        let (wrapping_key_hex, aad) = if payload.content_type == ContentType::ItemsKey {
            match root_override.cloned().or_else(|| self.root_key()) {
                Some(root) => (
                    root.master_key.clone(),
                    additional_data(&payload.uuid, None),
                ),
                None => return waiting(payload),
            }
        } else {
            let key_id = match payload.items_key_id {
                Some(id) => id,
                None => return errored(payload),
            };
            match self.items_key_for_id(&key_id) {
                Some(key) => (
                    key.material().to_string(),
                    additional_data(&payload.uuid, Some(&key_id)),
                ),
                // Key not yet loaded (or itself errored); retry on the
                // next items-key emission.
                None => return waiting(payload),
            }
        };

        let enc_item_key = match &payload.enc_item_key {
            Some(key) => key,
            None => return errored(payload),
        };

        let item_key = match v004::decrypt(enc_item_key, &wrapping_key_hex, &aad)
            .and_then(|bytes| {
                String::from_utf8(bytes)
                    .map_err(|_| CryptoError::DecryptionFailed("Item key not UTF-8".to_string()))
            }) {
            Ok(key) => key,
            Err(_) => return errored(payload),
        };

        let plaintext = match v004::decrypt(encrypted, &item_key, &aad) {
            Ok(plaintext) => plaintext,
            Err(_) => return errored(payload),
        };

        match serde_json::from_slice::<ItemContent>(&plaintext) {
            Ok(content) => decrypted(payload, content),
            Err(_) => errored(payload),
        }
    }

    fn decrypt_legacy(
        &self,
        payload: &Payload,
        encrypted: &str,
        tag: &str,
        root_override: Option<&RootKey>,
    ) -> Payload {
        let root = match root_override.cloned().or_else(|| self.root_key()) {
            Some(root) => root,
            None => return waiting(payload),
        };

        let auth_key = if tag == "001" {
            None
        } else {
            match root.data_authentication_key.as_deref() {
                Some(key) => Some(key.to_string()),
                None => return errored(payload),
            }
        };

        let enc_item_key = match &payload.enc_item_key {
            Some(key) => key,
            None => return errored(payload),
        };

        let item_key_hex = match v003::decrypt(enc_item_key, &root.master_key, auth_key.as_deref())
            .and_then(|bytes| {
                String::from_utf8(bytes)
                    .map_err(|_| CryptoError::DecryptionFailed("Item key not UTF-8".to_string()))
            }) {
            Ok(key) => key,
            Err(_) => return errored(payload),
        };

        let (encryption_key, item_auth_key) = match v003::split_item_key(&item_key_hex) {
            Ok(split) => split,
            Err(_) => return errored(payload),
        };

        let content_auth = if tag == "001" {
            None
        } else {
            Some(item_auth_key.as_str())
        };
        let plaintext = match v003::decrypt(encrypted, &encryption_key, content_auth) {
            Ok(plaintext) => plaintext,
            Err(_) => return errored(payload),
        };

        match serde_json::from_slice::<ItemContent>(&plaintext) {
            Ok(content) => decrypted(payload, content),
            Err(_) => errored(payload),
        }
    }
}

/// AAD binding a ciphertext to its payload: `uuid:items_key_id:version`,
/// with an empty middle segment for root-key-encrypted payloads.
fn additional_data(uuid: &Uuid, items_key_id: Option<&Uuid>) -> String {
    match items_key_id {
        Some(key_id) => format!("{}:{}:004", uuid, key_id),
        None => format!("{}::004", uuid),
    }
}

fn decrypted(payload: &Payload, content: ItemContent) -> Payload {
    payload
        .to_builder()
        .decrypted_content(content)
        .error_decrypting(false)
        .waiting_for_key(false)
        .build()
}

fn errored(payload: &Payload) -> Payload {
    payload
        .to_builder()
        .error_decrypting(true)
        .waiting_for_key(false)
        .build()
}

fn waiting(payload: &Payload) -> Payload {
    payload
        .to_builder()
        .waiting_for_key(true)
        .error_decrypting(false)
        .build()
}

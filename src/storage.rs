//! The storage service: a namespaced persistence facade over the device
//! interface.
//!
//! Values are JSON under `"{namespace}:{key}"`; payloads live in the bulk
//! database table under `"{namespace}:{uuid}"`; the keychain holds a JSON
//! object keyed by namespace so multiple application instances coexist.
//! Read and write failures surface as lifecycle events in addition to
//! errors, and the sync engine defers on them.

use crate::device::DeviceInterface;
use crate::events::{ApplicationEvent, EventBus};
use crate::payload::{Payload, RawPayload};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use thiserror::Error;
use tracing::error;

/// Last-completed migration version.
pub const VERSION_KEY: &str = "library_version";
/// Server-issued cursor for the next incremental sync.
pub const LAST_SYNC_TOKEN_KEY: &str = "last_sync_token";
/// Server-issued cursor for an in-progress paginated download.
pub const PAGINATION_TOKEN_KEY: &str = "pagination_token";
/// `{uuid, email}` of the signed-in account.
pub const USER_KEY: &str = "user";
/// Session token and expiry.
pub const SESSION_KEY: &str = "session";
/// Key params of the passcode wrapping key, when a passcode is set.
pub const ROOT_KEY_WRAPPER_PARAMS_KEY: &str = "root_key_wrapper_params";
/// Raw items-key payloads awaiting key recovery, keyed by uuid.
pub const UNDECRYPTABLE_ITEMS_KEY: &str = "key_recovery_undecryptable_items";

/// Errors from the persistence boundary.
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Storage read failed: {0}")]
    ReadFailed(String),

    #[error("Storage write failed: {0}")]
    WriteFailed(String),

    #[error("Serialization failed: {0}")]
    Serialization(String),
}

/// Namespaced persistence facade.
pub struct StorageService {
    device: Arc<dyn DeviceInterface>,
    namespace: String,
    events: Arc<EventBus>,
}

impl StorageService {
    pub fn new(
        device: Arc<dyn DeviceInterface>,
        namespace: impl Into<String>,
        events: Arc<EventBus>,
    ) -> Self {
        Self {
            device,
            namespace: namespace.into(),
            events,
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    fn namespaced(&self, key: &str) -> String {
        format!("{}:{}", self.namespace, key)
    }

    // --- Value store ---

    pub fn get_value<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, StorageError> {
        let raw = self
            .device
            .get_raw_storage_value(&self.namespaced(key))
            .map_err(|e| self.read_failure(e))?;
        match raw {
            None => Ok(None),
            Some(json) => serde_json::from_str(&json)
                .map(Some)
                .map_err(|e| StorageError::Serialization(e.to_string())),
        }
    }

    pub fn set_value<T: Serialize>(&self, key: &str, value: &T) -> Result<(), StorageError> {
        let json =
            serde_json::to_string(value).map_err(|e| StorageError::Serialization(e.to_string()))?;
        self.device
            .set_raw_storage_value(&self.namespaced(key), &json)
            .map_err(|e| self.write_failure(e))
    }

    pub fn remove_value(&self, key: &str) -> Result<(), StorageError> {
        self.device
            .remove_raw_storage_value(&self.namespaced(key))
            .map_err(|e| self.write_failure(e))
    }

    // --- Payload table ---

    pub fn save_payloads(&self, payloads: &[Payload]) -> Result<(), StorageError> {
        for payload in payloads {
            let json = serde_json::to_string(&payload.to_stored())
                .map_err(|e| StorageError::Serialization(e.to_string()))?;
            self.device
                .save_raw_database_payload(&self.namespaced(&payload.uuid.to_string()), &json)
                .map_err(|e| self.write_failure(e))?;
        }
        Ok(())
    }

    /// All payloads persisted under this namespace. Unparseable records are
    /// skipped with an error log rather than failing the load.
    pub fn load_all_payloads(&self) -> Result<Vec<Payload>, StorageError> {
        let prefix = format!("{}:", self.namespace);
        let records = self
            .device
            .get_all_raw_database_payloads()
            .map_err(|e| self.read_failure(e))?;

        let mut payloads = Vec::new();
        for (key, json) in records {
            if !key.starts_with(&prefix) {
                continue;
            }
            match serde_json::from_str::<RawPayload>(&json) {
                Ok(raw) => payloads.push(Payload::from_raw(raw)),
                Err(e) => {
                    error!(key, error = %e, "skipping unreadable payload record");
                }
            }
        }
        Ok(payloads)
    }

    pub fn remove_payload(&self, uuid: &uuid::Uuid) -> Result<(), StorageError> {
        self.device
            .remove_raw_database_payload(&self.namespaced(&uuid.to_string()))
            .map_err(|e| self.write_failure(e))
    }

    /// Delete every payload record in this namespace (sign-out).
    pub fn clear_payloads(&self) -> Result<(), StorageError> {
        let prefix = format!("{}:", self.namespace);
        let records = self
            .device
            .get_all_raw_database_payloads()
            .map_err(|e| self.read_failure(e))?;
        for (key, _) in records {
            if key.starts_with(&prefix) {
                self.device
                    .remove_raw_database_payload(&key)
                    .map_err(|e| self.write_failure(e))?;
            }
        }
        Ok(())
    }

    // --- Keychain ---

    pub fn keychain_value(&self) -> Result<Option<Value>, StorageError> {
        let raw = self
            .device
            .get_keychain_value()
            .map_err(|e| self.read_failure(e))?;
        let Some(json) = raw else { return Ok(None) };
        let map: Value =
            serde_json::from_str(&json).map_err(|e| StorageError::Serialization(e.to_string()))?;
        Ok(map.get(&self.namespace).cloned())
    }

    pub fn set_keychain_value(&self, value: Value) -> Result<(), StorageError> {
        let raw = self
            .device
            .get_keychain_value()
            .map_err(|e| self.read_failure(e))?;
        let mut map: Value = match raw {
            Some(json) => serde_json::from_str(&json)
                .map_err(|e| StorageError::Serialization(e.to_string()))?,
            None => serde_json::json!({}),
        };
        if let Value::Object(entries) = &mut map {
            entries.insert(self.namespace.clone(), value);
        }
        let json =
            serde_json::to_string(&map).map_err(|e| StorageError::Serialization(e.to_string()))?;
        self.device
            .set_keychain_value(&json)
            .map_err(|e| self.write_failure(e))
    }

    pub fn clear_keychain_value(&self) -> Result<(), StorageError> {
        self.set_keychain_value(Value::Null)
    }

    fn read_failure(&self, error: StorageError) -> StorageError {
        error!(%error, "storage read failure");
        self.events.publish(ApplicationEvent::LocalDatabaseReadError);
        error
    }

    fn write_failure(&self, error: StorageError) -> StorageError {
        error!(%error, "storage write failure");
        self.events
            .publish(ApplicationEvent::LocalDatabaseWriteError);
        error
    }
}

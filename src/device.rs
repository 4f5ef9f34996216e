//! The device interface: the injected persistence boundary.
//!
//! Hosts provide raw key/value storage, a bulk payload table and a
//! keychain. The library never touches a filesystem or database directly;
//! everything below the [`crate::storage::StorageService`] facade goes
//! through this trait.

use crate::storage::StorageError;
use std::collections::HashMap;
use std::sync::Mutex;

/// Host-provided persistence primitives.
pub trait DeviceInterface: Send + Sync {
    fn get_raw_storage_value(&self, key: &str) -> Result<Option<String>, StorageError>;
    fn set_raw_storage_value(&self, key: &str, value: &str) -> Result<(), StorageError>;
    fn remove_raw_storage_value(&self, key: &str) -> Result<(), StorageError>;

    /// All database payload records as `(key, serialized payload)` pairs.
    fn get_all_raw_database_payloads(&self) -> Result<Vec<(String, String)>, StorageError>;
    fn save_raw_database_payload(&self, key: &str, payload: &str) -> Result<(), StorageError>;
    fn remove_raw_database_payload(&self, key: &str) -> Result<(), StorageError>;

    fn get_keychain_value(&self) -> Result<Option<String>, StorageError>;
    fn set_keychain_value(&self, value: &str) -> Result<(), StorageError>;
    fn clear_keychain_value(&self) -> Result<(), StorageError>;
}

/// In-memory device, for tests and ephemeral hosts.
#[derive(Default)]
pub struct MemoryDevice {
    storage: Mutex<HashMap<String, String>>,
    database: Mutex<HashMap<String, String>>,
    keychain: Mutex<Option<String>>,
}

impl MemoryDevice {
    pub fn new() -> Self {
        Self::default()
    }
}

impl DeviceInterface for MemoryDevice {
    fn get_raw_storage_value(&self, key: &str) -> Result<Option<String>, StorageError> {
        Ok(self.storage.lock().unwrap().get(key).cloned())
    }

    fn set_raw_storage_value(&self, key: &str, value: &str) -> Result<(), StorageError> {
        self.storage
            .lock()
            .unwrap()
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove_raw_storage_value(&self, key: &str) -> Result<(), StorageError> {
        self.storage.lock().unwrap().remove(key);
        Ok(())
    }

    fn get_all_raw_database_payloads(&self) -> Result<Vec<(String, String)>, StorageError> {
        Ok(self
            .database
            .lock()
            .unwrap()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    fn save_raw_database_payload(&self, key: &str, payload: &str) -> Result<(), StorageError> {
        self.database
            .lock()
            .unwrap()
            .insert(key.to_string(), payload.to_string());
        Ok(())
    }

    fn remove_raw_database_payload(&self, key: &str) -> Result<(), StorageError> {
        self.database.lock().unwrap().remove(key);
        Ok(())
    }

    fn get_keychain_value(&self) -> Result<Option<String>, StorageError> {
        Ok(self.keychain.lock().unwrap().clone())
    }

    fn set_keychain_value(&self, value: &str) -> Result<(), StorageError> {
        *self.keychain.lock().unwrap() = Some(value.to_string());
        Ok(())
    }

    fn clear_keychain_value(&self) -> Result<(), StorageError> {
        *self.keychain.lock().unwrap() = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn storage_roundtrip() {
        let device = MemoryDevice::new();
        assert_eq!(device.get_raw_storage_value("k").unwrap(), None);

        device.set_raw_storage_value("k", "v").unwrap();
        assert_eq!(
            device.get_raw_storage_value("k").unwrap().as_deref(),
            Some("v")
        );

        device.remove_raw_storage_value("k").unwrap();
        assert_eq!(device.get_raw_storage_value("k").unwrap(), None);
    }

    #[test]
    fn database_and_keychain_roundtrip() {
        let device = MemoryDevice::new();
        device.save_raw_database_payload("ns:uuid", "{}").unwrap();
        assert_eq!(device.get_all_raw_database_payloads().unwrap().len(), 1);
        device.remove_raw_database_payload("ns:uuid").unwrap();
        assert!(device.get_all_raw_database_payloads().unwrap().is_empty());

        device.set_keychain_value("secret").unwrap();
        assert_eq!(
            device.get_keychain_value().unwrap().as_deref(),
            Some("secret")
        );
        device.clear_keychain_value().unwrap();
        assert_eq!(device.get_keychain_value().unwrap(), None);
    }
}

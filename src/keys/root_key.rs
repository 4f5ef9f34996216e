//! Root keys and the key params needed to re-derive them.
//!
//! The root key scheme:
//! Account password → versioned KDF → root key → wraps items keys.
//!
//! The `server_password` half is the only derived material ever sent to
//! the server. The root key itself lives in process memory, in the
//! keychain when no passcode is set, or wrapped by a passcode-derived key.

use crate::crypto::{legacy, v003, v004, CryptoError, ProtocolVersion};
use serde::{Deserialize, Serialize};
use zeroize::Zeroize;

/// The parameters needed to re-derive a root key from a password.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyParams {
    pub version: ProtocolVersion,

    /// Account identifier (email), salted into 003/004 derivation.
    pub identifier: String,

    /// Salt seed for 003 and newer.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pw_nonce: Option<String>,

    /// Literal salt for 002 and older.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pw_salt: Option<String>,

    /// PBKDF2 cost for legacy versions.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pw_cost: Option<u32>,
}

impl KeyParams {
    /// Fresh 004 params with a random password nonce.
    pub fn generate(identifier: impl Into<String>) -> KeyParams {
        KeyParams {
            version: ProtocolVersion::V004,
            identifier: identifier.into(),
            pw_nonce: Some(crate::crypto::generate_random_key(32)),
            pw_salt: None,
            pw_cost: None,
        }
    }

    /// True iff the recorded derivation cost meets the version minimum.
    /// Versions without a recorded cost (003+) always pass.
    pub fn supports_derivation_cost(&self) -> bool {
        match self.pw_cost {
            Some(cost) => crate::crypto::supports_password_derivation_cost(self.version, cost),
            None => true,
        }
    }

    fn pw_nonce(&self) -> Result<&str, CryptoError> {
        self.pw_nonce
            .as_deref()
            .ok_or_else(|| CryptoError::KdfFailed("Key params missing pw_nonce".to_string()))
    }

    fn pw_salt(&self) -> Result<&str, CryptoError> {
        self.pw_salt
            .as_deref()
            .ok_or_else(|| CryptoError::KdfFailed("Key params missing pw_salt".to_string()))
    }

    fn pw_cost(&self) -> Result<u32, CryptoError> {
        self.pw_cost
            .ok_or_else(|| CryptoError::KdfFailed("Key params missing pw_cost".to_string()))
    }
}

/// A derived root key plus the params that produced it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RootKey {
    #[serde(rename = "masterKey")]
    pub master_key: String,

    #[serde(rename = "serverPassword")]
    pub server_password: String,

    /// Present for 003 and older.
    #[serde(
        rename = "dataAuthenticationKey",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub data_authentication_key: Option<String>,

    #[serde(rename = "keyParams")]
    pub key_params: KeyParams,
}

impl RootKey {
    /// Derive a root key from a password under versioned key params.
    pub fn derive(password: &str, params: &KeyParams) -> Result<RootKey, CryptoError> {
        match params.version {
            ProtocolVersion::V004 => {
                let keys =
                    v004::derive_root_key(password, &params.identifier, params.pw_nonce()?)?;
                Ok(RootKey {
                    master_key: keys.master_key,
                    server_password: keys.server_password,
                    data_authentication_key: None,
                    key_params: params.clone(),
                })
            }
            ProtocolVersion::V003 => {
                let keys =
                    v003::derive_root_key(password, &params.identifier, params.pw_nonce()?)?;
                Ok(RootKey {
                    master_key: keys.master_key,
                    server_password: keys.server_password,
                    data_authentication_key: Some(keys.data_authentication_key),
                    key_params: params.clone(),
                })
            }
            ProtocolVersion::V002 => {
                let keys =
                    legacy::derive_root_key_002(password, params.pw_salt()?, params.pw_cost()?)?;
                Ok(RootKey {
                    master_key: keys.master_key,
                    server_password: keys.server_password,
                    data_authentication_key: Some(keys.data_authentication_key.clone()),
                    key_params: params.clone(),
                })
            }
            ProtocolVersion::V001 => {
                let keys =
                    legacy::derive_root_key_001(password, params.pw_salt()?, params.pw_cost()?)?;
                Ok(RootKey {
                    master_key: keys.master_key,
                    server_password: keys.server_password,
                    data_authentication_key: None,
                    key_params: params.clone(),
                })
            }
        }
    }

    pub fn version(&self) -> ProtocolVersion {
        self.key_params.version
    }

    /// Wrap this root key under another (passcode-derived) root key,
    /// producing a `004:`-framed string safe to persist.
    pub fn wrap_with(&self, wrapping_key: &RootKey) -> Result<String, CryptoError> {
        let plaintext = serde_json::to_vec(self)
            .map_err(|e| CryptoError::EncryptionFailed(format!("Serialization failed: {}", e)))?;
        let aad = wrap_aad(&self.key_params.identifier);
        v004::encrypt(&plaintext, &wrapping_key.master_key, &aad)
    }

    /// Reverse of [`Self::wrap_with`].
    pub fn unwrap_with(
        wrapped: &str,
        wrapping_key: &RootKey,
        identifier: &str,
    ) -> Result<RootKey, CryptoError> {
        let plaintext = v004::decrypt(wrapped, &wrapping_key.master_key, &wrap_aad(identifier))?;
        serde_json::from_slice(&plaintext)
            .map_err(|e| CryptoError::DecryptionFailed(format!("Deserialization failed: {}", e)))
    }
}

impl Drop for RootKey {
    fn drop(&mut self) {
        self.master_key.zeroize();
        self.server_password.zeroize();
        if let Some(key) = self.data_authentication_key.as_mut() {
            key.zeroize();
        }
    }
}

fn wrap_aad(identifier: &str) -> String {
    format!("root-key:{}", identifier)
}

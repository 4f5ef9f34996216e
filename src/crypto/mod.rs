//! Cryptographic operators for the encryption protocol.
//!
//! This module provides:
//! - Versioned key derivation (Argon2id for 004, PBKDF2-HMAC-SHA512 for 001-003)
//! - Content encryption (XChaCha20-Poly1305 for 004, AES-256-CBC + HMAC for 001-003)
//! - Protocol version parsing and ordering
//! - Random key material and string codecs
//!
//! The library decrypts all four protocol versions but encrypts only with
//! the latest (004). Version selection happens in the protocol service; the
//! operators here are pure functions over key material and ciphertext.

pub mod legacy;
pub mod v003;
pub mod v004;
pub mod version;

pub use version::{
    compare_version_tags, supports_password_derivation_cost, ProtocolVersion, LATEST_VERSION,
};

use rand::{rngs::OsRng, RngCore};
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Errors that can occur in cryptographic operations
#[derive(Error, Debug)]
pub enum CryptoError {
    #[error("Key derivation failed: {0}")]
    KdfFailed(String),

    #[error("Encryption failed: {0}")]
    EncryptionFailed(String),

    #[error("Decryption failed: {0}")]
    DecryptionFailed(String),

    #[error("Authentication failed - ciphertext may have been tampered with")]
    AuthenticationFailed,

    #[error("Malformed ciphertext: {0}")]
    MalformedCiphertext(String),

    #[error("Unknown protocol version: {0}")]
    UnknownVersion(String),

    #[error("Invalid key length: expected {expected} hex chars, got {got}")]
    InvalidKeyLength { expected: usize, got: usize },
}

/// Result type for crypto operations
pub type Result<T> = std::result::Result<T, CryptoError>;

/// Generate `len` cryptographically random bytes, hex-encoded.
///
/// Used for per-item keys, items-key material and password nonces.
pub fn generate_random_key(len: usize) -> String {
    let mut bytes = vec![0u8; len];
    OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// SHA-256 of a UTF-8 string, hex-encoded.
pub fn sha256_hex(input: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    hex::encode(hasher.finalize())
}

/// Constant-time equality over two byte strings.
pub fn timing_safe_equal(a: &[u8], b: &[u8]) -> bool {
    use subtle::ConstantTimeEq;
    if a.len() != b.len() {
        return false;
    }
    a.ct_eq(b).into()
}

/// Decode a hex key, validating its decoded length.
pub(crate) fn decode_key_hex(key_hex: &str, expected_bytes: usize) -> Result<Vec<u8>> {
    let bytes = hex::decode(key_hex)
        .map_err(|_| CryptoError::DecryptionFailed("Key is not valid hex".to_string()))?;
    if bytes.len() != expected_bytes {
        return Err(CryptoError::InvalidKeyLength {
            expected: expected_bytes * 2,
            got: key_hex.len(),
        });
    }
    Ok(bytes)
}

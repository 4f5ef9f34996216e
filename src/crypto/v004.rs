//! Protocol version 004: Argon2id key derivation and XChaCha20-Poly1305
//! authenticated encryption.
//!
//! Parameters:
//! - Argon2id, 64 MiB memory, 5 iterations, 1 lane, 64-byte output
//! - KDF salt: first 16 bytes of SHA-256(`identifier:pw_nonce`)
//! - XChaCha20-Poly1305 with a 24-byte random nonce per encryption
//! - Additional authenticated data binds uuid, items-key id and version
//!
//! Wire framing of an encrypted string:
//! `004:<b64url nonce>:<b64url ciphertext+tag>:<b64url aad>`

use crate::crypto::{decode_key_hex, sha256_hex, timing_safe_equal, CryptoError, Result};
use argon2::{Algorithm, Argon2, Params, Version};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chacha20poly1305::aead::{Aead, Payload};
use chacha20poly1305::{Key, KeyInit, XChaCha20Poly1305, XNonce};
use rand::{rngs::OsRng, RngCore};

/// Argon2id memory cost in KiB (64 MiB)
pub const ARGON2_MEMORY_KIB: u32 = 65_536;
/// Argon2id time cost
pub const ARGON2_ITERATIONS: u32 = 5;
/// Argon2id parallelism
pub const ARGON2_LANES: u32 = 1;
/// Total KDF output, split into master key and server password
pub const DERIVED_BYTES: usize = 64;
/// KDF salt length in bytes
pub const SALT_BYTES: usize = 16;
/// XChaCha20 nonce length in bytes
pub const NONCE_BYTES: usize = 24;
/// Symmetric key length in bytes
pub const KEY_BYTES: usize = 32;

/// The two halves of the 004 KDF output, hex-encoded.
///
/// `master_key` never leaves the client; `server_password` is the only
/// proof of password sent to the server.
#[derive(Debug, Clone)]
pub struct DerivedKeys {
    pub master_key: String,
    pub server_password: String,
}

/// Compute the KDF salt for an account identifier and password nonce.
///
/// The hex digest of `identifier:pw_nonce` is truncated to 32 characters
/// and decoded back to 16 raw bytes.
pub fn kdf_salt(identifier: &str, pw_nonce: &str) -> Result<[u8; SALT_BYTES]> {
    let digest = sha256_hex(&format!("{}:{}", identifier, pw_nonce));
    let bytes = hex::decode(&digest[..SALT_BYTES * 2])
        .map_err(|e| CryptoError::KdfFailed(format!("Salt derivation failed: {}", e)))?;
    let mut salt = [0u8; SALT_BYTES];
    salt.copy_from_slice(&bytes);
    Ok(salt)
}

/// Derive the root key halves from a password.
///
/// # Security
/// Argon2id resists both GPU and side-channel attacks; the parameters
/// target interactive login latency on desktop hardware.
pub fn derive_root_key(password: &str, identifier: &str, pw_nonce: &str) -> Result<DerivedKeys> {
    let salt = kdf_salt(identifier, pw_nonce)?;

    let params = Params::new(
        ARGON2_MEMORY_KIB,
        ARGON2_ITERATIONS,
        ARGON2_LANES,
        Some(DERIVED_BYTES),
    )
    .map_err(|e| CryptoError::KdfFailed(format!("Invalid parameters: {}", e)))?;

    let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);

    let mut output = [0u8; DERIVED_BYTES];
    argon2
        .hash_password_into(password.as_bytes(), &salt, &mut output)
        .map_err(|e| CryptoError::KdfFailed(format!("Hashing failed: {}", e)))?;

    let keys = DerivedKeys {
        master_key: hex::encode(&output[..KEY_BYTES]),
        server_password: hex::encode(&output[KEY_BYTES..]),
    };

    use zeroize::Zeroize;
    output.zeroize();

    Ok(keys)
}

/// Encrypt a plaintext under a 32-byte hex key, producing the full
/// `004:`-framed string. A fresh random nonce is generated per call.
pub fn encrypt(plaintext: &[u8], key_hex: &str, aad: &str) -> Result<String> {
    let key = decode_key_hex(key_hex, KEY_BYTES)
        .map_err(|_| CryptoError::EncryptionFailed("Invalid encryption key".to_string()))?;
    let cipher = XChaCha20Poly1305::new(Key::from_slice(&key));

    let mut nonce = [0u8; NONCE_BYTES];
    OsRng.fill_bytes(&mut nonce);

    let ciphertext = cipher
        .encrypt(
            XNonce::from_slice(&nonce),
            Payload {
                msg: plaintext,
                aad: aad.as_bytes(),
            },
        )
        .map_err(|_| CryptoError::EncryptionFailed("AEAD encryption failed".to_string()))?;

    Ok(format!(
        "004:{}:{}:{}",
        URL_SAFE_NO_PAD.encode(nonce),
        URL_SAFE_NO_PAD.encode(&ciphertext),
        URL_SAFE_NO_PAD.encode(aad.as_bytes())
    ))
}

/// Decrypt a `004:`-framed string.
///
/// The framed additional data must equal `expected_aad` (binding the
/// ciphertext to its payload's uuid and items-key id) and must verify
/// under the Poly1305 tag.
pub fn decrypt(encrypted: &str, key_hex: &str, expected_aad: &str) -> Result<Vec<u8>> {
    let (nonce, ciphertext, aad) = parse_components(encrypted)?;

    if !timing_safe_equal(aad.as_bytes(), expected_aad.as_bytes()) {
        return Err(CryptoError::AuthenticationFailed);
    }

    let key = decode_key_hex(key_hex, KEY_BYTES)?;
    let cipher = XChaCha20Poly1305::new(Key::from_slice(&key));

    cipher
        .decrypt(
            XNonce::from_slice(&nonce),
            Payload {
                msg: ciphertext.as_slice(),
                aad: aad.as_bytes(),
            },
        )
        .map_err(|_| CryptoError::AuthenticationFailed)
}

/// Split a `004:`-framed string into nonce, ciphertext and AAD.
pub fn parse_components(encrypted: &str) -> Result<([u8; NONCE_BYTES], Vec<u8>, String)> {
    let mut parts = encrypted.split(':');

    let version = parts.next().unwrap_or_default();
    if version != "004" {
        return Err(CryptoError::MalformedCiphertext(format!(
            "Expected 004 framing, found {:?}",
            version
        )));
    }

    let nonce_b64 = parts
        .next()
        .ok_or_else(|| CryptoError::MalformedCiphertext("Missing nonce".to_string()))?;
    let ciphertext_b64 = parts
        .next()
        .ok_or_else(|| CryptoError::MalformedCiphertext("Missing ciphertext".to_string()))?;
    let aad_b64 = parts
        .next()
        .ok_or_else(|| CryptoError::MalformedCiphertext("Missing additional data".to_string()))?;
    if parts.next().is_some() {
        return Err(CryptoError::MalformedCiphertext(
            "Trailing components".to_string(),
        ));
    }

    let nonce_bytes = URL_SAFE_NO_PAD
        .decode(nonce_b64)
        .map_err(|_| CryptoError::MalformedCiphertext("Nonce is not base64url".to_string()))?;
    let nonce: [u8; NONCE_BYTES] = nonce_bytes
        .try_into()
        .map_err(|_| CryptoError::MalformedCiphertext("Nonce must be 24 bytes".to_string()))?;

    let ciphertext = URL_SAFE_NO_PAD
        .decode(ciphertext_b64)
        .map_err(|_| CryptoError::MalformedCiphertext("Ciphertext is not base64url".to_string()))?;

    let aad_bytes = URL_SAFE_NO_PAD.decode(aad_b64).map_err(|_| {
        CryptoError::MalformedCiphertext("Additional data is not base64url".to_string())
    })?;
    let aad = String::from_utf8(aad_bytes).map_err(|_| {
        CryptoError::MalformedCiphertext("Additional data is not UTF-8".to_string())
    })?;

    Ok((nonce, ciphertext, aad))
}

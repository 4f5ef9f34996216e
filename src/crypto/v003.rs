//! Protocol version 003: PBKDF2-HMAC-SHA512 key derivation and
//! AES-256-CBC + HMAC-SHA256 content encryption.
//!
//! Parameters:
//! - PBKDF2-HMAC-SHA512, 110,000 iterations, 96-byte output split into
//!   master key, server password and data authentication key
//! - KDF salt: hex SHA-256 of `identifier:pw_nonce`
//! - Per-item key: 64 random bytes hex-encoded; first half encrypts,
//!   second half authenticates
//!
//! Wire framing: `003:<auth_hash_hex>:<uuid>:<iv_hex>:<ciphertext_b64>`
//! where `auth_hash` is HMAC-SHA256 over `003:<uuid>:<iv_hex>:<ct_b64>`.
//!
//! New content is never written with this version; encryption support is
//! kept for interoperability fixtures and the legacy operators.

use crate::crypto::{decode_key_hex, sha256_hex, timing_safe_equal, CryptoError, Result};
use aes::cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use hmac::{Hmac, Mac};
use pbkdf2::pbkdf2_hmac;
use rand::{rngs::OsRng, RngCore};
use sha2::{Sha256, Sha512};

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;
type HmacSha256 = Hmac<Sha256>;

/// PBKDF2 iteration count for 003
pub const ITERATIONS: u32 = 110_000;
/// Total KDF output: three 32-byte keys
pub const DERIVED_BYTES: usize = 96;
/// AES block / IV size
pub const IV_BYTES: usize = 16;
/// Symmetric key length in bytes
pub const KEY_BYTES: usize = 32;

/// The three sections of the 003 KDF output, hex-encoded.
#[derive(Debug, Clone)]
pub struct DerivedKeys {
    pub master_key: String,
    pub server_password: String,
    pub data_authentication_key: String,
}

/// The parsed pieces of a legacy-framed encrypted string.
#[derive(Debug, Clone)]
pub struct Components {
    pub version: String,
    pub auth_hash: String,
    pub uuid: String,
    pub iv_hex: String,
    pub ciphertext_b64: String,
}

/// Derive the three root key sections from a password.
pub fn derive_root_key(password: &str, identifier: &str, pw_nonce: &str) -> Result<DerivedKeys> {
    let salt = sha256_hex(&format!("{}:{}", identifier, pw_nonce));
    let mut output = [0u8; DERIVED_BYTES];
    derive_bytes(password, salt.as_bytes(), ITERATIONS, &mut output);

    let keys = DerivedKeys {
        master_key: hex::encode(&output[..KEY_BYTES]),
        server_password: hex::encode(&output[KEY_BYTES..KEY_BYTES * 2]),
        data_authentication_key: hex::encode(&output[KEY_BYTES * 2..]),
    };

    use zeroize::Zeroize;
    output.zeroize();

    Ok(keys)
}

/// PBKDF2-HMAC-SHA512 into a caller-provided buffer. Shared with the
/// 001/002 operators, which use caller-supplied salts and costs.
pub(crate) fn derive_bytes(password: &str, salt: &[u8], iterations: u32, out: &mut [u8]) {
    pbkdf2_hmac::<Sha512>(password.as_bytes(), salt, iterations, out);
}

/// Split a 128-hex-char per-item key into (encryption, authentication)
/// halves. All legacy versions store item keys this way.
pub fn split_item_key(item_key_hex: &str) -> Result<(String, String)> {
    if item_key_hex.len() != 128 {
        return Err(CryptoError::InvalidKeyLength {
            expected: 128,
            got: item_key_hex.len(),
        });
    }
    Ok((
        item_key_hex[..64].to_string(),
        item_key_hex[64..].to_string(),
    ))
}

/// Encrypt a plaintext, producing the full `003:`-framed string.
pub fn encrypt(
    plaintext: &[u8],
    encryption_key_hex: &str,
    auth_key_hex: &str,
    uuid: &str,
) -> Result<String> {
    let key = decode_key_hex(encryption_key_hex, KEY_BYTES)
        .map_err(|_| CryptoError::EncryptionFailed("Invalid encryption key".to_string()))?;

    let mut iv = [0u8; IV_BYTES];
    OsRng.fill_bytes(&mut iv);

    let ciphertext = aes_cbc_encrypt(plaintext, &key, &iv)?;
    let iv_hex = hex::encode(iv);
    let ciphertext_b64 = STANDARD.encode(&ciphertext);

    let string_to_auth = format!("003:{}:{}:{}", uuid, iv_hex, ciphertext_b64);
    let auth_hash = hmac_sha256_hex(auth_key_hex, &string_to_auth)?;

    Ok(format!(
        "003:{}:{}:{}:{}",
        auth_hash, uuid, iv_hex, ciphertext_b64
    ))
}

/// Decrypt a legacy-framed string.
///
/// When `auth_key_hex` is provided the HMAC is verified before touching
/// the ciphertext; version 001 passes `None` (its framing carries a hash
/// this library cannot verify).
pub fn decrypt(
    encrypted: &str,
    encryption_key_hex: &str,
    auth_key_hex: Option<&str>,
) -> Result<Vec<u8>> {
    let components = parse_components(encrypted)?;

    if let Some(auth_key) = auth_key_hex {
        let string_to_auth = format!(
            "{}:{}:{}:{}",
            components.version, components.uuid, components.iv_hex, components.ciphertext_b64
        );
        let expected = hmac_sha256_hex(auth_key, &string_to_auth)?;
        if !timing_safe_equal(expected.as_bytes(), components.auth_hash.as_bytes()) {
            return Err(CryptoError::AuthenticationFailed);
        }
    }

    let key = decode_key_hex(encryption_key_hex, KEY_BYTES)?;
    let iv_bytes = hex::decode(&components.iv_hex)
        .map_err(|_| CryptoError::MalformedCiphertext("IV is not hex".to_string()))?;
    let iv: [u8; IV_BYTES] = iv_bytes
        .try_into()
        .map_err(|_| CryptoError::MalformedCiphertext("IV must be 16 bytes".to_string()))?;
    let ciphertext = STANDARD
        .decode(&components.ciphertext_b64)
        .map_err(|_| CryptoError::MalformedCiphertext("Ciphertext is not base64".to_string()))?;

    aes_cbc_decrypt(&ciphertext, &key, &iv)
}

/// Split a `001`/`002`/`003`-framed string into its five components.
pub fn parse_components(encrypted: &str) -> Result<Components> {
    let parts: Vec<&str> = encrypted.split(':').collect();
    if parts.len() != 5 {
        return Err(CryptoError::MalformedCiphertext(format!(
            "Expected 5 components, found {}",
            parts.len()
        )));
    }
    if !matches!(parts[0], "001" | "002" | "003") {
        return Err(CryptoError::MalformedCiphertext(format!(
            "Unexpected version tag {:?}",
            parts[0]
        )));
    }
    Ok(Components {
        version: parts[0].to_string(),
        auth_hash: parts[1].to_string(),
        uuid: parts[2].to_string(),
        iv_hex: parts[3].to_string(),
        ciphertext_b64: parts[4].to_string(),
    })
}

/// HMAC-SHA256 keyed by a hex key, hex-encoded output.
pub(crate) fn hmac_sha256_hex(key_hex: &str, message: &str) -> Result<String> {
    let key = hex::decode(key_hex)
        .map_err(|_| CryptoError::DecryptionFailed("Auth key is not valid hex".to_string()))?;
    let mut mac = HmacSha256::new_from_slice(&key)
        .map_err(|e| CryptoError::DecryptionFailed(format!("HMAC init failed: {}", e)))?;
    mac.update(message.as_bytes());
    Ok(hex::encode(mac.finalize().into_bytes()))
}

pub(crate) fn aes_cbc_encrypt(plaintext: &[u8], key: &[u8], iv: &[u8; IV_BYTES]) -> Result<Vec<u8>> {
    if key.len() != KEY_BYTES {
        return Err(CryptoError::EncryptionFailed("Invalid key length".to_string()));
    }
    let encryptor = Aes256CbcEnc::new(key.into(), iv.into());
    let len = plaintext.len();
    let mut buffer = vec![0u8; len + IV_BYTES];
    buffer[..len].copy_from_slice(plaintext);

    let ciphertext = encryptor
        .encrypt_padded_mut::<Pkcs7>(&mut buffer, len)
        .map_err(|_| CryptoError::EncryptionFailed("CBC padding failed".to_string()))?;
    Ok(ciphertext.to_vec())
}

pub(crate) fn aes_cbc_decrypt(ciphertext: &[u8], key: &[u8], iv: &[u8; IV_BYTES]) -> Result<Vec<u8>> {
    if key.len() != KEY_BYTES || ciphertext.is_empty() {
        return Err(CryptoError::DecryptionFailed("Invalid input".to_string()));
    }
    let decryptor = Aes256CbcDec::new(key.into(), iv.into());
    let mut buffer = ciphertext.to_vec();

    let plaintext = decryptor
        .decrypt_padded_mut::<Pkcs7>(&mut buffer)
        .map_err(|_| CryptoError::DecryptionFailed("CBC decryption failed".to_string()))?;
    Ok(plaintext.to_vec())
}

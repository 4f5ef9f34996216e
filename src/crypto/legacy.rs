//! Protocol versions 001 and 002: decrypt-only legacy operators.
//!
//! Both versions share the 003 framing and AES-256-CBC primitives but use
//! weaker key derivation: PBKDF2-HMAC-SHA512 with a caller-supplied salt
//! (`pw_salt`) and a cost recorded in the account's key params (minimum
//! 3,000). Version 001 additionally lacks verifiable authentication; its
//! `auth_hash` component is carried but not checked.
//!
//! Accounts on these versions can still sign in, with an outdated-protocol
//! warning surfaced by the session service.

use crate::crypto::v003::{self, DerivedKeys};
use crate::crypto::{CryptoError, Result};

/// Minimum PBKDF2 cost accepted for 001/002 accounts.
pub const MIN_COST: u32 = 3_000;

/// 001 derives only two key sections; there is no data authentication key.
#[derive(Debug, Clone)]
pub struct DerivedKeys001 {
    pub master_key: String,
    pub server_password: String,
}

/// Derive the 002 root key sections from a password and stored key params.
pub fn derive_root_key_002(password: &str, pw_salt: &str, cost: u32) -> Result<DerivedKeys> {
    check_cost(cost)?;
    let mut output = [0u8; v003::DERIVED_BYTES];
    v003::derive_bytes(password, pw_salt.as_bytes(), cost, &mut output);

    let keys = DerivedKeys {
        master_key: hex::encode(&output[..32]),
        server_password: hex::encode(&output[32..64]),
        data_authentication_key: hex::encode(&output[64..]),
    };

    use zeroize::Zeroize;
    output.zeroize();

    Ok(keys)
}

/// Derive the 001 root key sections from a password and stored key params.
pub fn derive_root_key_001(password: &str, pw_salt: &str, cost: u32) -> Result<DerivedKeys001> {
    check_cost(cost)?;
    let mut output = [0u8; 64];
    v003::derive_bytes(password, pw_salt.as_bytes(), cost, &mut output);

    let keys = DerivedKeys001 {
        master_key: hex::encode(&output[..32]),
        server_password: hex::encode(&output[32..]),
    };

    use zeroize::Zeroize;
    output.zeroize();

    Ok(keys)
}

/// Decrypt a `002:`-framed string, verifying its HMAC.
pub fn decrypt_002(
    encrypted: &str,
    encryption_key_hex: &str,
    auth_key_hex: &str,
) -> Result<Vec<u8>> {
    v003::decrypt(encrypted, encryption_key_hex, Some(auth_key_hex))
}

/// Decrypt a `001:`-framed string. Unauthenticated.
pub fn decrypt_001(encrypted: &str, encryption_key_hex: &str) -> Result<Vec<u8>> {
    v003::decrypt(encrypted, encryption_key_hex, None)
}

/// Produce a legacy-framed encrypted string under an explicit version tag.
/// Retained for interoperability fixtures; new content is always 004.
pub fn encrypt_with_version(
    version: &str,
    plaintext: &[u8],
    encryption_key_hex: &str,
    auth_key_hex: &str,
    uuid: &str,
) -> Result<String> {
    if !matches!(version, "001" | "002") {
        return Err(CryptoError::UnknownVersion(version.to_string()));
    }
    let framed = v003::encrypt(plaintext, encryption_key_hex, auth_key_hex, uuid)?;
    // Re-tag and re-authenticate under the requested version.
    let components = v003::parse_components(&framed)?;
    let string_to_auth = format!(
        "{}:{}:{}:{}",
        version, components.uuid, components.iv_hex, components.ciphertext_b64
    );
    let auth_hash = v003::hmac_sha256_hex(auth_key_hex, &string_to_auth)?;
    Ok(format!(
        "{}:{}:{}:{}:{}",
        version, auth_hash, components.uuid, components.iv_hex, components.ciphertext_b64
    ))
}

fn check_cost(cost: u32) -> Result<()> {
    if cost < MIN_COST {
        return Err(CryptoError::KdfFailed(format!(
            "Derivation cost {} below minimum {}",
            cost, MIN_COST
        )));
    }
    Ok(())
}

//! Protocol version tags and ordering.
//!
//! Every encrypted string carries a 3-digit version prefix (`"001"` through
//! `"004"`). `"000"` marks the unencrypted framing used by intents that opt
//! out of encryption. Unknown tags are rejected at parse time but still
//! order numerically, so a client can recognize content written by a newer
//! library version.

use crate::crypto::{CryptoError, Result};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

/// Prefix of content strings that are framed but not encrypted.
pub const UNENCRYPTED_PREFIX: &str = "000";

/// The newest protocol version; the only one used for encryption.
pub const LATEST_VERSION: ProtocolVersion = ProtocolVersion::V004;

/// A known encryption protocol version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ProtocolVersion {
    #[serde(rename = "001")]
    V001,
    #[serde(rename = "002")]
    V002,
    #[serde(rename = "003")]
    V003,
    #[serde(rename = "004")]
    V004,
}

impl ProtocolVersion {
    /// The 3-digit wire tag for this version.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::V001 => "001",
            Self::V002 => "002",
            Self::V003 => "003",
            Self::V004 => "004",
        }
    }

    /// Parse a 3-digit tag. Unknown tags are an error.
    pub fn parse(tag: &str) -> Result<Self> {
        match tag {
            "001" => Ok(Self::V001),
            "002" => Ok(Self::V002),
            "003" => Ok(Self::V003),
            "004" => Ok(Self::V004),
            other => Err(CryptoError::UnknownVersion(other.to_string())),
        }
    }

    /// Versions older than 003 carry weak KDF parameters and unauthenticated
    /// (001) encryption. Signing in against them succeeds but the caller
    /// should surface an outdated-protocol warning.
    pub fn is_outdated(&self) -> bool {
        matches!(self, Self::V001 | Self::V002)
    }

    /// Minimum acceptable password derivation cost for this version.
    /// 004 uses fixed Argon2id parameters, so any cost is acceptable.
    pub fn minimum_cost(&self) -> u32 {
        match self {
            Self::V001 | Self::V002 => 3_000,
            Self::V003 => 110_000,
            Self::V004 => 0,
        }
    }
}

impl fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Extract the 3-character version tag from an encrypted (or `000`) string.
pub fn version_tag_of(content: &str) -> Result<&str> {
    if content.len() < 3 || !content.is_char_boundary(3) {
        return Err(CryptoError::MalformedCiphertext(
            "Content shorter than a version tag".to_string(),
        ));
    }
    Ok(&content[..3])
}

/// Compare two version tags numerically (zero-padded decimal strings).
///
/// Works for tags this library does not know, so `"005"` correctly orders
/// newer than [`LATEST_VERSION`].
pub fn compare_version_tags(a: &str, b: &str) -> Ordering {
    let parse = |tag: &str| tag.trim_start_matches('0').parse::<u32>().unwrap_or(0);
    parse(a).cmp(&parse(b))
}

/// True iff `cost` meets the minimum password derivation cost for `version`.
pub fn supports_password_derivation_cost(version: ProtocolVersion, cost: u32) -> bool {
    cost >= version.minimum_cost()
}

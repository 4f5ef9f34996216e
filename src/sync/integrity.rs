//! Integrity hashing: detecting silent divergence from the server.
//!
//! Client and server both hash the `updated_at` timestamps of all live
//! items; a persistent mismatch marks the account out of sync.

use crate::crypto::sha256_hex;
use crate::payload::Payload;

/// Consecutive mismatches tolerated before declaring out-of-sync.
pub const MAX_DISCORDANCE: u32 = 5;

/// SHA-256 over the comma-joined `updated_at` microsecond strings of
/// non-deleted payloads, sorted by `updated_at` descending.
pub fn compute_integrity_hash<'a>(payloads: impl Iterator<Item = &'a Payload>) -> String {
    let mut timestamps: Vec<i64> = payloads
        .filter(|p| !p.deleted)
        .map(|p| p.updated_at)
        .collect();
    timestamps.sort_unstable_by(|a, b| b.cmp(a));

    let joined = timestamps
        .iter()
        .map(i64::to_string)
        .collect::<Vec<_>>()
        .join(",");
    sha256_hex(&joined)
}

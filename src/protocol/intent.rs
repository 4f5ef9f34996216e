//! Encryption intents: what an encrypted payload is destined for.

/// Destination of an encryption operation. Decrypted intents produce the
/// `000` framing instead of ciphertext.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncryptionIntent {
    /// Upload to the sync server.
    Sync,
    /// Upload to the sync server without encryption (explicit opt-out,
    /// e.g. an MFA secret stored during setup).
    SyncDecrypted,
    /// Persist to the local database, encrypted.
    LocalStorageEncrypted,
    /// Persist to the local database in the `000` framing (no keys
    /// available yet).
    LocalStorageDecrypted,
    /// Write to a decrypted backup file.
    FileDecrypted,
}

impl EncryptionIntent {
    /// Whether this intent produces real ciphertext.
    pub fn is_encrypted(&self) -> bool {
        matches!(self, Self::Sync | Self::LocalStorageEncrypted)
    }
}

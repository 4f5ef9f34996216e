//! The sync engine: queued state machine, conflict deltas and integrity
//! checking.

pub mod deltas;
pub mod engine;
pub mod integrity;

pub use engine::{SyncMode, SyncOptions, SyncService, SyncStatus, TimingStrategy};
pub use integrity::{compute_integrity_hash, MAX_DISCORDANCE};

use crate::api::ApiError;
use crate::crypto::CryptoError;
use crate::storage::StorageError;
use thiserror::Error;

/// Errors surfaced by sync operations. None of these escape as panics;
/// the engine converts them to `FailedSync` events for observers.
#[derive(Error, Debug)]
pub enum SyncError {
    #[error(transparent)]
    Api(#[from] ApiError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error("Sync aborted: {0}")]
    Aborted(String),
}

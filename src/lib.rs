//! CipherPad core: a client-side end-to-end encrypted sync engine.
//!
//! This library maintains a local collection of user items (notes, tags,
//! components, preferences, encryption keys), encrypts them with keys
//! derived from the account password, synchronizes them with an untrusted
//! server that only ever sees ciphertext, and reconciles concurrent edits
//! deterministically.
//!
//! Hosts inject three boundaries: persistence ([`device::DeviceInterface`]),
//! transport ([`api::ApiClient`]) and user prompts
//! ([`challenge::ChallengeResponder`]), then compose an
//! [`Application`] per storage namespace.

pub mod api;
pub mod application;
pub mod challenge;
pub mod crypto;
pub mod device;
pub mod events;
pub mod items;
pub mod keys;
pub mod migration;
pub mod payload;
pub mod protocol;
pub mod session;
pub mod storage;
pub mod sync;

pub use api::{ApiClient, HttpApiClient, Session, User};
pub use application::Application;
pub use challenge::{ChallengeReason, ChallengeResponder, ScriptedChallengeResponder};
pub use crypto::{CryptoError, ProtocolVersion};
pub use device::{DeviceInterface, MemoryDevice};
pub use events::{ApplicationEvent, EventBus};
pub use items::{Item, ItemManager, ItemMutator, ItemsKey, MutationType};
pub use keys::{KeyParams, KeyRecoveryService, RootKey};
pub use payload::{
    ContentType, ItemContent, Payload, PayloadCollection, PayloadManager, PayloadSource,
    RawPayload,
};
pub use protocol::{EncryptionIntent, ProtocolService};
pub use session::SessionService;
pub use storage::{StorageError, StorageService};
pub use sync::{SyncMode, SyncOptions, SyncService, SyncStatus, TimingStrategy};

use thiserror::Error;

/// General error type for core operations
#[derive(Error, Debug)]
pub enum CoreError {
    #[error("Crypto error: {0}")]
    Crypto(#[from] crypto::CryptoError),

    #[error("Storage error: {0}")]
    Storage(#[from] storage::StorageError),

    #[error("API error: {0}")]
    Api(#[from] api::ApiError),

    #[error("Session error: {0}")]
    Session(#[from] session::SessionError),

    #[error("Sync error: {0}")]
    Sync(#[from] sync::SyncError),

    #[error("Migration error: {0}")]
    Migration(#[from] migration::MigrationError),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Operation cancelled by user")]
    Cancelled,
}

/// Result type for core operations
pub type Result<T> = std::result::Result<T, CoreError>;

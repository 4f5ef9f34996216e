//! The key hierarchy: password-derived root keys and their recovery.

pub mod recovery;
pub mod root_key;

pub use recovery::KeyRecoveryService;
pub use root_key::{KeyParams, RootKey};

//! The server API boundary: wire models and the transport trait.
//!
//! The sync server is untrusted; everything it stores arrives encrypted.
//! Transport itself is injected through [`client::ApiClient`]; a default
//! `reqwest`-backed implementation ships for hosts that want one.

pub mod client;
pub mod models;

pub use client::{ApiClient, HttpApiClient};
pub use models::{
    AuthResponse, ChangePasswordRequest, ConflictEntry, ConflictType, RegisterRequest, Session,
    SignInRequest, SyncRequest, SyncResponse, User, API_VERSION,
};

use thiserror::Error;

/// Errors from the server boundary.
#[derive(Error, Debug)]
pub enum ApiError {
    #[error("Network failure: {0}")]
    Network(String),

    #[error("Session is invalid or expired")]
    InvalidSession,

    #[error("Server error {status}: {message}")]
    Server { status: u16, message: String },

    #[error("Malformed server response: {0}")]
    Serialization(String),
}

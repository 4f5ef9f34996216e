//! The session service: register, sign in, change password, sign out, and
//! session token lifecycle.
//!
//! The account password never leaves the client. Registration and sign-in
//! send only the `server_password` half of the derived root key; password
//! changes rotate the root key and mint a new default items key so every
//! item re-encrypts and re-uploads.

use crate::api::{
    ApiClient, ApiError, ChangePasswordRequest, RegisterRequest, Session, SignInRequest, User,
};
use crate::challenge::{ChallengeReason, ChallengeResponder};
use crate::events::{ApplicationEvent, EventBus};
use crate::keys::{KeyParams, RootKey};
use crate::payload::{PayloadManager, PayloadSource};
use crate::protocol::ProtocolService;
use crate::storage::{
    StorageService, ROOT_KEY_WRAPPER_PARAMS_KEY, SESSION_KEY, USER_KEY,
};
use serde_json::json;
use std::sync::{Arc, RwLock};
use thiserror::Error;
use tracing::{info, warn};

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("No active session")]
    NoSession,

    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("Account protocol version cannot be used: {0}")]
    UnsupportedKeyParams(String),

    #[error(transparent)]
    Api(#[from] ApiError),

    #[error(transparent)]
    Crypto(#[from] crate::crypto::CryptoError),

    #[error(transparent)]
    Storage(#[from] crate::storage::StorageError),
}

pub type Result<T> = std::result::Result<T, SessionError>;

/// Credential and session lifecycle.
pub struct SessionService {
    api: Arc<dyn ApiClient>,
    storage: Arc<StorageService>,
    protocol: Arc<ProtocolService>,
    payloads: Arc<PayloadManager>,
    challenges: Arc<dyn ChallengeResponder>,
    events: Arc<EventBus>,
    session: RwLock<Option<Session>>,
    user: RwLock<Option<User>>,
}

impl SessionService {
    pub fn new(
        api: Arc<dyn ApiClient>,
        storage: Arc<StorageService>,
        protocol: Arc<ProtocolService>,
        payloads: Arc<PayloadManager>,
        challenges: Arc<dyn ChallengeResponder>,
        events: Arc<EventBus>,
    ) -> Arc<SessionService> {
        Arc::new(SessionService {
            api,
            storage,
            protocol,
            payloads,
            challenges,
            events,
            session: RwLock::new(None),
            user: RwLock::new(None),
        })
    }

    pub fn session(&self) -> Option<Session> {
        self.session.read().unwrap().clone()
    }

    pub fn user(&self) -> Option<User> {
        self.user.read().unwrap().clone()
    }

    pub fn is_signed_in(&self) -> bool {
        self.session.read().unwrap().is_some()
    }

    /// Restore a persisted session and root key at launch. A wrapped root
    /// key prompts for the passcode; cancelling leaves keys locked.
    pub fn restore(&self) -> Result<()> {
        if let Some(session) = self.storage.get_value::<Session>(SESSION_KEY)? {
            *self.session.write().unwrap() = Some(session);
        }
        if let Some(user) = self.storage.get_value::<User>(USER_KEY)? {
            *self.user.write().unwrap() = Some(user);
        }

        let Some(keychain) = self.storage.keychain_value()? else {
            return Ok(());
        };

        if let Some(raw) = keychain.get("rootKey") {
            if let Ok(root) = serde_json::from_value::<RootKey>(raw.clone()) {
                self.protocol.set_root_key(Some(root));
                self.events.publish(ApplicationEvent::KeyStatusChanged);
            }
            return Ok(());
        }

        if let Some(wrapped) = keychain.get("wrappedRootKey").and_then(|v| v.as_str()) {
            let Some(wrapper_params) = self
                .storage
                .get_value::<KeyParams>(ROOT_KEY_WRAPPER_PARAMS_KEY)?
            else {
                return Ok(());
            };
            let Some(passcode) = self
                .challenges
                .prompt_password(&ChallengeReason::LocalPasscode)
            else {
                // Cancelled; the account stays locked until retried.
                return Ok(());
            };
            let wrapping_key = RootKey::derive(&passcode, &wrapper_params)?;
            let identifier = self
                .user()
                .map(|u| u.email)
                .unwrap_or_default();
            match RootKey::unwrap_with(wrapped, &wrapping_key, &identifier) {
                Ok(root) => {
                    self.protocol.set_root_key(Some(root));
                    self.events.publish(ApplicationEvent::KeyStatusChanged);
                }
                Err(e) => warn!(error = %e, "passcode failed to unwrap root key"),
            }
        }

        Ok(())
    }

    /// Register a new account, establish the root key and mint the first
    /// default items key.
    pub fn register(&self, email: &str, password: &str) -> Result<User> {
        let root = self.protocol.create_root_key(email, password)?;
        let request = RegisterRequest {
            email: email.to_string(),
            password: root.server_password.clone(),
            key_params: root.key_params.clone(),
        };
        let response = self.api.register(&request)?;

        self.accept_auth(response.user.clone(), response.session, root)?;
        self.protocol
            .create_new_default_items_key()
            .map_err(|e| SessionError::AuthenticationFailed(e.to_string()))?;
        info!(email, "registered");
        Ok(response.user)
    }

    /// Sign in to an existing account.
    pub fn sign_in(&self, email: &str, password: &str) -> Result<User> {
        let mut params = self.api.key_params(email)?;
        params.identifier = email.to_string();

        if params.version.is_outdated() {
            warn!(
                version = %params.version,
                "account uses an outdated protocol version; consider changing the password to upgrade"
            );
        }
        if !params.supports_derivation_cost() {
            return Err(SessionError::UnsupportedKeyParams(format!(
                "derivation cost below the {} minimum",
                params.version
            )));
        }

        let root = self.protocol.compute_root_key(password, &params)?;
        let request = SignInRequest {
            email: email.to_string(),
            password: root.server_password.clone(),
        };
        let response = match self.api.sign_in(&request) {
            Ok(response) => response,
            Err(ApiError::InvalidSession) | Err(ApiError::Server { status: 401, .. }) => {
                return Err(SessionError::AuthenticationFailed(
                    "Invalid email or password".to_string(),
                ))
            }
            Err(e) => return Err(e.into()),
        };

        self.accept_auth(response.user.clone(), response.session, root)?;
        info!(email, "signed in");
        Ok(response.user)
    }

    /// Sign in using a caller-supplied root key, already derived from
    /// embedded key params (key recovery path).
    pub fn sign_in_with_root_key(&self, email: &str, root: RootKey) -> Result<User> {
        let request = SignInRequest {
            email: email.to_string(),
            password: root.server_password.clone(),
        };
        let response = match self.api.sign_in(&request) {
            Ok(response) => response,
            Err(ApiError::InvalidSession) | Err(ApiError::Server { status: 401, .. }) => {
                return Err(SessionError::AuthenticationFailed(
                    "Invalid email or password".to_string(),
                ))
            }
            Err(e) => return Err(e.into()),
        };
        self.accept_auth(response.user.clone(), response.session, root)?;
        Ok(response.user)
    }

    /// Change the account password: new root key, new default items key,
    /// every item marked dirty for re-upload under the new hierarchy.
    pub fn change_password(&self, current_password: &str, new_password: &str) -> Result<()> {
        let session = self.session().ok_or(SessionError::NoSession)?;
        let current_root = self
            .protocol
            .root_key()
            .ok_or(SessionError::NoSession)?;

        let current_derived = self
            .protocol
            .compute_root_key(current_password, &current_root.key_params)?;
        if current_derived.server_password != current_root.server_password {
            return Err(SessionError::AuthenticationFailed(
                "Current password is incorrect".to_string(),
            ));
        }

        let email = current_root.key_params.identifier.clone();
        let new_root = self.protocol.create_root_key(&email, new_password)?;
        let request = ChangePasswordRequest {
            current_password: current_derived.server_password.clone(),
            new_password: new_root.server_password.clone(),
            key_params: new_root.key_params.clone(),
        };
        let response = self.api.change_password(&request, &session)?;

        self.accept_auth(response.user, response.session, new_root)?;
        self.protocol
            .create_new_default_items_key()
            .map_err(|e| SessionError::AuthenticationFailed(e.to_string()))?;
        self.mark_all_payloads_dirty();
        info!("password changed; items queued for re-encryption");
        Ok(())
    }

    /// Replace the in-memory root key and persist it, re-wrapping with the
    /// passcode when one is configured. Used by key recovery.
    pub fn replace_root_key(&self, root: RootKey) -> Result<()> {
        self.protocol.set_root_key(Some(root.clone()));
        self.persist_root_key(&root)?;
        self.events.publish(ApplicationEvent::KeyStatusChanged);
        Ok(())
    }

    /// Tear down the account: server-side best effort, then local wipe.
    pub fn sign_out(&self) -> Result<()> {
        if let Some(session) = self.session() {
            if let Err(e) = self.api.sign_out(&session) {
                warn!(error = %e, "server sign-out failed; clearing local state anyway");
            }
        }

        *self.session.write().unwrap() = None;
        *self.user.write().unwrap() = None;
        self.storage.remove_value(SESSION_KEY)?;
        self.storage.remove_value(USER_KEY)?;
        self.storage.remove_value(crate::storage::LAST_SYNC_TOKEN_KEY)?;
        self.storage.remove_value(crate::storage::PAGINATION_TOKEN_KEY)?;
        self.storage.clear_keychain_value()?;
        self.storage.clear_payloads()?;
        self.protocol.set_root_key(None);
        self.payloads.reset();

        self.events.publish(ApplicationEvent::SignedOut);
        self.events.publish(ApplicationEvent::MajorDataChange);
        Ok(())
    }

    /// Handle an HTTP 401 mid-sync: emit the event, prompt for the
    /// password, retry the sign-in once. Returns false when the user
    /// cancels or reauthentication fails.
    pub fn handle_invalid_session(&self) -> bool {
        self.events.publish(ApplicationEvent::InvalidSyncSession);
        let Some(user) = self.user() else { return false };
        let Some(password) = self
            .challenges
            .prompt_password(&ChallengeReason::Reauthentication)
        else {
            return false;
        };
        match self.sign_in(&user.email, &password) {
            Ok(_) => true,
            Err(e) => {
                warn!(error = %e, "reauthentication failed");
                false
            }
        }
    }

    /// Protect the stored root key with a local passcode.
    pub fn set_passcode(&self, passcode: &str) -> Result<()> {
        let root = self.protocol.root_key().ok_or(SessionError::NoSession)?;
        let wrapper_params = KeyParams::generate("local-passcode");
        let wrapping_key = RootKey::derive(passcode, &wrapper_params)?;

        self.storage
            .set_value(ROOT_KEY_WRAPPER_PARAMS_KEY, &wrapper_params)?;
        let wrapped = root.wrap_with(&wrapping_key)?;
        self.storage
            .set_keychain_value(json!({ "wrappedRootKey": wrapped }))?;
        self.events.publish(ApplicationEvent::KeyStatusChanged);
        Ok(())
    }

    fn accept_auth(&self, user: User, session: Session, root: RootKey) -> Result<()> {
        self.storage.set_value(SESSION_KEY, &session)?;
        self.storage.set_value(USER_KEY, &user)?;
        *self.session.write().unwrap() = Some(session);
        *self.user.write().unwrap() = Some(user);

        self.persist_root_key(&root)?;
        self.protocol.set_root_key(Some(root));

        self.events.publish(ApplicationEvent::SignedIn);
        self.events.publish(ApplicationEvent::KeyStatusChanged);
        Ok(())
    }

    fn persist_root_key(&self, root: &RootKey) -> Result<()> {
        let wrapper_params = self
            .storage
            .get_value::<KeyParams>(ROOT_KEY_WRAPPER_PARAMS_KEY)?;
        match wrapper_params {
            Some(params) => {
                let Some(passcode) = self
                    .challenges
                    .prompt_password(&ChallengeReason::LocalPasscode)
                else {
                    // Cancelled: hold the key in memory only this session.
                    return Ok(());
                };
                let wrapping_key = RootKey::derive(&passcode, &params)?;
                let wrapped = root.wrap_with(&wrapping_key)?;
                self.storage
                    .set_keychain_value(json!({ "wrappedRootKey": wrapped }))?;
            }
            None => {
                let value = serde_json::to_value(root).map_err(|e| {
                    crate::storage::StorageError::Serialization(e.to_string())
                })?;
                self.storage
                    .set_keychain_value(json!({ "rootKey": value }))?;
            }
        }
        Ok(())
    }

    fn mark_all_payloads_dirty(&self) {
        let now = chrono::Utc::now().timestamp_micros();
        let dirtied: Vec<_> = self
            .payloads
            .all_payloads()
            .into_iter()
            .map(|p| {
                p.to_builder()
                    .dirty(true)
                    .dirtied_at(Some(now))
                    .build()
            })
            .collect();
        if !dirtied.is_empty() {
            self.payloads
                .emit_payloads(dirtied, PayloadSource::LocalChanged);
        }
    }
}

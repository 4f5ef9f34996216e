//! Challenge prompts: the injected user-interaction boundary.
//!
//! Services that need a secret from the user (sign-in during key
//! recovery, reauthentication after a session expires) ask through
//! [`ChallengeResponder`]. A `None` response means the user cancelled;
//! the requesting operation aborts and callers handle the absence.

use std::collections::VecDeque;
use std::sync::Mutex;
use uuid::Uuid;

/// Why a prompt is being shown.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChallengeReason {
    /// Account password needed to sign in or verify identity.
    AccountPassword,
    /// Local passcode needed to unwrap the stored root key.
    LocalPasscode,
    /// Password needed to recover an undecryptable items key.
    KeyRecovery { key_uuid: Uuid },
    /// Session expired mid-operation; credentials needed to continue.
    Reauthentication,
}

/// Host-provided prompt surface.
pub trait ChallengeResponder: Send + Sync {
    /// Ask the user for a secret. `None` cancels the requesting operation.
    fn prompt_password(&self, reason: &ChallengeReason) -> Option<String>;
}

/// Responder that answers from a queue, then `None`. Useful for tests and
/// non-interactive hosts.
#[derive(Default)]
pub struct ScriptedChallengeResponder {
    responses: Mutex<VecDeque<Option<String>>>,
}

impl ScriptedChallengeResponder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_response(&self, response: Option<&str>) {
        self.responses
            .lock()
            .unwrap()
            .push_back(response.map(str::to_string));
    }
}

impl ChallengeResponder for ScriptedChallengeResponder {
    fn prompt_password(&self, _reason: &ChallengeReason) -> Option<String> {
        self.responses.lock().unwrap().pop_front().flatten()
    }
}

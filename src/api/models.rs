//! Wire models for the sync and credential endpoints.

use crate::keys::KeyParams;
use crate::payload::RawPayload;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// The API revision this library speaks.
pub const API_VERSION: &str = "20250115";

/// The signed-in account identity as the server reports it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub uuid: Uuid,
    pub email: String,
}

/// A bearer session issued at registration or sign-in.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub access_token: String,
    /// Unix seconds.
    pub expires_at: i64,
}

impl Session {
    pub fn is_expired(&self) -> bool {
        self.expires_at <= chrono::Utc::now().timestamp()
    }
}

/// Response to register, sign-in and change-password calls.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthResponse {
    pub user: User,
    pub session: Session,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_params: Option<KeyParams>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterRequest {
    pub email: String,
    /// The server-password half of the derived root key; never the real
    /// account password.
    pub password: String,
    pub key_params: KeyParams,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignInRequest {
    pub email: String,
    /// Server password derived from the account password.
    pub password: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangePasswordRequest {
    /// Current server password, proving knowledge of the old password.
    pub current_password: String,
    /// New server password.
    pub new_password: String,
    pub key_params: KeyParams,
}

/// One sync round's upload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncRequest {
    pub api: String,
    pub items: Vec<RawPayload>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sync_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cursor_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<u32>,
    #[serde(default)]
    pub compute_integrity: bool,
}

/// One sync round's download.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncResponse {
    #[serde(default)]
    pub retrieved_items: Vec<RawPayload>,
    #[serde(default)]
    pub saved_items: Vec<RawPayload>,
    #[serde(default)]
    pub conflicts: Vec<ConflictEntry>,
    pub sync_token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cursor_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub integrity_hash: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictType {
    /// Both sides changed since the last sync.
    SyncConflict,
    /// The uploaded uuid already belongs to another item.
    UuidConflict,
}

/// One server-reported conflict. `sync_conflict` carries the server's
/// copy; `uuid_conflict` returns the unsaved upload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConflictEntry {
    #[serde(rename = "type")]
    pub conflict_type: ConflictType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_item: Option<RawPayload>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unsaved_item: Option<RawPayload>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payload::{ContentType, Payload};

    #[test]
    fn conflict_type_wire_tags() {
        assert_eq!(
            serde_json::to_string(&ConflictType::SyncConflict).unwrap(),
            "\"sync_conflict\""
        );
        assert_eq!(
            serde_json::to_string(&ConflictType::UuidConflict).unwrap(),
            "\"uuid_conflict\""
        );
    }

    #[test]
    fn sync_request_roundtrip() {
        let payload = Payload::builder(Uuid::new_v4(), ContentType::Note).build();
        let request = SyncRequest {
            api: API_VERSION.to_string(),
            items: vec![payload.to_wire()],
            sync_token: Some("t1".to_string()),
            cursor_token: None,
            limit: Some(150),
            compute_integrity: true,
        };
        let json = serde_json::to_string(&request).unwrap();
        let back: SyncRequest = serde_json::from_str(&json).unwrap();
        assert_eq!(back.items.len(), 1);
        assert_eq!(back.sync_token.as_deref(), Some("t1"));
        assert!(back.compute_integrity);
    }

    #[test]
    fn session_expiry() {
        let live = Session {
            access_token: "t".to_string(),
            expires_at: chrono::Utc::now().timestamp() + 3_600,
        };
        assert!(!live.is_expired());

        let dead = Session {
            access_token: "t".to_string(),
            expires_at: chrono::Utc::now().timestamp() - 1,
        };
        assert!(dead.is_expired());
    }
}

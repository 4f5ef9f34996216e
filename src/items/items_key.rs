//! Items keys: per-user symmetric keys stored as regular syncable items.
//!
//! An items key wraps the per-item keys of every other payload, and is
//! itself encrypted under the root key. Key material is immutable once
//! created; rotation creates a new default key instead of editing one.

use crate::crypto::ProtocolVersion;
use crate::payload::{ContentType, ItemContent, Payload, PayloadContent};
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use zeroize::Zeroize;

/// The content body of an `SN|ItemsKey` item.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ItemsKeyContent {
    #[serde(rename = "itemsKey")]
    pub items_key: String,

    /// Present for keys created by ≤003 accounts.
    #[serde(
        rename = "dataAuthenticationKey",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub data_authentication_key: Option<String>,

    pub version: ProtocolVersion,

    #[serde(rename = "isDefault", default)]
    pub is_default: bool,
}

impl ItemsKeyContent {
    pub fn to_item_content(&self) -> ItemContent {
        let value = serde_json::to_value(self).expect("items key content serializes");
        let extra = match value {
            serde_json::Value::Object(map) => map.into_iter().collect(),
            _ => Default::default(),
        };
        ItemContent {
            extra,
            ..Default::default()
        }
    }

    pub fn from_item_content(content: &ItemContent) -> Option<Self> {
        let value = serde_json::Value::Object(content.extra.clone().into_iter().collect());
        serde_json::from_value(value).ok()
    }
}

impl Drop for ItemsKeyContent {
    fn drop(&mut self) {
        self.items_key.zeroize();
        if let Some(key) = self.data_authentication_key.as_mut() {
            key.zeroize();
        }
    }
}

/// A decrypted items key with its payload identity.
#[derive(Debug, Clone)]
pub struct ItemsKey {
    pub uuid: Uuid,
    pub content: ItemsKeyContent,
    /// Server timestamp of the backing payload; newer keys win when
    /// choosing a root key during recovery.
    pub updated_at: i64,
    pub created_at: i64,
}

impl ItemsKey {
    /// Parse an items key from a decrypted payload.
    pub fn from_payload(payload: &Payload) -> Option<ItemsKey> {
        if payload.content_type != ContentType::ItemsKey
            || payload.deleted
            || payload.error_decrypting
            || payload.waiting_for_key
        {
            return None;
        }
        let content = match &payload.content {
            PayloadContent::Decrypted(content) => ItemsKeyContent::from_item_content(content)?,
            _ => return None,
        };
        Some(ItemsKey {
            uuid: payload.uuid,
            content,
            updated_at: payload.updated_at,
            created_at: payload.created_at,
        })
    }

    pub fn is_default(&self) -> bool {
        self.content.is_default
    }

    pub fn version(&self) -> ProtocolVersion {
        self.content.version
    }

    /// Hex key material used to wrap per-item keys.
    pub fn material(&self) -> &str {
        &self.content.items_key
    }
}

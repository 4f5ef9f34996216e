//! The payload layer: immutable data units and their serialized forms.
//!
//! A payload holds one version of one item's state plus local sync
//! bookkeeping. Payloads are immutable after construction; every state
//! transition produces a new payload through [`PayloadBuilder`]. The
//! serialized [`RawPayload`] record models the field-subset variants: the
//! server wire shape omits local bookkeeping, saved-item responses omit
//! content, and the on-disk shape carries everything.

pub mod collection;
pub mod content;
pub mod manager;

pub use collection::PayloadCollection;
pub use content::{ContentReference, ItemContent, DEFAULT_APP_DOMAIN};
pub use manager::{EmitOutcome, ObserverHandle, PayloadManager};

use crate::crypto::version::version_tag_of;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use std::fmt;
use uuid::Uuid;

/// String discriminator for an item's type. Unknown tags round-trip
/// untouched so newer servers never lose data through older clients.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ContentType {
    Note,
    Tag,
    ItemsKey,
    Component,
    UserPreferences,
    Privileges,
    Other(String),
}

impl ContentType {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Note => "Note",
            Self::Tag => "Tag",
            Self::ItemsKey => "SN|ItemsKey",
            Self::Component => "SN|Component",
            Self::UserPreferences => "SN|UserPreferences",
            Self::Privileges => "SN|Privileges",
            Self::Other(tag) => tag,
        }
    }

    pub fn parse(tag: &str) -> Self {
        match tag {
            "Note" => Self::Note,
            "Tag" => Self::Tag,
            "SN|ItemsKey" => Self::ItemsKey,
            "SN|Component" => Self::Component,
            "SN|UserPreferences" => Self::UserPreferences,
            "SN|Privileges" => Self::Privileges,
            other => Self::Other(other.to_string()),
        }
    }

    /// Types required to have at most one live instance.
    pub fn is_singleton(&self) -> bool {
        matches!(self, Self::UserPreferences | Self::Privileges)
    }
}

impl fmt::Display for ContentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for ContentType {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for ContentType {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let tag = String::deserialize(deserializer)?;
        Ok(ContentType::parse(&tag))
    }
}

/// Where an emitted payload came from. Deltas and observers branch on this.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadSource {
    /// A local mutation through an item mutator.
    LocalChanged,
    /// Loaded from the local database at startup.
    LocalRetrieved,
    /// Written back after a local persistence round.
    LocalSaved,
    /// Downloaded from the server during sync.
    RemoteRetrieved,
    /// Acknowledged by the server after upload (metadata only).
    RemoteSaved,
    /// Produced by conflict resolution over server data.
    ConflictData,
    /// Produced by a server uuid collision.
    ConflictUuid,
    /// Re-sourced locally after the server rejected a save.
    RemoteRejected,
    /// Imported from a backup file.
    FileImport,
    /// Transient decryption result, not yet reconciled.
    DecryptedTransient,
}

impl PayloadSource {
    pub fn is_from_server(&self) -> bool {
        matches!(
            self,
            Self::RemoteRetrieved | Self::RemoteSaved | Self::ConflictData | Self::ConflictUuid
        )
    }
}

/// The content slot of a payload.
#[derive(Debug, Clone, PartialEq)]
pub enum PayloadContent {
    /// Parsed plaintext object.
    Decrypted(ItemContent),
    /// Version-prefixed ciphertext (or `000` framing) as received.
    Encrypted(String),
    /// No content (tombstones, metadata-only server responses).
    Absent,
}

impl PayloadContent {
    pub fn as_decrypted(&self) -> Option<&ItemContent> {
        match self {
            Self::Decrypted(content) => Some(content),
            _ => None,
        }
    }

    pub fn as_encrypted(&self) -> Option<&str> {
        match self {
            Self::Encrypted(s) => Some(s),
            _ => None,
        }
    }

    pub fn is_absent(&self) -> bool {
        matches!(self, Self::Absent)
    }
}

/// One immutable version of one item's state.
#[derive(Debug, Clone, PartialEq)]
pub struct Payload {
    pub uuid: Uuid,
    pub content_type: ContentType,
    pub content: PayloadContent,
    pub enc_item_key: Option<String>,
    pub items_key_id: Option<Uuid>,
    /// Microseconds since epoch; server-authoritative.
    pub created_at: i64,
    /// Microseconds since epoch; 0 = never synced. Only server data
    /// changes this.
    pub updated_at: i64,
    pub dirty: bool,
    pub dirtied_at: Option<i64>,
    pub last_sync_began: Option<i64>,
    pub last_sync_end: Option<i64>,
    pub deleted: bool,
    pub error_decrypting: bool,
    pub waiting_for_key: bool,
    /// Legacy (001/002) content hash.
    pub auth_hash: Option<String>,
    /// Legacy (001/002) per-item key params, carried verbatim. Key
    /// recovery reads embedded params from here when present.
    pub auth_params: Option<Value>,
}

impl Payload {
    /// Start a payload from scratch.
    pub fn builder(uuid: Uuid, content_type: ContentType) -> PayloadBuilder {
        PayloadBuilder::new(uuid, content_type)
    }

    /// Start a builder pre-populated with this payload's fields.
    pub fn to_builder(&self) -> PayloadBuilder {
        PayloadBuilder {
            payload: self.clone(),
        }
    }

    /// The 3-digit version tag of encrypted content, if any.
    pub fn version_tag(&self) -> Option<String> {
        self.content
            .as_encrypted()
            .and_then(|s| version_tag_of(s).ok())
            .map(str::to_string)
    }

    /// True if this payload was never acknowledged by the server.
    pub fn never_synced(&self) -> bool {
        self.updated_at == 0
    }

    /// Deleted-and-synced payloads can be purged after upload.
    pub fn discardable(&self) -> bool {
        self.deleted && !self.dirty
    }

    pub fn is_decrypted(&self) -> bool {
        matches!(self.content, PayloadContent::Decrypted(_))
    }

    /// Serialize for the server: content plus server-visible metadata only.
    pub fn to_wire(&self) -> RawPayload {
        RawPayload {
            uuid: self.uuid,
            content_type: self.content_type.clone(),
            content: content_to_value(&self.content),
            enc_item_key: self.enc_item_key.clone(),
            items_key_id: self.items_key_id,
            created_at: self.created_at,
            updated_at: self.updated_at,
            deleted: self.deleted,
            auth_hash: self.auth_hash.clone(),
            auth_params: self.auth_params.clone(),
            dirty: false,
            dirtied_at: None,
            last_sync_began: None,
            last_sync_end: None,
            error_decrypting: false,
            waiting_for_key: false,
        }
    }

    /// Serialize for the local database: everything, including sync
    /// bookkeeping and decryption state.
    pub fn to_stored(&self) -> RawPayload {
        RawPayload {
            dirty: self.dirty,
            dirtied_at: self.dirtied_at,
            last_sync_began: self.last_sync_began,
            last_sync_end: self.last_sync_end,
            error_decrypting: self.error_decrypting,
            waiting_for_key: self.waiting_for_key,
            ..self.to_wire()
        }
    }

    /// Rebuild a payload from a serialized record. Unparseable decrypted
    /// content is flagged rather than propagated as an error.
    pub fn from_raw(raw: RawPayload) -> Payload {
        let (content, parse_failed) = match raw.content {
            None => (PayloadContent::Absent, false),
            Some(Value::String(s)) => (PayloadContent::Encrypted(s), false),
            Some(value) => match serde_json::from_value::<ItemContent>(value) {
                Ok(content) => (PayloadContent::Decrypted(content), false),
                Err(_) => (PayloadContent::Absent, true),
            },
        };

        Payload {
            uuid: raw.uuid,
            content_type: raw.content_type,
            content,
            enc_item_key: raw.enc_item_key,
            items_key_id: raw.items_key_id,
            created_at: raw.created_at,
            updated_at: raw.updated_at,
            dirty: raw.dirty,
            dirtied_at: raw.dirtied_at,
            last_sync_began: raw.last_sync_began,
            last_sync_end: raw.last_sync_end,
            deleted: raw.deleted,
            error_decrypting: raw.error_decrypting || parse_failed,
            waiting_for_key: raw.waiting_for_key,
            auth_hash: raw.auth_hash,
            auth_params: raw.auth_params,
        }
    }
}

fn content_to_value(content: &PayloadContent) -> Option<Value> {
    match content {
        PayloadContent::Decrypted(item) => serde_json::to_value(item).ok(),
        PayloadContent::Encrypted(s) => Some(Value::String(s.clone())),
        PayloadContent::Absent => None,
    }
}

/// Builder producing new immutable payloads.
#[derive(Debug, Clone)]
pub struct PayloadBuilder {
    payload: Payload,
}

impl PayloadBuilder {
    pub fn new(uuid: Uuid, content_type: ContentType) -> Self {
        Self {
            payload: Payload {
                uuid,
                content_type,
                content: PayloadContent::Absent,
                enc_item_key: None,
                items_key_id: None,
                created_at: 0,
                updated_at: 0,
                dirty: false,
                dirtied_at: None,
                last_sync_began: None,
                last_sync_end: None,
                deleted: false,
                error_decrypting: false,
                waiting_for_key: false,
                auth_hash: None,
                auth_params: None,
            },
        }
    }

    pub fn uuid(mut self, uuid: Uuid) -> Self {
        self.payload.uuid = uuid;
        self
    }

    pub fn content(mut self, content: PayloadContent) -> Self {
        self.payload.content = content;
        self
    }

    pub fn decrypted_content(self, content: ItemContent) -> Self {
        self.content(PayloadContent::Decrypted(content))
    }

    pub fn enc_item_key(mut self, enc_item_key: Option<String>) -> Self {
        self.payload.enc_item_key = enc_item_key;
        self
    }

    pub fn items_key_id(mut self, items_key_id: Option<Uuid>) -> Self {
        self.payload.items_key_id = items_key_id;
        self
    }

    pub fn created_at(mut self, micros: i64) -> Self {
        self.payload.created_at = micros;
        self
    }

    pub fn updated_at(mut self, micros: i64) -> Self {
        self.payload.updated_at = micros;
        self
    }

    pub fn dirty(mut self, dirty: bool) -> Self {
        self.payload.dirty = dirty;
        self
    }

    pub fn dirtied_at(mut self, micros: Option<i64>) -> Self {
        self.payload.dirtied_at = micros;
        self
    }

    pub fn last_sync_began(mut self, micros: Option<i64>) -> Self {
        self.payload.last_sync_began = micros;
        self
    }

    pub fn last_sync_end(mut self, micros: Option<i64>) -> Self {
        self.payload.last_sync_end = micros;
        self
    }

    pub fn deleted(mut self, deleted: bool) -> Self {
        self.payload.deleted = deleted;
        self
    }

    pub fn error_decrypting(mut self, errored: bool) -> Self {
        self.payload.error_decrypting = errored;
        self
    }

    pub fn waiting_for_key(mut self, waiting: bool) -> Self {
        self.payload.waiting_for_key = waiting;
        self
    }

    pub fn auth_hash(mut self, auth_hash: Option<String>) -> Self {
        self.payload.auth_hash = auth_hash;
        self
    }

    pub fn auth_params(mut self, auth_params: Option<Value>) -> Self {
        self.payload.auth_params = auth_params;
        self
    }

    pub fn build(self) -> Payload {
        self.payload
    }
}

/// Serialized payload record shared by the server wire shape and the local
/// database. Optional fields model the payload variants; omitted fields
/// deserialize to their defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawPayload {
    pub uuid: Uuid,
    pub content_type: ContentType,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enc_item_key: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub items_key_id: Option<Uuid>,

    #[serde(with = "iso_micros")]
    pub created_at: i64,

    #[serde(with = "iso_micros")]
    pub updated_at: i64,

    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub deleted: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_hash: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_params: Option<Value>,

    // Local bookkeeping; never sent to the server.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub dirty: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dirtied_at: Option<i64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_sync_began: Option<i64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_sync_end: Option<i64>,

    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub error_decrypting: bool,

    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub waiting_for_key: bool,
}

/// ISO-8601 timestamps with microsecond precision over the wire, `i64`
/// microseconds in memory.
pub mod iso_micros {
    use chrono::{DateTime, SecondsFormat, TimeZone, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(micros: &i64, s: S) -> Result<S::Ok, S::Error> {
        let dt = Utc
            .timestamp_micros(*micros)
            .single()
            .unwrap_or_else(|| Utc.timestamp_micros(0).unwrap());
        s.serialize_str(&dt.to_rfc3339_opts(SecondsFormat::Micros, true))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<i64, D::Error> {
        let raw = String::deserialize(d)?;
        let dt = DateTime::parse_from_rfc3339(&raw).map_err(serde::de::Error::custom)?;
        Ok(dt.with_timezone(&Utc).timestamp_micros())
    }
}

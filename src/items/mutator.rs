//! Item mutators: the only path from an existing item to a new payload.

use crate::items::Item;
use crate::payload::{ContentReference, ContentType, ItemContent, Payload, DEFAULT_APP_DOMAIN};
use serde_json::{json, Value};
use uuid::Uuid;

/// Why a mutation happened. User interactions touch `client_updated_at`;
/// internal bookkeeping mutations do not.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MutationType {
    UserInteraction = 1,
    Internal = 2,
}

/// Accumulates changes against a working copy of an item's content and
/// produces a new dirty payload. The source item is never modified.
pub struct ItemMutator {
    base: Payload,
    content: ItemContent,
    mutation_type: MutationType,
    deleted: bool,
}

impl ItemMutator {
    pub fn new(item: &Item, mutation_type: MutationType) -> ItemMutator {
        ItemMutator {
            base: item.payload().clone(),
            content: item.content().clone(),
            mutation_type,
            deleted: item.payload().deleted,
        }
    }

    /// Build a mutator straight from a decrypted payload.
    pub(crate) fn from_payload(payload: &Payload, mutation_type: MutationType) -> Option<Self> {
        let content = payload.content.as_decrypted()?.clone();
        Some(ItemMutator {
            base: payload.clone(),
            content,
            mutation_type,
            deleted: payload.deleted,
        })
    }

    pub fn set_title(&mut self, title: impl Into<String>) {
        self.content.title = Some(title.into());
    }

    pub fn set_text(&mut self, text: impl Into<String>) {
        self.content.text = Some(text.into());
    }

    pub fn add_reference(&mut self, uuid: Uuid, content_type: ContentType) {
        self.content.add_reference(ContentReference { uuid, content_type });
    }

    pub fn remove_reference(&mut self, uuid: &Uuid) {
        self.content.remove_reference(uuid);
    }

    pub fn set_conflict_of(&mut self, uuid: Option<Uuid>) {
        self.content.conflict_of = uuid;
    }

    pub fn set_deleted(&mut self, deleted: bool) {
        self.deleted = deleted;
    }

    /// Write a domain-scoped app-data value.
    pub fn set_domain_data(&mut self, domain: &str, key: &str, value: Value) {
        self.content.set_app_data_value(domain, key, value);
    }

    /// Write a value under the preferences map (preferences items only by
    /// convention; the content model does not enforce it).
    pub fn set_preference(&mut self, key: &str, value: Value) {
        let preferences = self
            .content
            .extra
            .entry("preferences".to_string())
            .or_insert_with(|| json!({}));
        if let Value::Object(map) = preferences {
            map.insert(key.to_string(), value);
        }
    }

    /// Escape hatch for fields the typed setters do not cover.
    pub fn content_mut(&mut self) -> &mut ItemContent {
        &mut self.content
    }

    /// Produce the new payload: `dirty=true`, fresh `dirtied_at`, and for
    /// user interactions a touched `client_updated_at`.
    pub fn finish(mut self) -> Payload {
        let now = chrono::Utc::now().timestamp_micros();
        if self.mutation_type == MutationType::UserInteraction {
            self.content
                .set_app_data_value(DEFAULT_APP_DOMAIN, "client_updated_at", json!(now));
        }
        self.base
            .to_builder()
            .decrypted_content(self.content)
            .deleted(self.deleted)
            .dirty(true)
            .dirtied_at(Some(now))
            .build()
    }
}

//! Typed items: read-only views over decrypted payloads.
//!
//! An [`Item`] wraps a payload whose content has been decrypted. Domain
//! views (`NoteView`, `TagView`, preference access) add getters; all
//! mutation goes through [`mutator::ItemMutator`], which produces a new
//! dirty payload.

pub mod items_key;
pub mod manager;
pub mod mutator;

pub use items_key::{ItemsKey, ItemsKeyContent};
pub use manager::ItemManager;
pub use mutator::{ItemMutator, MutationType};

use crate::payload::{ContentType, ItemContent, Payload};
use serde_json::Value;
use uuid::Uuid;

/// A read-only typed view over a decrypted payload.
#[derive(Debug, Clone)]
pub struct Item {
    payload: Payload,
}

impl Item {
    /// Wrap a payload. Returns `None` unless the payload carries decrypted
    /// content; errored and waiting payloads never become items.
    pub fn from_payload(payload: Payload) -> Option<Item> {
        if payload.error_decrypting || payload.waiting_for_key {
            return None;
        }
        payload.content.as_decrypted()?;
        Some(Item { payload })
    }

    pub fn uuid(&self) -> Uuid {
        self.payload.uuid
    }

    pub fn content_type(&self) -> &ContentType {
        &self.payload.content_type
    }

    pub fn content(&self) -> &ItemContent {
        // Guaranteed by construction.
        self.payload.content.as_decrypted().expect("decrypted item")
    }

    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    pub fn into_payload(self) -> Payload {
        self.payload
    }

    pub fn created_at(&self) -> i64 {
        self.payload.created_at
    }

    pub fn updated_at(&self) -> i64 {
        self.payload.updated_at
    }

    pub fn dirty(&self) -> bool {
        self.payload.dirty
    }

    pub fn deleted(&self) -> bool {
        self.payload.deleted
    }

    pub fn conflict_of(&self) -> Option<Uuid> {
        self.content().conflict_of
    }

    pub fn is_singleton(&self) -> bool {
        self.payload.content_type.is_singleton()
    }

    pub fn note(&self) -> Option<NoteView<'_>> {
        (self.payload.content_type == ContentType::Note).then_some(NoteView(self))
    }

    pub fn tag(&self) -> Option<TagView<'_>> {
        (self.payload.content_type == ContentType::Tag).then_some(TagView(self))
    }

    pub fn component(&self) -> Option<ComponentView<'_>> {
        (self.payload.content_type == ContentType::Component).then_some(ComponentView(self))
    }

    pub fn preferences(&self) -> Option<PreferencesView<'_>> {
        (self.payload.content_type == ContentType::UserPreferences)
            .then_some(PreferencesView(self))
    }

    pub fn privileges(&self) -> Option<PrivilegesView<'_>> {
        (self.payload.content_type == ContentType::Privileges).then_some(PrivilegesView(self))
    }
}

/// Getters specific to notes.
pub struct NoteView<'a>(&'a Item);

impl NoteView<'_> {
    pub fn title(&self) -> &str {
        self.0.content().title.as_deref().unwrap_or_default()
    }

    pub fn text(&self) -> &str {
        self.0.content().text.as_deref().unwrap_or_default()
    }
}

/// Getters specific to tags.
pub struct TagView<'a>(&'a Item);

impl TagView<'_> {
    pub fn title(&self) -> &str {
        self.0.content().title.as_deref().unwrap_or_default()
    }

    /// Notes under this tag are its outgoing references.
    pub fn note_uuids(&self) -> Vec<Uuid> {
        self.0
            .content()
            .references
            .iter()
            .filter(|r| r.content_type == ContentType::Note)
            .map(|r| r.uuid)
            .collect()
    }
}

/// Getters specific to components (editors, themes).
pub struct ComponentView<'a>(&'a Item);

impl ComponentView<'_> {
    pub fn name(&self) -> &str {
        self.0.content().title.as_deref().unwrap_or_default()
    }

    pub fn hosted_url(&self) -> Option<&str> {
        self.0
            .content()
            .extra
            .get("hosted_url")
            .and_then(Value::as_str)
    }

    pub fn area(&self) -> Option<&str> {
        self.0.content().extra.get("area").and_then(Value::as_str)
    }
}

/// Getters over the singleton privileges item: which credentials gate
/// which protected actions.
pub struct PrivilegesView<'a>(&'a Item);

impl PrivilegesView<'_> {
    /// Credential names required for a protected action.
    pub fn credentials_for_action(&self, action: &str) -> Vec<String> {
        self.0
            .content()
            .extra
            .get("desktopPrivileges")
            .and_then(Value::as_object)
            .and_then(|map| map.get(action))
            .and_then(Value::as_array)
            .map(|list| {
                list.iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// Getters over the singleton preferences item.
pub struct PreferencesView<'a>(&'a Item);

impl PreferencesView<'_> {
    pub fn value(&self, key: &str) -> Option<&Value> {
        self.0
            .content()
            .extra
            .get("preferences")
            .and_then(Value::as_object)
            .and_then(|map| map.get(key))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payload::PayloadContent;
    use serde_json::json;

    #[test]
    fn errored_payloads_never_become_items() {
        let errored = Payload::builder(Uuid::new_v4(), ContentType::Note)
            .content(PayloadContent::Encrypted("004:a:b:c".to_string()))
            .error_decrypting(true)
            .build();
        assert!(Item::from_payload(errored).is_none());

        let waiting = Payload::builder(Uuid::new_v4(), ContentType::Note)
            .content(PayloadContent::Encrypted("004:a:b:c".to_string()))
            .waiting_for_key(true)
            .build();
        assert!(Item::from_payload(waiting).is_none());
    }

    #[test]
    fn note_view_exposes_title_and_text() {
        let payload = Payload::builder(Uuid::new_v4(), ContentType::Note)
            .decrypted_content(ItemContent {
                title: Some("groceries".to_string()),
                text: Some("milk".to_string()),
                ..Default::default()
            })
            .build();
        let item = Item::from_payload(payload).unwrap();
        let note = item.note().unwrap();
        assert_eq!(note.title(), "groceries");
        assert_eq!(note.text(), "milk");
        assert!(item.tag().is_none());
    }

    #[test]
    fn preferences_view_reads_values() {
        let mut content = ItemContent::default();
        content
            .extra
            .insert("preferences".to_string(), json!({"editorLeft": 300}));
        let payload = Payload::builder(Uuid::new_v4(), ContentType::UserPreferences)
            .decrypted_content(content)
            .build();
        let item = Item::from_payload(payload).unwrap();
        assert!(item.is_singleton());
        assert_eq!(
            item.preferences().unwrap().value("editorLeft"),
            Some(&json!(300))
        );
        assert_eq!(item.preferences().unwrap().value("missing"), None);
    }
}

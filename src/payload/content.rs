//! Decrypted item content: the parsed object carried by a payload.
//!
//! Content is deliberately loose. Known fields (`title`, `text`,
//! `references`, `appData`, `conflict_of`) are typed; everything else
//! round-trips through `extra` untouched, since validating user content
//! schemas is a non-goal.

use crate::payload::ContentType;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use uuid::Uuid;

/// The app-data domain this library writes under.
pub const DEFAULT_APP_DOMAIN: &str = "org.cipherpad.app";

/// Top-level content keys excluded from conflict equality checks.
const CONTENT_KEYS_TO_IGNORE: &[&str] = &["conflict_of"];

/// App-data keys excluded from conflict equality checks, per domain.
const APP_DATA_KEYS_TO_IGNORE: &[&str] = &["client_updated_at"];

/// A directed reference from one item's content to another item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentReference {
    pub uuid: Uuid,
    pub content_type: ContentType,
}

/// The decrypted content object of an item.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ItemContent {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub references: Vec<ContentReference>,

    #[serde(rename = "appData", default, skip_serializing_if = "BTreeMap::is_empty")]
    pub app_data: BTreeMap<String, BTreeMap<String, Value>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conflict_of: Option<Uuid>,

    /// Unvalidated fields preserved verbatim (editor state, key material
    /// for items keys, preference maps, component manifests).
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl ItemContent {
    /// True if this content references the given item.
    pub fn references_uuid(&self, uuid: &Uuid) -> bool {
        self.references.iter().any(|r| &r.uuid == uuid)
    }

    /// Add a reference, ignoring duplicates.
    pub fn add_reference(&mut self, reference: ContentReference) {
        if !self.references_uuid(&reference.uuid) {
            self.references.push(reference);
        }
    }

    /// Remove any reference to the given item.
    pub fn remove_reference(&mut self, uuid: &Uuid) {
        self.references.retain(|r| &r.uuid != uuid);
    }

    /// Union the other content's references into this one.
    pub fn merge_references_from(&mut self, other: &ItemContent) {
        for reference in &other.references {
            self.add_reference(reference.clone());
        }
    }

    /// Read a domain-scoped app-data value.
    pub fn app_data_value(&self, domain: &str, key: &str) -> Option<&Value> {
        self.app_data.get(domain).and_then(|d| d.get(key))
    }

    /// Write a domain-scoped app-data value.
    pub fn set_app_data_value(&mut self, domain: &str, key: &str, value: Value) {
        self.app_data
            .entry(domain.to_string())
            .or_default()
            .insert(key.to_string(), value);
    }

    /// Structural equality for conflict detection. Ignores `conflict_of`
    /// and per-domain `client_updated_at`, which change on duplication and
    /// on every local touch respectively.
    pub fn equals_for_conflicts(&self, other: &ItemContent) -> bool {
        comparable_value(self) == comparable_value(other)
    }

    /// Equality over everything except the reference array. Together with
    /// [`Self::equals_for_conflicts`] this distinguishes "only the links
    /// changed" conflicts, which merge instead of duplicating.
    pub fn equals_ignoring_references(&self, other: &ItemContent) -> bool {
        let strip = |content: &ItemContent| {
            let mut v = comparable_value(content);
            if let Value::Object(map) = &mut v {
                map.remove("references");
            }
            v
        };
        strip(self) == strip(other)
    }

    /// True when the two contents differ only in their reference arrays.
    pub fn differs_only_in_references(&self, other: &ItemContent) -> bool {
        !self.equals_for_conflicts(other) && self.equals_ignoring_references(other)
    }
}

/// Serialize content to a JSON value with volatile keys removed.
fn comparable_value(content: &ItemContent) -> Value {
    let mut value = serde_json::to_value(content).unwrap_or(Value::Null);
    if let Value::Object(map) = &mut value {
        for key in CONTENT_KEYS_TO_IGNORE {
            map.remove(*key);
        }
        if let Some(Value::Object(domains)) = map.get_mut("appData") {
            for (_, domain) in domains.iter_mut() {
                if let Value::Object(entries) = domain {
                    for key in APP_DATA_KEYS_TO_IGNORE {
                        entries.remove(*key);
                    }
                }
            }
        }
    }
    value
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn note_content(text: &str) -> ItemContent {
        ItemContent {
            title: Some("Title".to_string()),
            text: Some(text.to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn references_add_remove() {
        let mut content = ItemContent::default();
        let target = Uuid::new_v4();
        content.add_reference(ContentReference {
            uuid: target,
            content_type: ContentType::Tag,
        });
        content.add_reference(ContentReference {
            uuid: target,
            content_type: ContentType::Tag,
        });
        assert_eq!(content.references.len(), 1);
        assert!(content.references_uuid(&target));

        content.remove_reference(&target);
        assert!(!content.references_uuid(&target));
    }

    #[test]
    fn conflict_equality_ignores_conflict_of() {
        let a = note_content("same");
        let mut b = note_content("same");
        b.conflict_of = Some(Uuid::new_v4());
        assert!(a.equals_for_conflicts(&b));
    }

    #[test]
    fn conflict_equality_ignores_client_updated_at() {
        let mut a = note_content("same");
        let mut b = note_content("same");
        a.set_app_data_value(DEFAULT_APP_DOMAIN, "client_updated_at", json!(1));
        b.set_app_data_value(DEFAULT_APP_DOMAIN, "client_updated_at", json!(2));
        assert!(a.equals_for_conflicts(&b));

        b.set_app_data_value(DEFAULT_APP_DOMAIN, "pinned", json!(true));
        assert!(!a.equals_for_conflicts(&b));
    }

    #[test]
    fn detects_reference_only_differences() {
        let mut a = note_content("same");
        let b = note_content("same");
        a.add_reference(ContentReference {
            uuid: Uuid::new_v4(),
            content_type: ContentType::Tag,
        });
        assert!(a.differs_only_in_references(&b));

        let c = note_content("different");
        assert!(!a.differs_only_in_references(&c));
    }

    #[test]
    fn extra_fields_roundtrip() {
        let json = json!({
            "title": "t",
            "editorWidth": 420,
            "custom": {"nested": true}
        });
        let content: ItemContent = serde_json::from_value(json.clone()).unwrap();
        assert_eq!(content.extra.get("editorWidth"), Some(&json!(420)));
        let back = serde_json::to_value(&content).unwrap();
        assert_eq!(back, json);
    }

    #[test]
    fn app_data_assignment_overwrites() {
        let mut content = ItemContent::default();
        content.set_app_data_value(DEFAULT_APP_DOMAIN, "pinned", json!(false));
        content.set_app_data_value(DEFAULT_APP_DOMAIN, "pinned", json!(true));
        assert_eq!(
            content.app_data_value(DEFAULT_APP_DOMAIN, "pinned"),
            Some(&json!(true))
        );
    }
}

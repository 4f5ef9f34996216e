//! The item manager: typed item collection atop the payload manager.
//!
//! Maintains a reverse-reference index so `items_referencing_item` is
//! O(k), filters errored and waiting payloads out of user-visible item
//! streams, and enforces singleton content types after every emission.

use crate::items::{Item, ItemMutator, ItemsKey, MutationType};
use crate::payload::{
    ContentType, EmitOutcome, ItemContent, Payload, PayloadManager, PayloadSource,
};
use crate::{CoreError, Result};
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, Weak};
use uuid::Uuid;

#[derive(Default)]
struct ReferenceGraph {
    /// uuid → uuids its content references.
    outgoing: HashMap<Uuid, Vec<Uuid>>,
    /// uuid → uuids whose content references it.
    incoming: HashMap<Uuid, BTreeSet<Uuid>>,
}

impl ReferenceGraph {
    fn set_outgoing(&mut self, source: Uuid, targets: Vec<Uuid>) {
        self.clear_outgoing(&source);
        for target in &targets {
            self.incoming.entry(*target).or_default().insert(source);
        }
        if targets.is_empty() {
            self.outgoing.remove(&source);
        } else {
            self.outgoing.insert(source, targets);
        }
    }

    fn clear_outgoing(&mut self, source: &Uuid) {
        if let Some(previous) = self.outgoing.remove(source) {
            for target in previous {
                if let Some(set) = self.incoming.get_mut(&target) {
                    set.remove(source);
                }
            }
        }
    }

    fn referencers(&self, target: &Uuid) -> Vec<Uuid> {
        self.incoming
            .get(target)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default()
    }
}

/// Typed item collection over the payload manager.
pub struct ItemManager {
    payloads: Arc<PayloadManager>,
    references: Mutex<ReferenceGraph>,
}

impl ItemManager {
    /// Create the manager and subscribe it to payload emissions.
    pub fn new(payloads: Arc<PayloadManager>) -> Arc<ItemManager> {
        let manager = Arc::new(ItemManager {
            payloads: Arc::clone(&payloads),
            references: Mutex::new(ReferenceGraph::default()),
        });

        let weak: Weak<ItemManager> = Arc::downgrade(&manager);
        payloads.add_observer(move |outcome| {
            if let Some(manager) = weak.upgrade() {
                manager.handle_emission(outcome);
            }
        });

        manager
    }

    pub fn payload_manager(&self) -> &Arc<PayloadManager> {
        &self.payloads
    }

    fn handle_emission(&self, outcome: &EmitOutcome) {
        let mut singleton_types: BTreeSet<ContentType> = BTreeSet::new();

        {
            let mut graph = self.references.lock().unwrap();
            for payload in &outcome.discarded {
                graph.clear_outgoing(&payload.uuid);
            }
            for payload in outcome.applied() {
                match payload.content.as_decrypted() {
                    Some(content) if !payload.deleted => {
                        let targets = content.references.iter().map(|r| r.uuid).collect();
                        graph.set_outgoing(payload.uuid, targets);
                    }
                    _ => graph.clear_outgoing(&payload.uuid),
                }
                if payload.content_type.is_singleton() {
                    singleton_types.insert(payload.content_type.clone());
                }
            }
        }

        for content_type in singleton_types {
            self.enforce_singleton(&content_type);
        }
    }

    /// Keep the earliest-created live instance of a singleton type; mark
    /// the rest deleted and dirty so the deletions propagate to the server.
    fn enforce_singleton(&self, content_type: &ContentType) {
        let mut live: Vec<Payload> = self
            .payloads
            .payloads_of_type(content_type)
            .into_iter()
            .filter(|p| !p.deleted && p.is_decrypted())
            .collect();
        if live.len() <= 1 {
            return;
        }

        live.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.uuid.cmp(&b.uuid))
        });

        let now = chrono::Utc::now().timestamp_micros();
        let losers: Vec<Payload> = live
            .into_iter()
            .skip(1)
            .map(|p| {
                p.to_builder()
                    .deleted(true)
                    .dirty(true)
                    .dirtied_at(Some(now))
                    .build()
            })
            .collect();

        tracing::debug!(
            content_type = %content_type,
            removed = losers.len(),
            "enforcing singleton"
        );
        self.payloads
            .emit_payloads(losers, PayloadSource::LocalChanged);
    }

    /// All user-visible items: decrypted, not deleted, not errored.
    pub fn items(&self) -> Vec<Item> {
        self.payloads
            .all_payloads()
            .into_iter()
            .filter(|p| !p.deleted)
            .filter_map(Item::from_payload)
            .collect()
    }

    pub fn item(&self, uuid: &Uuid) -> Option<Item> {
        let payload = self.payloads.get(uuid)?;
        if payload.deleted {
            return None;
        }
        Item::from_payload(payload)
    }

    pub fn items_of_type(&self, content_type: &ContentType) -> Vec<Item> {
        self.payloads
            .payloads_of_type(content_type)
            .into_iter()
            .filter(|p| !p.deleted)
            .filter_map(Item::from_payload)
            .collect()
    }

    /// Items whose content references the given item.
    pub fn items_referencing_item(&self, uuid: &Uuid) -> Vec<Item> {
        let referencers = self.references.lock().unwrap().referencers(uuid);
        referencers
            .into_iter()
            .filter_map(|source| self.item(&source))
            .collect()
    }

    /// Payloads that failed decryption and await repair.
    pub fn invalid_items(&self) -> Vec<Payload> {
        self.payloads
            .all_payloads()
            .into_iter()
            .filter(|p| p.error_decrypting)
            .collect()
    }

    /// Every decrypted, non-deleted items key.
    pub fn items_keys(&self) -> Vec<ItemsKey> {
        self.payloads
            .payloads_of_type(&ContentType::ItemsKey)
            .iter()
            .filter_map(ItemsKey::from_payload)
            .collect()
    }

    /// The items key designated for new encryptions, preferring the
    /// explicit default flag and falling back to the newest key.
    pub fn default_items_key(&self) -> Option<ItemsKey> {
        let mut keys = self.items_keys();
        if let Some(index) = keys.iter().position(ItemsKey::is_default) {
            return Some(keys.swap_remove(index));
        }
        keys.into_iter().max_by_key(|k| k.updated_at)
    }

    /// Mutate an item through a fresh mutator and emit the result.
    pub fn change_item<F>(&self, uuid: &Uuid, mutation_type: MutationType, f: F) -> Result<Item>
    where
        F: FnOnce(&mut ItemMutator),
    {
        let payload = self
            .payloads
            .get(uuid)
            .ok_or_else(|| CoreError::NotFound(format!("No item with uuid {}", uuid)))?;
        let mut mutator = ItemMutator::from_payload(&payload, mutation_type)
            .ok_or_else(|| CoreError::InvalidInput("Item content is not decrypted".to_string()))?;
        f(&mut mutator);
        let new_payload = mutator.finish();

        self.payloads
            .emit_payloads(vec![new_payload.clone()], PayloadSource::LocalChanged);
        Item::from_payload(new_payload)
            .ok_or_else(|| CoreError::InvalidInput("Mutation produced invalid item".to_string()))
    }

    /// Create a new dirty item from content.
    pub fn create_item(&self, content_type: ContentType, content: ItemContent) -> Result<Item> {
        let now = chrono::Utc::now().timestamp_micros();
        let payload = Payload::builder(Uuid::new_v4(), content_type)
            .decrypted_content(content)
            .created_at(now)
            .dirty(true)
            .dirtied_at(Some(now))
            .build();
        self.payloads
            .emit_payloads(vec![payload.clone()], PayloadSource::LocalChanged);
        Item::from_payload(payload)
            .ok_or_else(|| CoreError::InvalidInput("Creation produced invalid item".to_string()))
    }

    /// Tombstone an item; the deletion uploads on the next sync.
    pub fn set_item_deleted(&self, uuid: &Uuid) -> Result<()> {
        self.change_item(uuid, MutationType::UserInteraction, |mutator| {
            mutator.set_deleted(true);
        })
        .map(|_| ())
    }
}

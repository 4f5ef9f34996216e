//! Payload collections indexed by uuid and by content type.

use crate::payload::{ContentType, Payload};
use std::collections::{BTreeSet, HashMap};
use uuid::Uuid;

/// A set of payloads with O(1) uuid lookup and a content-type index.
///
/// The master collection owned by the payload manager is one of these;
/// delta processors build and return owned collections, treated as
/// immutable results by their callers.
#[derive(Debug, Clone, Default)]
pub struct PayloadCollection {
    map: HashMap<Uuid, Payload>,
    by_type: HashMap<ContentType, BTreeSet<Uuid>>,
}

impl PayloadCollection {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_payloads(payloads: Vec<Payload>) -> Self {
        let mut collection = Self::new();
        for payload in payloads {
            collection.set(payload);
        }
        collection
    }

    pub fn get(&self, uuid: &Uuid) -> Option<&Payload> {
        self.map.get(uuid)
    }

    pub fn contains(&self, uuid: &Uuid) -> bool {
        self.map.contains_key(uuid)
    }

    /// Insert or replace, keeping the type index consistent even when a
    /// payload changes content type (uuid conflicts re-home items).
    pub fn set(&mut self, payload: Payload) {
        if let Some(previous) = self.map.get(&payload.uuid) {
            if previous.content_type != payload.content_type {
                if let Some(set) = self.by_type.get_mut(&previous.content_type) {
                    set.remove(&payload.uuid);
                }
            }
        }
        self.by_type
            .entry(payload.content_type.clone())
            .or_default()
            .insert(payload.uuid);
        self.map.insert(payload.uuid, payload);
    }

    pub fn discard(&mut self, uuid: &Uuid) -> Option<Payload> {
        let removed = self.map.remove(uuid)?;
        if let Some(set) = self.by_type.get_mut(&removed.content_type) {
            set.remove(uuid);
        }
        Some(removed)
    }

    pub fn all(&self) -> impl Iterator<Item = &Payload> {
        self.map.values()
    }

    pub fn all_of_type<'a>(&'a self, content_type: &ContentType) -> Vec<&'a Payload> {
        self.by_type
            .get(content_type)
            .map(|uuids| uuids.iter().filter_map(|u| self.map.get(u)).collect())
            .unwrap_or_default()
    }

    pub fn uuids(&self) -> Vec<Uuid> {
        self.map.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn into_payloads(self) -> Vec<Payload> {
        self.map.into_values().collect()
    }
}

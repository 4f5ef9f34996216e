//! The payload manager: owner of the authoritative in-memory collection.
//!
//! All payload state flows through [`PayloadManager::emit_payloads`].
//! Emissions are applied atomically to the master collection, then
//! observers are notified in registration order with the partitioned
//! outcome. Observers run with no locks held, so they may read the master
//! collection or emit further payloads without deadlocking.

use crate::payload::{ContentType, Payload, PayloadCollection, PayloadSource};
use std::sync::{Arc, Mutex};
use uuid::Uuid;

/// The partitioned result of one emission.
#[derive(Debug, Clone)]
pub struct EmitOutcome {
    /// Payloads that replaced an existing master entry.
    pub changed: Vec<Payload>,
    /// Payloads new to the master collection.
    pub inserted: Vec<Payload>,
    /// Payloads removed from the master collection (synced tombstones).
    pub discarded: Vec<Payload>,
    /// Payloads rejected by the ignored-key rule.
    pub ignored: Vec<Payload>,
    pub source: PayloadSource,
}

impl EmitOutcome {
    /// Every payload the master collection accepted.
    pub fn applied(&self) -> impl Iterator<Item = &Payload> {
        self.changed.iter().chain(self.inserted.iter())
    }

    /// Count of items touched by this emission, for major-change events.
    pub fn touched(&self) -> usize {
        self.changed.len() + self.inserted.len() + self.discarded.len()
    }
}

type ObserverCallback = Arc<dyn Fn(&EmitOutcome) + Send + Sync>;

struct RegisteredObserver {
    id: u64,
    callback: ObserverCallback,
}

/// Handle returned by [`PayloadManager::add_observer`]; pass back to
/// [`PayloadManager::remove_observer`] to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObserverHandle(u64);

/// Owner of the master payload collection and its observer list.
pub struct PayloadManager {
    master: Mutex<PayloadCollection>,
    observers: Mutex<Vec<RegisteredObserver>>,
    next_observer_id: Mutex<u64>,
}

impl Default for PayloadManager {
    fn default() -> Self {
        Self::new()
    }
}

impl PayloadManager {
    pub fn new() -> Self {
        Self {
            master: Mutex::new(PayloadCollection::new()),
            observers: Mutex::new(Vec::new()),
            next_observer_id: Mutex::new(0),
        }
    }

    /// Subscribe to emissions. Callbacks fire in registration order, once
    /// per emit, after the master collection is fully updated.
    pub fn add_observer<F>(&self, callback: F) -> ObserverHandle
    where
        F: Fn(&EmitOutcome) + Send + Sync + 'static,
    {
        let mut next_id = self.next_observer_id.lock().unwrap();
        let id = *next_id;
        *next_id += 1;

        self.observers.lock().unwrap().push(RegisteredObserver {
            id,
            callback: Arc::new(callback),
        });
        ObserverHandle(id)
    }

    pub fn remove_observer(&self, handle: ObserverHandle) {
        self.observers
            .lock()
            .unwrap()
            .retain(|observer| observer.id != handle.0);
    }

    /// Insert or overlay payloads into the master collection, then notify
    /// observers.
    ///
    /// Ignored-key rule: an incoming `SN|ItemsKey` payload that failed to
    /// decrypt never replaces a master copy that decrypts successfully.
    /// Items-key material is immutable, so an undecryptable arrival is a
    /// key mismatch, not an update.
    pub fn emit_payloads(&self, payloads: Vec<Payload>, source: PayloadSource) -> EmitOutcome {
        let mut outcome = EmitOutcome {
            changed: Vec::new(),
            inserted: Vec::new(),
            discarded: Vec::new(),
            ignored: Vec::new(),
            source,
        };

        {
            let mut master = self.master.lock().unwrap();
            for payload in payloads {
                let existing = master.get(&payload.uuid);

                let keeps_healthy_key = payload.content_type == ContentType::ItemsKey
                    && payload.error_decrypting
                    && existing
                        .map(|current| current.is_decrypted() && !current.error_decrypting)
                        .unwrap_or(false);
                if keeps_healthy_key {
                    outcome.ignored.push(payload);
                    continue;
                }

                if payload.discardable() {
                    if master.discard(&payload.uuid).is_some() {
                        outcome.discarded.push(payload);
                    }
                    continue;
                }

                if existing.is_some() {
                    outcome.changed.push(payload.clone());
                } else {
                    outcome.inserted.push(payload.clone());
                }
                master.set(payload);
            }
        }

        self.notify(&outcome);
        outcome
    }

    fn notify(&self, outcome: &EmitOutcome) {
        let callbacks: Vec<ObserverCallback> = self
            .observers
            .lock()
            .unwrap()
            .iter()
            .map(|observer| Arc::clone(&observer.callback))
            .collect();
        for callback in callbacks {
            callback(outcome);
        }
    }

    pub fn get(&self, uuid: &Uuid) -> Option<Payload> {
        self.master.lock().unwrap().get(uuid).cloned()
    }

    /// Snapshot of the master collection, used as the base of deltas.
    pub fn master_collection(&self) -> PayloadCollection {
        self.master.lock().unwrap().clone()
    }

    pub fn all_payloads(&self) -> Vec<Payload> {
        self.master.lock().unwrap().all().cloned().collect()
    }

    pub fn payloads_of_type(&self, content_type: &ContentType) -> Vec<Payload> {
        self.master
            .lock()
            .unwrap()
            .all_of_type(content_type)
            .into_iter()
            .cloned()
            .collect()
    }

    pub fn dirty_payloads(&self) -> Vec<Payload> {
        self.master
            .lock()
            .unwrap()
            .all()
            .filter(|p| p.dirty)
            .cloned()
            .collect()
    }

    /// Drop every payload without observer dispatch. Sign-out resets state
    /// wholesale; the caller emits the appropriate lifecycle event.
    pub fn reset(&self) {
        *self.master.lock().unwrap() = PayloadCollection::new();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payload::{ItemContent, PayloadContent};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn decrypted_key_payload(uuid: Uuid) -> Payload {
        Payload::builder(uuid, ContentType::ItemsKey)
            .decrypted_content(ItemContent::default())
            .build()
    }

    fn errored_key_payload(uuid: Uuid) -> Payload {
        Payload::builder(uuid, ContentType::ItemsKey)
            .content(PayloadContent::Encrypted("004:a:b:c".to_string()))
            .error_decrypting(true)
            .build()
    }

    #[test]
    fn emit_partitions_inserted_and_changed() {
        let manager = PayloadManager::new();
        let payload = Payload::builder(Uuid::new_v4(), ContentType::Note).build();

        let first = manager.emit_payloads(vec![payload.clone()], PayloadSource::LocalChanged);
        assert_eq!(first.inserted.len(), 1);
        assert!(first.changed.is_empty());

        let second = manager.emit_payloads(vec![payload], PayloadSource::LocalChanged);
        assert_eq!(second.changed.len(), 1);
        assert!(second.inserted.is_empty());
    }

    #[test]
    fn synced_tombstones_are_discarded() {
        let manager = PayloadManager::new();
        let payload = Payload::builder(Uuid::new_v4(), ContentType::Note).build();
        let uuid = payload.uuid;
        manager.emit_payloads(vec![payload.clone()], PayloadSource::LocalChanged);

        let tombstone = payload.to_builder().deleted(true).dirty(false).build();
        let outcome = manager.emit_payloads(vec![tombstone], PayloadSource::RemoteSaved);
        assert_eq!(outcome.discarded.len(), 1);
        assert!(manager.get(&uuid).is_none());
    }

    #[test]
    fn errored_items_key_never_replaces_healthy_copy() {
        let manager = PayloadManager::new();
        let uuid = Uuid::new_v4();
        manager.emit_payloads(
            vec![decrypted_key_payload(uuid)],
            PayloadSource::LocalRetrieved,
        );

        let outcome = manager.emit_payloads(
            vec![errored_key_payload(uuid)],
            PayloadSource::RemoteRetrieved,
        );
        assert_eq!(outcome.ignored.len(), 1);
        assert!(outcome.changed.is_empty());

        let master = manager.get(&uuid).unwrap();
        assert!(master.is_decrypted());
        assert!(!master.error_decrypting);
    }

    #[test]
    fn errored_items_key_accepted_when_no_healthy_copy() {
        let manager = PayloadManager::new();
        let uuid = Uuid::new_v4();
        let outcome = manager.emit_payloads(
            vec![errored_key_payload(uuid)],
            PayloadSource::RemoteRetrieved,
        );
        assert_eq!(outcome.inserted.len(), 1);
        assert!(manager.get(&uuid).unwrap().error_decrypting);
    }

    #[test]
    fn observers_fire_in_registration_order() {
        let manager = Arc::new(PayloadManager::new());
        let counter = Arc::new(AtomicUsize::new(0));

        let first_saw = Arc::new(AtomicUsize::new(usize::MAX));
        let second_saw = Arc::new(AtomicUsize::new(usize::MAX));

        {
            let counter = Arc::clone(&counter);
            let first_saw = Arc::clone(&first_saw);
            manager.add_observer(move |_| {
                first_saw.store(counter.fetch_add(1, Ordering::SeqCst), Ordering::SeqCst);
            });
        }
        {
            let counter = Arc::clone(&counter);
            let second_saw = Arc::clone(&second_saw);
            manager.add_observer(move |_| {
                second_saw.store(counter.fetch_add(1, Ordering::SeqCst), Ordering::SeqCst);
            });
        }

        manager.emit_payloads(
            vec![Payload::builder(Uuid::new_v4(), ContentType::Note).build()],
            PayloadSource::LocalChanged,
        );

        assert_eq!(first_saw.load(Ordering::SeqCst), 0);
        assert_eq!(second_saw.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn removed_observer_stops_firing() {
        let manager = PayloadManager::new();
        let counter = Arc::new(AtomicUsize::new(0));

        let handle = {
            let counter = Arc::clone(&counter);
            manager.add_observer(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            })
        };

        manager.emit_payloads(
            vec![Payload::builder(Uuid::new_v4(), ContentType::Note).build()],
            PayloadSource::LocalChanged,
        );
        manager.remove_observer(handle);
        manager.emit_payloads(
            vec![Payload::builder(Uuid::new_v4(), ContentType::Note).build()],
            PayloadSource::LocalChanged,
        );

        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn observers_see_updated_master() {
        let manager = Arc::new(PayloadManager::new());
        let seen = Arc::new(AtomicUsize::new(0));
        {
            let manager_ref = Arc::clone(&manager);
            let seen = Arc::clone(&seen);
            manager.add_observer(move |outcome| {
                for payload in outcome.applied() {
                    if manager_ref.get(&payload.uuid).is_some() {
                        seen.fetch_add(1, Ordering::SeqCst);
                    }
                }
            });
        }

        manager.emit_payloads(
            vec![Payload::builder(Uuid::new_v4(), ContentType::Note).build()],
            PayloadSource::LocalChanged,
        );
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }
}

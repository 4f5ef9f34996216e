//! Application lifecycle events and their observer registry.

use std::sync::{Arc, Mutex};

/// Events emitted to host observers across the library lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplicationEvent {
    Started,
    Launched,
    LocalDataLoaded,
    KeyStatusChanged,
    CompletedFullSync,
    CompletedIncrementalSync,
    FailedSync,
    EnteredOutOfSync,
    ExitedOutOfSync,
    SignedIn,
    SignedOut,
    /// A sync round touched at least [`MAJOR_DATA_CHANGE_THRESHOLD`] items.
    MajorDataChange,
    WillSync,
    InvalidSyncSession,
    LocalDatabaseReadError,
    LocalDatabaseWriteError,
    MigrationsLoaded,
    StorageReady,
    PreferencesChanged,
    UserRolesChanged,
}

/// Item count at which a sync round is considered a major data change.
pub const MAJOR_DATA_CHANGE_THRESHOLD: usize = 15;

type EventCallback = Arc<dyn Fn(ApplicationEvent) + Send + Sync>;

/// Handle for unsubscribing an event observer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventObserverHandle(u64);

/// Observer registry for lifecycle events. Callbacks fire synchronously in
/// registration order.
pub struct EventBus {
    observers: Mutex<Vec<(u64, EventCallback)>>,
    next_id: Mutex<u64>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            observers: Mutex::new(Vec::new()),
            next_id: Mutex::new(0),
        }
    }

    pub fn add_observer<F>(&self, callback: F) -> EventObserverHandle
    where
        F: Fn(ApplicationEvent) + Send + Sync + 'static,
    {
        let mut next_id = self.next_id.lock().unwrap();
        let id = *next_id;
        *next_id += 1;
        self.observers
            .lock()
            .unwrap()
            .push((id, Arc::new(callback)));
        EventObserverHandle(id)
    }

    pub fn remove_observer(&self, handle: EventObserverHandle) {
        self.observers
            .lock()
            .unwrap()
            .retain(|(id, _)| *id != handle.0);
    }

    pub fn publish(&self, event: ApplicationEvent) {
        tracing::debug!(?event, "application event");
        let callbacks: Vec<EventCallback> = self
            .observers
            .lock()
            .unwrap()
            .iter()
            .map(|(_, cb)| Arc::clone(cb))
            .collect();
        for callback in callbacks {
            callback(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn publish_reaches_observers_in_order() {
        let bus = EventBus::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        for label in ["first", "second"] {
            let order = Arc::clone(&order);
            bus.add_observer(move |event| {
                if event == ApplicationEvent::SignedIn {
                    order.lock().unwrap().push(label);
                }
            });
        }

        bus.publish(ApplicationEvent::SignedIn);
        assert_eq!(*order.lock().unwrap(), vec!["first", "second"]);
    }

    #[test]
    fn removed_observer_is_silent() {
        let bus = EventBus::new();
        let count = Arc::new(AtomicUsize::new(0));
        let handle = {
            let count = Arc::clone(&count);
            bus.add_observer(move |_| {
                count.fetch_add(1, Ordering::SeqCst);
            })
        };

        bus.publish(ApplicationEvent::Started);
        bus.remove_observer(handle);
        bus.publish(ApplicationEvent::Started);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}

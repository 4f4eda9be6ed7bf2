//! Change events and notifications.

use crate::key::ResourceKey;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

/// Kind of change an [`Event`] reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    /// The object appeared.
    Added,
    /// The object changed, or was re-observed by a relist or resync.
    Updated,
    /// The object is gone.
    Deleted,
}

impl EventKind {
    /// Short label used in logs and reports.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Added => "ADD",
            Self::Updated => "UPDATE",
            Self::Deleted => "DELETE",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Raw change received from a [`crate::ResourceSource`] watch stream.
#[derive(Debug, Clone)]
pub enum Notification<K> {
    /// Object created.
    Added(K),
    /// Object modified.
    Modified(K),
    /// Object deleted; carries the final known state.
    Deleted(K),
    /// Progress marker carrying a newer resource version, no object change.
    Bookmark(String),
}

/// A typed, immutable change event.
///
/// The snapshot is advisory. Workers re-read the [`crate::Mirror`] before
/// reconciling and fall back to the snapshot only when the object is gone.
#[derive(Debug, Clone)]
pub struct Event<K> {
    /// Identity of the changed resource.
    pub key: ResourceKey,
    /// What happened.
    pub kind: EventKind,
    /// Namespace of the resource, if namespaced.
    pub namespace: Option<String>,
    /// Kind of the resource, e.g. `Deployment`.
    pub resource_type: String,
    /// Object state at emission time.
    pub snapshot: Arc<K>,
}

/// Latest event recorded per key.
///
/// The work queue only carries keys; the ledger keeps the most recent event
/// for each queued key so a worker can recover the kind and last-known
/// snapshot. Later events for the same key replace earlier ones.
#[derive(Debug)]
pub struct EventLedger<K> {
    events: Mutex<HashMap<ResourceKey, Arc<Event<K>>>>,
}

impl<K> Default for EventLedger<K> {
    fn default() -> Self {
        Self {
            events: Mutex::new(HashMap::new()),
        }
    }
}

impl<K> EventLedger<K> {
    /// Creates an empty ledger.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records `event` as the latest for its key.
    pub fn record(&self, event: Event<K>) -> Arc<Event<K>> {
        let event = Arc::new(event);
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(event.key.clone(), Arc::clone(&event));
        event
    }

    /// Returns the latest event recorded for `key`.
    pub fn latest(&self, key: &ResourceKey) -> Option<Arc<Event<K>>> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }

    /// Drops the entry for `key` if it is still `handled`.
    ///
    /// An event recorded after `handled` was taken stays in place so the
    /// pending redelivery still sees it.
    pub fn settle(&self, key: &ResourceKey, handled: &Arc<Event<K>>) {
        let mut events = self.events.lock().unwrap_or_else(PoisonError::into_inner);
        if events.get(key).is_some_and(|current| Arc::ptr_eq(current, handled)) {
            events.remove(key);
        }
    }

    /// Number of keys with an unsettled event.
    pub fn len(&self) -> usize {
        self.events.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Whether every recorded event has been settled.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

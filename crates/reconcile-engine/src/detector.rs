//! Change detection.
//!
//! Turns each notification the mirror applies into exactly one [`Event`].
//! No buffering or coalescing happens here; the work queue deduplicates.

use crate::Object;
use crate::event::{Event, EventKind};
use crate::key::ResourceKey;
use kube::ResourceExt;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};

/// Receiver of detected events.
pub trait EventSink<K>: Send + Sync {
    /// Delivers one event. Must not block.
    fn deliver(&self, event: Event<K>);
}

/// Stateless translator from applied changes to typed events.
pub struct ChangeDetector<K> {
    resource_type: String,
    sink: Arc<dyn EventSink<K>>,
}

impl<K> fmt::Debug for ChangeDetector<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChangeDetector")
            .field("resource_type", &self.resource_type)
            .finish_non_exhaustive()
    }
}

impl<K: Object> ChangeDetector<K> {
    /// Creates a detector delivering into `sink`.
    pub fn new(sink: Arc<dyn EventSink<K>>) -> Self {
        Self {
            resource_type: K::kind(&()).into_owned(),
            sink,
        }
    }

    /// Derives the event for one applied change and delivers it.
    ///
    /// Objects without a derivable key are logged and dropped.
    pub fn observe(&self, kind: EventKind, object: Arc<K>) {
        let key = match ResourceKey::for_object(object.as_ref()) {
            Ok(key) => key,
            Err(e) => {
                warn!("Dropping {} {} notification: {}", self.resource_type, kind, e);
                return;
            }
        };
        debug!("Detected {} for {} {}", kind, self.resource_type, key);
        self.sink.deliver(Event {
            key,
            kind,
            namespace: object.namespace(),
            resource_type: self.resource_type.clone(),
            snapshot: object,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{RecordingSink, deployment};
    use k8s_openapi::api::apps::v1::Deployment;

    #[test]
    fn test_observe_emits_one_event() {
        let sink = Arc::new(RecordingSink::<Deployment>::default());
        let detector: ChangeDetector<Deployment> = ChangeDetector::new(sink.clone());

        detector.observe(EventKind::Updated, Arc::new(deployment("ns", "foo", 2)));

        let events = sink.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].key, ResourceKey::from("ns/foo"));
        assert_eq!(events[0].kind, EventKind::Updated);
        assert_eq!(events[0].namespace.as_deref(), Some("ns"));
        assert_eq!(events[0].resource_type, "Deployment");
    }

    #[test]
    fn test_nameless_object_is_dropped() {
        let sink = Arc::new(RecordingSink::<Deployment>::default());
        let detector: ChangeDetector<Deployment> = ChangeDetector::new(sink.clone());

        detector.observe(EventKind::Added, Arc::new(Deployment::default()));

        assert!(sink.events().is_empty());
    }
}

//! Worker loop.
//!
//! Each worker pulls a key, re-reads the object from the mirror, and hands it
//! to the reconciler. Failures and panics requeue the key with backoff; they
//! never end the worker.

use crate::Object;
use crate::error::ReconcileError;
use crate::event::{EventKind, EventLedger};
use crate::key::ResourceKey;
use crate::mirror::Mirror;
use crate::queue::WorkQueue;
use crate::reconciler::Reconciler;
use futures::FutureExt;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Shared handles a worker operates on.
pub(crate) struct Worker<K: Object> {
    pub(crate) id: usize,
    pub(crate) queue: Arc<WorkQueue>,
    pub(crate) mirror: Arc<Mirror<K>>,
    pub(crate) ledger: Arc<EventLedger<K>>,
    pub(crate) reconciler: Arc<dyn Reconciler<K>>,
}

impl<K: Object> Worker<K> {
    /// Processes keys until the queue is shut down and drained.
    pub(crate) async fn run(self) {
        debug!("Worker {} started", self.id);
        while self.process_next_item().await {}
        info!("Worker {} stopped: work queue is shut down", self.id);
    }

    /// Handles one key. Returns false once the queue is shut down and empty.
    pub(crate) async fn process_next_item(&self) -> bool {
        let Some(key) = self.queue.get().await else {
            return false;
        };

        match self.sync(&key).await {
            Ok(()) => self.queue.forget(&key),
            Err(e) => {
                error!(
                    worker = self.id,
                    key = %key,
                    retries = self.queue.num_requeues(&key),
                    "Error processing {}: {}",
                    key,
                    e
                );
                self.queue.add_rate_limited(key.clone());
            }
        }
        self.queue.done(&key);
        true
    }

    async fn sync(&self, key: &ResourceKey) -> Result<(), ReconcileError> {
        let event = self.ledger.latest(key);
        let current = self.mirror.get_by_key(key);

        let (kind, object) = match (&event, current) {
            // Re-created after a queued delete: the live object is new again.
            (Some(event), Some(current)) if event.kind == EventKind::Deleted => (EventKind::Added, current),
            (Some(event), Some(current)) => (event.kind, current),
            // Deleted after enqueue: hand over the event's last-known state.
            (Some(event), None) => (EventKind::Deleted, Arc::clone(&event.snapshot)),
            (None, Some(current)) => (EventKind::Updated, current),
            (None, None) => match self.mirror.last_known(key) {
                Some(last) => (EventKind::Deleted, last),
                None => {
                    warn!("Nothing known about {}, skipping", key);
                    return Ok(());
                }
            },
        };

        debug!("Worker {} reconciling [{}] {}", self.id, kind, key);
        let outcome = AssertUnwindSafe(self.reconciler.reconcile(kind, key, &object))
            .catch_unwind()
            .await
            .unwrap_or_else(|panic| Err(ReconcileError::Panicked(panic_message(panic.as_ref()))));

        if outcome.is_ok() {
            if let Some(event) = &event {
                self.ledger.settle(key, event);
            }
        }
        outcome
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "non-string panic payload".to_string())
}

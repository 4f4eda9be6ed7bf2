//! Reconciliation callback.

use crate::Object;
use crate::error::ReconcileError;
use crate::event::EventKind;
use crate::key::ResourceKey;
use async_trait::async_trait;

/// Business logic invoked once per dequeued key.
///
/// Delivery is at-least-once: the same `(kind, object)` may be seen more than
/// once, so implementations must be idempotent. Returning an error schedules
/// a rate-limited retry; a panic is caught and treated the same way.
#[async_trait]
pub trait Reconciler<K: Object>: Send + Sync {
    /// Reconciles `key`.
    ///
    /// `object` is the mirror's current state, or the last known state when
    /// `kind` is [`EventKind::Deleted`] and the object is gone.
    async fn reconcile(&self, kind: EventKind, key: &ResourceKey, object: &K) -> Result<(), ReconcileError>;
}

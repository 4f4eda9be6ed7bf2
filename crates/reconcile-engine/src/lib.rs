//! Reconcile Engine
//!
//! Event-queue reconciliation for declarative resources. A [`Controller`]
//! mirrors a remote store locally, turns every applied change into an
//! [`Event`], coalesces events per [`ResourceKey`] in a rate-limited
//! [`WorkQueue`], and drives a [`Reconciler`] from a pool of workers.
//!
//! Data flow:
//!
//! ```text
//! ResourceSource -> Mirror (list + watch) -> ChangeDetector -> WorkQueue -> workers -> Reconciler
//! ```
//!
//! Delivery is at-least-once: reconcilers must tolerate redundant calls for
//! the same object state.

pub mod backoff;
pub mod controller;
pub mod detector;
pub mod error;
pub mod event;
pub mod key;
pub mod mirror;
pub mod queue;
pub mod reconciler;
pub mod source;
mod worker;

#[cfg(test)]
mod test_utils;

pub use backoff::{ExponentialBackoff, ItemExponentialRateLimiter, RateLimiter};
pub use controller::{Controller, ControllerConfig, LifecycleState};
pub use detector::{ChangeDetector, EventSink};
pub use error::{ControllerError, KeyError, ReconcileError, SourceError};
pub use event::{Event, EventKind, EventLedger, Notification};
pub use key::ResourceKey;
pub use mirror::Mirror;
pub use queue::WorkQueue;
pub use reconciler::Reconciler;
pub use source::{KubeSource, Listing, NotificationStream, ResourceSource};

use kube::Resource;
use serde::de::DeserializeOwned;
use std::fmt::Debug;

/// Resource types the engine can mirror and reconcile.
///
/// Blanket-implemented for every statically typed Kubernetes resource
/// (all `k8s-openapi` types and `#[derive(CustomResource)]` kinds).
pub trait Object: Resource<DynamicType = ()> + Clone + Debug + DeserializeOwned + Send + Sync + 'static {}

impl<K> Object for K where K: Resource<DynamicType = ()> + Clone + Debug + DeserializeOwned + Send + Sync + 'static {}

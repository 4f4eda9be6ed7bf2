//! Remote store access.
//!
//! The engine only needs an initial listing and a change stream resumable
//! from a resource version. [`KubeSource`] provides both over a `kube::Api`.

use crate::Object;
use crate::error::SourceError;
use crate::event::Notification;
use async_trait::async_trait;
use futures::StreamExt;
use futures::stream::BoxStream;
use kube::Api;
use kube::api::{ListParams, WatchEvent, WatchParams};
use tracing::debug;

/// Initial snapshot of a collection.
#[derive(Debug, Clone)]
pub struct Listing<K> {
    /// Every object present at listing time.
    pub items: Vec<K>,
    /// Version to resume watching from.
    pub resource_version: String,
}

/// Change stream returned by [`ResourceSource::watch`].
pub type NotificationStream<'a, K> = BoxStream<'a, Result<Notification<K>, SourceError>>;

/// Capability to list and watch a collection of resources.
///
/// All methods must be `Send` to work with Tokio's work-stealing runtime.
#[async_trait]
pub trait ResourceSource<K: Object>: Send + Sync {
    /// Lists every object in the collection.
    async fn list(&self) -> Result<Listing<K>, SourceError>;

    /// Streams changes that happened after `resource_version`.
    ///
    /// The stream ends when the server closes the watch; the caller resumes
    /// from the last version it saw.
    async fn watch<'a>(&'a self, resource_version: &'a str) -> Result<NotificationStream<'a, K>, SourceError>;
}

/// [`ResourceSource`] backed by the Kubernetes API.
#[derive(Clone)]
pub struct KubeSource<K> {
    api: Api<K>,
    list_params: ListParams,
    watch_params: WatchParams,
}

impl<K: Object> KubeSource<K> {
    /// Watch timeout; the apiserver rejects anything above 295s.
    const WATCH_TIMEOUT_SECS: u32 = 290;

    /// Creates a source over `api` with default list and watch parameters.
    pub fn new(api: Api<K>) -> Self {
        Self {
            api,
            list_params: ListParams::default(),
            watch_params: WatchParams::default().timeout(Self::WATCH_TIMEOUT_SECS),
        }
    }

    /// Restricts listing and watching to objects matching `selector`.
    #[must_use]
    pub fn labels(mut self, selector: &str) -> Self {
        self.list_params = self.list_params.labels(selector);
        self.watch_params = self.watch_params.labels(selector);
        self
    }
}

impl<K> std::fmt::Debug for KubeSource<K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KubeSource")
            .field("list_params", &self.list_params)
            .field("watch_params", &self.watch_params)
            .finish_non_exhaustive()
    }
}

fn into_notification<K>(event: WatchEvent<K>) -> Result<Notification<K>, SourceError> {
    match event {
        WatchEvent::Added(obj) => Ok(Notification::Added(obj)),
        WatchEvent::Modified(obj) => Ok(Notification::Modified(obj)),
        WatchEvent::Deleted(obj) => Ok(Notification::Deleted(obj)),
        WatchEvent::Bookmark(bookmark) => Ok(Notification::Bookmark(bookmark.metadata.resource_version)),
        WatchEvent::Error(status) if status.code == 410 => Err(SourceError::Gone(format!("{status:?}"))),
        WatchEvent::Error(status) => Err(SourceError::Transport(format!("{status:?}"))),
    }
}

#[async_trait]
impl<K: Object> ResourceSource<K> for KubeSource<K> {
    async fn list(&self) -> Result<Listing<K>, SourceError> {
        let list = self.api.list(&self.list_params).await?;
        debug!("Listed {} objects", list.items.len());
        Ok(Listing {
            resource_version: list.metadata.resource_version.unwrap_or_default(),
            items: list.items,
        })
    }

    async fn watch<'a>(&'a self, resource_version: &'a str) -> Result<NotificationStream<'a, K>, SourceError> {
        let stream = self.api.watch(&self.watch_params, resource_version).await?;
        Ok(stream
            .map(|event| event.map_err(SourceError::from).and_then(into_notification))
            .boxed())
    }
}

//! Test utilities for the engine
//!
//! In-memory source, recording sink and reconciler, and a log capture
//! dispatch for asserting on emitted log lines.

use crate::Object;
use crate::detector::EventSink;
use crate::error::{ReconcileError, SourceError};
use crate::event::{Event, EventKind, Notification};
use crate::key::ResourceKey;
use crate::reconciler::Reconciler;
use crate::source::{Listing, NotificationStream, ResourceSource};
use async_trait::async_trait;
use futures::StreamExt;
use futures::stream;
use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use std::collections::{HashMap, HashSet};
use std::io;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::Dispatch;

/// Helper to create a test Deployment with a replica count
pub fn deployment(namespace: &str, name: &str, replicas: i32) -> Deployment {
    Deployment {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            ..Default::default()
        },
        spec: Some(DeploymentSpec {
            replicas: Some(replicas),
            ..Default::default()
        }),
        status: None,
    }
}

/// Replica count of a Deployment built by [`deployment`]
pub fn replicas(deployment: &Deployment) -> i32 {
    deployment.spec.as_ref().and_then(|spec| spec.replicas).unwrap_or_default()
}

/// Sink that keeps every delivered event
#[derive(Debug)]
pub struct RecordingSink<K> {
    events: Mutex<Vec<Event<K>>>,
}

impl<K> Default for RecordingSink<K> {
    fn default() -> Self {
        Self {
            events: Mutex::new(Vec::new()),
        }
    }
}

impl<K: Clone> RecordingSink<K> {
    pub fn events(&self) -> Vec<Event<K>> {
        self.events.lock().unwrap().clone()
    }

    pub fn clear(&self) {
        self.events.lock().unwrap().clear();
    }
}

impl<K: Object> EventSink<K> for RecordingSink<K> {
    fn deliver(&self, event: Event<K>) {
        self.events.lock().unwrap().push(event);
    }
}

pub type NotificationSender<K> = mpsc::UnboundedSender<Result<Notification<K>, SourceError>>;
type NotificationReceiver<K> = mpsc::UnboundedReceiver<Result<Notification<K>, SourceError>>;

/// How [`FakeSource`] answers watch calls
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WatchMode {
    /// First watch streams the channel, later ones stay open and silent
    Channel,
    /// Every watch call fails with a transport error
    Fail,
    /// Every watch ends immediately without producing anything
    Close,
}

/// In-memory [`ResourceSource`]
///
/// Lists return the configured items. The first watch streams whatever is
/// pushed through the sender returned by [`FakeSource::new`]; later watches
/// stay open without producing anything.
pub struct FakeSource<K> {
    items: Vec<K>,
    resource_version: String,
    failing_lists: AtomicU32,
    fatal: bool,
    list_calls: AtomicU32,
    watch_mode: WatchMode,
    watch_versions: Mutex<Vec<String>>,
    notifications: Mutex<Option<NotificationReceiver<K>>>,
}

impl<K: Object> FakeSource<K> {
    pub fn new(items: Vec<K>) -> (Self, NotificationSender<K>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let source = Self {
            items,
            resource_version: "1".to_string(),
            failing_lists: AtomicU32::new(0),
            fatal: false,
            list_calls: AtomicU32::new(0),
            watch_mode: WatchMode::Channel,
            watch_versions: Mutex::new(Vec::new()),
            notifications: Mutex::new(Some(rx)),
        };
        (source, tx)
    }

    /// The next `n` list calls fail with a transport error
    pub fn fail_lists(self, n: u32) -> Self {
        self.failing_lists.store(n, Ordering::SeqCst);
        self
    }

    /// Every list call fails with a transport error
    pub fn always_fail(self) -> Self {
        self.fail_lists(u32::MAX)
    }

    /// Every list call fails with a fatal error
    pub fn fatal(mut self) -> Self {
        self.fatal = true;
        self
    }

    /// Every watch call fails with a transport error
    pub fn fail_watches(mut self) -> Self {
        self.watch_mode = WatchMode::Fail;
        self
    }

    /// Every watch ends right away without producing anything
    pub fn close_watches(mut self) -> Self {
        self.watch_mode = WatchMode::Close;
        self
    }

    pub fn list_calls(&self) -> u32 {
        self.list_calls.load(Ordering::SeqCst)
    }

    /// Resource version passed to each watch call, in order
    pub fn watch_versions(&self) -> Vec<String> {
        self.watch_versions.lock().unwrap().clone()
    }

    pub fn watch_calls(&self) -> usize {
        self.watch_versions.lock().unwrap().len()
    }
}

#[async_trait]
impl<K: Object> ResourceSource<K> for FakeSource<K> {
    async fn list(&self) -> Result<Listing<K>, SourceError> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        if self.fatal {
            return Err(SourceError::Fatal("forbidden".to_string()));
        }
        let failing = self
            .failing_lists
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| match n {
                0 => None,
                u32::MAX => Some(u32::MAX),
                n => Some(n - 1),
            })
            .is_ok();
        if failing {
            return Err(SourceError::Transport("connection refused".to_string()));
        }
        Ok(Listing {
            items: self.items.clone(),
            resource_version: self.resource_version.clone(),
        })
    }

    async fn watch<'a>(&'a self, resource_version: &'a str) -> Result<NotificationStream<'a, K>, SourceError> {
        self.watch_versions.lock().unwrap().push(resource_version.to_string());
        match self.watch_mode {
            WatchMode::Fail => return Err(SourceError::Transport("watch refused".to_string())),
            WatchMode::Close => return Ok(stream::empty().boxed()),
            WatchMode::Channel => {}
        }
        let receiver = self.notifications.lock().unwrap().take();
        Ok(match receiver {
            Some(rx) => stream::unfold(rx, |mut rx| async move { rx.recv().await.map(|item| (item, rx)) }).boxed(),
            None => stream::pending().boxed(),
        })
    }
}

/// One observed reconcile call
#[derive(Debug, Clone)]
pub struct Call<K> {
    pub kind: EventKind,
    pub key: ResourceKey,
    pub object: K,
    pub at: Instant,
}

/// Reconciler that records calls and fails or panics on demand
#[derive(Debug)]
pub struct RecordingReconciler<K> {
    calls: Mutex<Vec<Call<K>>>,
    failures: Mutex<HashMap<ResourceKey, u32>>,
    panics: Mutex<HashSet<ResourceKey>>,
}

impl<K> Default for RecordingReconciler<K> {
    fn default() -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            failures: Mutex::new(HashMap::new()),
            panics: Mutex::new(HashSet::new()),
        }
    }
}

impl<K: Clone> RecordingReconciler<K> {
    /// Fails the next `n` calls for `key`
    pub fn fail_times(&self, key: &str, n: u32) {
        self.failures.lock().unwrap().insert(ResourceKey::from(key), n);
    }

    /// Panics on the next call for `key`
    pub fn panic_once(&self, key: &str) {
        self.panics.lock().unwrap().insert(ResourceKey::from(key));
    }

    pub fn calls(&self) -> Vec<Call<K>> {
        self.calls.lock().unwrap().clone()
    }

    pub fn calls_for(&self, key: &str) -> Vec<Call<K>> {
        self.calls().into_iter().filter(|call| call.key.as_str() == key).collect()
    }

    /// Polls until at least `n` calls were recorded
    pub async fn wait_for_calls(&self, n: usize) -> Vec<Call<K>> {
        loop {
            let calls = self.calls();
            if calls.len() >= n {
                return calls;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    }
}

#[async_trait]
impl<K: Object> Reconciler<K> for RecordingReconciler<K> {
    async fn reconcile(&self, kind: EventKind, key: &ResourceKey, object: &K) -> Result<(), ReconcileError> {
        self.calls.lock().unwrap().push(Call {
            kind,
            key: key.clone(),
            object: object.clone(),
            at: Instant::now(),
        });

        let panic_now = self.panics.lock().unwrap().remove(key);
        if panic_now {
            panic!("reconciler blew up on {key}");
        }

        let fail_now = match self.failures.lock().unwrap().get_mut(key) {
            Some(remaining) if *remaining > 0 => {
                *remaining -= 1;
                true
            }
            _ => false,
        };
        if fail_now {
            return Err(ReconcileError::failed(format!("injected failure for {key}")));
        }
        Ok(())
    }
}

/// Shared buffer receiving formatted log output
#[derive(Debug, Clone, Default)]
pub struct CapturedLogs(Arc<Mutex<Vec<u8>>>);

impl CapturedLogs {
    /// Dispatch writing plain-text logs at every level into this buffer
    pub fn dispatch(&self) -> Dispatch {
        let writer = self.clone();
        Dispatch::new(
            tracing_subscriber::fmt()
                .with_ansi(false)
                .with_max_level(tracing::Level::TRACE)
                .with_writer(move || writer.clone())
                .finish(),
        )
    }

    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
    }
}

impl io::Write for CapturedLogs {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

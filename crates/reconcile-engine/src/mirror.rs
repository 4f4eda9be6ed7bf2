//! Local mirror of the remote collection.
//!
//! Populated by an initial listing and kept current by a watch stream. The
//! sync loop is the only writer; workers read point-in-time `Arc` snapshots.
//!
//! Every applied change is handed to the [`ChangeDetector`] right after the
//! map is updated, so per-key order from the source is preserved end to end.

use crate::Object;
use crate::backoff::ExponentialBackoff;
use crate::controller::ControllerConfig;
use crate::detector::ChangeDetector;
use crate::error::{ControllerError, SourceError};
use crate::event::{EventKind, Notification};
use crate::key::ResourceKey;
use crate::source::{Listing, ResourceSource};
use futures::StreamExt;
use kube::ResourceExt;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug)]
struct Tombstone<K> {
    object: Arc<K>,
    deleted_at: Instant,
}

#[derive(Debug)]
struct MirrorState<K> {
    items: HashMap<ResourceKey, Arc<K>>,
    /// Recently deleted objects, kept until `tombstone_ttl` elapses.
    tombstones: HashMap<ResourceKey, Tombstone<K>>,
    resource_version: String,
}

impl<K> MirrorState<K> {
    fn prune_tombstones(&mut self, ttl: Duration) {
        self.tombstones.retain(|_, tombstone| tombstone.deleted_at.elapsed() < ttl);
    }

    fn bury(&mut self, key: ResourceKey, object: Arc<K>) {
        self.tombstones.insert(
            key,
            Tombstone {
                object,
                deleted_at: Instant::now(),
            },
        );
    }
}

/// How a single watch ended.
///
/// `delivered` is set when the stream produced at least one notification.
enum WatchOutcome {
    Stopped,
    /// Server closed the stream; resume from the last version.
    Closed { delivered: bool },
    /// Our resource version is too old; relist.
    Expired { delivered: bool },
}

/// Timers polled alongside the watch stream.
struct WatchTimers {
    resync: Option<Interval>,
    sweep: Interval,
}

fn delayed_interval(period: Duration) -> Interval {
    let mut interval = tokio::time::interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}

/// Eventually consistent local cache keyed by [`ResourceKey`].
#[derive(Debug)]
pub struct Mirror<K> {
    state: RwLock<MirrorState<K>>,
    synced: watch::Sender<bool>,
    tombstone_ttl: Duration,
    list_backoff_initial: Duration,
    list_backoff_max: Duration,
    list_failure_budget: Option<u32>,
    resync_period: Option<Duration>,
}

impl<K: Object> Mirror<K> {
    /// Creates an empty, unsynced mirror.
    pub fn new(config: &ControllerConfig) -> Self {
        let (synced, _) = watch::channel(false);
        Self {
            state: RwLock::new(MirrorState {
                items: HashMap::new(),
                tombstones: HashMap::new(),
                resource_version: String::new(),
            }),
            synced,
            tombstone_ttl: config.tombstone_ttl,
            list_backoff_initial: config.list_backoff_initial,
            list_backoff_max: config.list_backoff_max,
            list_failure_budget: config.list_failure_budget,
            resync_period: config.resync_period,
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, MirrorState<K>> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, MirrorState<K>> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Current state of `key`, if it is live.
    pub fn get_by_key(&self, key: &ResourceKey) -> Option<Arc<K>> {
        self.read().items.get(key).cloned()
    }

    /// Current state of `key`, or its final state if it was deleted less
    /// than `tombstone_ttl` ago.
    pub fn last_known(&self, key: &ResourceKey) -> Option<Arc<K>> {
        let state = self.read();
        state
            .items
            .get(key)
            .or_else(|| {
                state
                    .tombstones
                    .get(key)
                    .filter(|tombstone| tombstone.deleted_at.elapsed() < self.tombstone_ttl)
                    .map(|tombstone| &tombstone.object)
            })
            .cloned()
    }

    /// Drops tombstones older than `tombstone_ttl`.
    pub fn prune_tombstones(&self) {
        self.write().prune_tombstones(self.tombstone_ttl);
    }

    #[cfg(test)]
    pub(crate) fn tombstone_count(&self) -> usize {
        self.read().tombstones.len()
    }

    /// Keys of every live object.
    pub fn keys(&self) -> Vec<ResourceKey> {
        self.read().items.keys().cloned().collect()
    }

    /// Number of live objects.
    pub fn len(&self) -> usize {
        self.read().items.len()
    }

    /// Whether the mirror holds no live objects.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Last resource version applied.
    pub fn resource_version(&self) -> String {
        self.read().resource_version.clone()
    }

    /// Whether the initial listing has been fully applied.
    pub fn has_synced(&self) -> bool {
        *self.synced.borrow()
    }

    /// Subscribes to the synced flag.
    pub fn subscribe_synced(&self) -> watch::Receiver<bool> {
        self.synced.subscribe()
    }

    /// Waits until the initial listing has been applied.
    pub async fn wait_for_sync(&self) {
        let mut synced = self.synced.subscribe();
        // The sender lives in `self`, so the channel cannot close while we wait.
        let _ = synced.wait_for(|synced| *synced).await;
    }

    /// Replaces the whole content with `listing`.
    ///
    /// New keys produce `Added`, keys already present produce `Updated`, and
    /// keys missing from the listing produce `Deleted` with their last state.
    /// Marks the mirror synced once every change has been delivered.
    pub fn replace(&self, listing: Listing<K>, detector: &ChangeDetector<K>) {
        let changes = {
            let mut state = self.write();
            let mut previous = std::mem::take(&mut state.items);
            let mut changes = Vec::with_capacity(listing.items.len());

            for item in listing.items {
                let key = match ResourceKey::for_object(&item) {
                    Ok(key) => key,
                    Err(e) => {
                        warn!("Skipping listed object: {}", e);
                        continue;
                    }
                };
                let object = Arc::new(item);
                let kind = if previous.remove(&key).is_some() {
                    EventKind::Updated
                } else {
                    EventKind::Added
                };
                state.tombstones.remove(&key);
                state.items.insert(key, Arc::clone(&object));
                changes.push((kind, object));
            }

            let mut vanished: Vec<_> = previous.into_iter().collect();
            vanished.sort_by(|(a, _), (b, _)| a.cmp(b));
            for (key, object) in vanished {
                state.bury(key, Arc::clone(&object));
                changes.push((EventKind::Deleted, object));
            }

            state.resource_version = listing.resource_version;
            state.prune_tombstones(self.tombstone_ttl);
            changes
        };

        for (kind, object) in changes {
            detector.observe(kind, object);
        }
        self.synced.send_replace(true);
    }

    /// Applies one watch notification and emits its event.
    pub fn apply(&self, notification: Notification<K>, detector: &ChangeDetector<K>) {
        let (kind, object) = {
            let mut state = self.write();
            state.prune_tombstones(self.tombstone_ttl);

            let (kind, object) = match notification {
                Notification::Bookmark(version) => {
                    state.resource_version = version;
                    return;
                }
                Notification::Added(obj) | Notification::Modified(obj) => {
                    let object = Arc::new(obj);
                    let key = match ResourceKey::for_object(object.as_ref()) {
                        Ok(key) => key,
                        Err(e) => {
                            warn!("Skipping watched object: {}", e);
                            return;
                        }
                    };
                    state.tombstones.remove(&key);
                    let kind = match state.items.insert(key, Arc::clone(&object)) {
                        Some(_) => EventKind::Updated,
                        None => EventKind::Added,
                    };
                    (kind, object)
                }
                Notification::Deleted(obj) => {
                    let object = Arc::new(obj);
                    if let Ok(key) = ResourceKey::for_object(object.as_ref()) {
                        if state.items.remove(&key).is_none() {
                            debug!("Delete for {} which is not in the mirror", key);
                        }
                        state.bury(key, Arc::clone(&object));
                    }
                    (EventKind::Deleted, object)
                }
            };

            if let Some(version) = object.resource_version() {
                state.resource_version = version;
            }
            (kind, object)
        };

        detector.observe(kind, object);
    }

    /// Re-emits `Updated` for every live object.
    pub fn resync(&self, detector: &ChangeDetector<K>) {
        let mut objects: Vec<_> = self.read().items.iter().map(|(k, v)| (k.clone(), Arc::clone(v))).collect();
        objects.sort_by(|(a, _), (b, _)| a.cmp(b));
        debug!("Resyncing {} objects", objects.len());
        for (_, object) in objects {
            detector.observe(EventKind::Updated, object);
        }
    }

    /// Runs the list-and-watch loop until `stop` is cancelled.
    ///
    /// Transport errors are retried with exponential backoff. Before the
    /// first successful sync, a configured failure budget turns repeated
    /// list failures into [`ControllerError::SyncBudgetExhausted`]; after it,
    /// retries are unbounded.
    ///
    /// Watch failures, and watches that end without producing anything, back
    /// off on their own schedule. It only resets once a watch delivers a
    /// notification, so a successful relist does not shorten it.
    pub async fn run(
        &self,
        source: &dyn ResourceSource<K>,
        detector: &ChangeDetector<K>,
        stop: &CancellationToken,
    ) -> Result<(), ControllerError> {
        info!("Starting {} mirror sync loop", K::kind(&()));

        let mut list_backoff = ExponentialBackoff::new(self.list_backoff_initial, self.list_backoff_max);
        let mut watch_backoff = ExponentialBackoff::new(self.list_backoff_initial, self.list_backoff_max);
        let mut timers = WatchTimers {
            resync: self.resync_period.map(delayed_interval),
            sweep: delayed_interval(self.tombstone_ttl.max(Duration::from_secs(1))),
        };

        loop {
            let Some(listing) = self.list_with_retry(source, &mut list_backoff, stop).await? else {
                return Ok(());
            };
            let count = listing.items.len();
            self.replace(listing, detector);
            info!("{} mirror synced: {} objects at version {:?}", K::kind(&()), count, self.resource_version());

            loop {
                let version = self.resource_version();
                let outcome = self
                    .watch_once(source, &version, detector, stop, &mut timers, &mut watch_backoff)
                    .await;
                let relist = match outcome {
                    Ok(WatchOutcome::Stopped) => return Ok(()),
                    Ok(WatchOutcome::Closed { delivered: true }) => {
                        debug!("Watch closed at version {:?}, resuming", version);
                        continue;
                    }
                    Ok(WatchOutcome::Expired { delivered: true }) => {
                        info!("Resource version {:?} expired, relisting", version);
                        break;
                    }
                    Ok(WatchOutcome::Closed { delivered: false }) => false,
                    Ok(WatchOutcome::Expired { delivered: false }) => true,
                    Err(SourceError::Fatal(msg)) => return Err(SourceError::Fatal(msg).into()),
                    Err(e) => {
                        warn!(error = %e, "Watch failed at version {:?}", version);
                        true
                    }
                };

                let delay = watch_backoff.next_backoff();
                debug!(
                    delay_ms = delay.as_millis(),
                    relist,
                    "Watch at version {:?} made no progress, backing off",
                    version
                );
                tokio::select! {
                    () = stop.cancelled() => return Ok(()),
                    () = tokio::time::sleep(delay) => {}
                }
                if relist {
                    break;
                }
            }
        }
    }

    async fn list_with_retry(
        &self,
        source: &dyn ResourceSource<K>,
        backoff: &mut ExponentialBackoff,
        stop: &CancellationToken,
    ) -> Result<Option<Listing<K>>, ControllerError> {
        let mut failures = 0u32;
        loop {
            let result = tokio::select! {
                () = stop.cancelled() => return Ok(None),
                result = source.list() => result,
            };
            let error = match result {
                Ok(listing) => {
                    backoff.reset();
                    return Ok(Some(listing));
                }
                Err(SourceError::Fatal(msg)) => return Err(SourceError::Fatal(msg).into()),
                Err(e) => e,
            };

            failures = failures.saturating_add(1);
            if let Some(budget) = self.list_failure_budget {
                if !self.has_synced() && failures >= budget {
                    return Err(ControllerError::SyncBudgetExhausted {
                        attempts: failures,
                        source: error,
                    });
                }
            }

            let delay = backoff.next_backoff();
            warn!(
                attempt = failures,
                error = %error,
                delay_ms = delay.as_millis(),
                "List failed, retrying"
            );
            tokio::select! {
                () = stop.cancelled() => return Ok(None),
                () = tokio::time::sleep(delay) => {}
            }
        }
    }

    async fn watch_once(
        &self,
        source: &dyn ResourceSource<K>,
        version: &str,
        detector: &ChangeDetector<K>,
        stop: &CancellationToken,
        timers: &mut WatchTimers,
        backoff: &mut ExponentialBackoff,
    ) -> Result<WatchOutcome, SourceError> {
        let mut stream = tokio::select! {
            () = stop.cancelled() => return Ok(WatchOutcome::Stopped),
            stream = source.watch(version) => match stream {
                Ok(stream) => stream,
                Err(SourceError::Gone(_)) => return Ok(WatchOutcome::Expired { delivered: false }),
                Err(e) => return Err(e),
            },
        };

        let mut delivered = false;
        loop {
            tokio::select! {
                () = stop.cancelled() => return Ok(WatchOutcome::Stopped),
                () = next_tick(&mut timers.resync) => self.resync(detector),
                _ = timers.sweep.tick() => self.prune_tombstones(),
                item = stream.next() => match item {
                    None => return Ok(WatchOutcome::Closed { delivered }),
                    Some(Ok(notification)) => {
                        if !delivered {
                            delivered = true;
                            backoff.reset();
                        }
                        self.apply(notification, detector);
                    }
                    Some(Err(SourceError::Gone(_))) => return Ok(WatchOutcome::Expired { delivered }),
                    Some(Err(e)) => return Err(e),
                },
            }
        }
    }
}

async fn next_tick(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

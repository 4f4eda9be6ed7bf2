//! Main controller implementation.
//!
//! This module contains the `Controller` supervisor that wires the mirror,
//! change detector, work queue and worker pool together and owns their
//! lifecycle:
//!
//! ```text
//! NotStarted -> Syncing -> Running -> ShuttingDown -> Stopped
//!                  \_________________________________/
//!                    (startup timeout / fatal source error)
//! ```
//!
//! Transitions only move forward; a stopped controller cannot be restarted.

use crate::Object;
use crate::backoff::ItemExponentialRateLimiter;
use crate::detector::{ChangeDetector, EventSink};
use crate::error::ControllerError;
use crate::event::{Event, EventLedger};
use crate::mirror::Mirror;
use crate::queue::WorkQueue;
use crate::reconciler::Reconciler;
use crate::source::ResourceSource;
use crate::worker::Worker;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::instrument::WithSubscriber;
use tracing::{Dispatch, Instrument, Span, debug, error, info, info_span, warn};

/// Lifecycle of a [`Controller`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LifecycleState {
    /// Constructed, `run` not called yet.
    NotStarted,
    /// Mirror sync loop started, waiting for the initial listing.
    Syncing,
    /// Workers are processing the queue.
    Running,
    /// Stop requested; draining workers.
    ShuttingDown,
    /// Terminal.
    Stopped,
}

/// Tunables for a [`Controller`].
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Upper bound on the initial sync. `None` waits until stopped.
    pub sync_timeout: Option<Duration>,
    /// First delay between failed list attempts.
    pub list_backoff_initial: Duration,
    /// Cap on the delay between failed list attempts.
    pub list_backoff_max: Duration,
    /// Consecutive list failures tolerated before the first sync. `None` retries forever.
    pub list_failure_budget: Option<u32>,
    /// Retry delay after a key's first failed reconcile.
    pub retry_base_delay: Duration,
    /// Cap on a key's retry delay.
    pub retry_max_delay: Duration,
    /// Period for re-emitting every live object as `Updated`. `None` disables resync.
    pub resync_period: Option<Duration>,
    /// How long deleted objects stay resolvable through [`Mirror::last_known`].
    pub tombstone_ttl: Duration,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            sync_timeout: None,
            list_backoff_initial: Duration::from_millis(800),
            list_backoff_max: Duration::from_secs(30),
            list_failure_budget: None,
            retry_base_delay: Duration::from_millis(5),
            retry_max_delay: Duration::from_secs(1000),
            resync_period: None,
            tombstone_ttl: Duration::from_secs(30),
        }
    }
}

/// Event sink feeding the work queue.
///
/// Records the event in the ledger first so the worker that dequeues the key
/// always finds it.
pub(crate) struct QueueSink<K> {
    queue: Arc<WorkQueue>,
    ledger: Arc<EventLedger<K>>,
}

impl<K> QueueSink<K> {
    pub(crate) fn new(queue: Arc<WorkQueue>, ledger: Arc<EventLedger<K>>) -> Self {
        Self { queue, ledger }
    }
}

impl<K: Object> EventSink<K> for QueueSink<K> {
    fn deliver(&self, event: Event<K>) {
        let key = event.key.clone();
        debug!("Queueing [{}] {}", event.kind, key);
        self.ledger.record(event);
        self.queue.add(key);
    }
}

enum Startup {
    Synced,
    Stopped,
    TimedOut(Duration),
    SyncExited(Result<(), ControllerError>),
}

/// Supervisor for one resource type.
pub struct Controller<K: Object> {
    source: Arc<dyn ResourceSource<K>>,
    reconciler: Arc<dyn Reconciler<K>>,
    config: ControllerConfig,
    mirror: Arc<Mirror<K>>,
    queue: Arc<WorkQueue>,
    ledger: Arc<EventLedger<K>>,
    state: watch::Sender<LifecycleState>,
    dispatch: Option<Dispatch>,
}

impl<K: Object> fmt::Debug for Controller<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Controller")
            .field("config", &self.config)
            .field("state", &*self.state.borrow())
            .field("queued", &self.queue.len())
            .finish_non_exhaustive()
    }
}

impl<K: Object> Controller<K> {
    /// Creates a controller reading from `source` and driving `reconciler`.
    pub fn new(
        source: Arc<dyn ResourceSource<K>>,
        reconciler: Arc<dyn Reconciler<K>>,
        config: ControllerConfig,
    ) -> Self {
        let rate_limiter = ItemExponentialRateLimiter::new(config.retry_base_delay, config.retry_max_delay);
        let (state, _) = watch::channel(LifecycleState::NotStarted);
        Self {
            source,
            reconciler,
            mirror: Arc::new(Mirror::new(&config)),
            queue: Arc::new(WorkQueue::new(Box::new(rate_limiter))),
            ledger: Arc::new(EventLedger::new()),
            config,
            state,
            dispatch: None,
        }
    }

    /// Routes every log line of this controller, including its background
    /// tasks, to `dispatch` instead of the default subscriber.
    #[must_use]
    pub fn with_dispatch(mut self, dispatch: Dispatch) -> Self {
        self.dispatch = Some(dispatch);
        self
    }

    /// Subscribes to lifecycle transitions.
    pub fn state(&self) -> watch::Receiver<LifecycleState> {
        self.state.subscribe()
    }

    /// The controller's local mirror.
    pub fn mirror(&self) -> Arc<Mirror<K>> {
        Arc::clone(&self.mirror)
    }

    /// The controller's work queue.
    pub fn queue(&self) -> Arc<WorkQueue> {
        Arc::clone(&self.queue)
    }

    fn transition(&self, next: LifecycleState) {
        self.state.send_if_modified(|current| {
            if next > *current {
                debug!("Controller {:?} -> {:?}", *current, next);
                *current = next;
                true
            } else {
                false
            }
        });
    }

    /// Runs until `stop` is cancelled and every component has drained.
    ///
    /// Starts the mirror sync loop, waits for the initial listing, then
    /// starts `workers` workers. A request for zero workers is logged as a
    /// warning and runs one. Returns an error only when startup fails or the
    /// source reports a fatal error.
    pub async fn run(self, workers: usize, stop: CancellationToken) -> Result<(), ControllerError> {
        let dispatch = self
            .dispatch
            .clone()
            .unwrap_or_else(|| tracing::dispatcher::get_default(Dispatch::clone));
        let span = info_span!("controller", resource = %K::kind(&()));
        self.run_supervised(workers, stop, dispatch.clone())
            .instrument(span)
            .with_subscriber(dispatch)
            .await
    }

    async fn run_supervised(
        self,
        workers: usize,
        stop: CancellationToken,
        dispatch: Dispatch,
    ) -> Result<(), ControllerError> {
        info!("Starting {} controller", K::kind(&()));
        let workers = if workers == 0 {
            warn!("Requested 0 workers, starting 1");
            1
        } else {
            workers
        };
        self.transition(LifecycleState::Syncing);

        let sync_stop = stop.child_token();
        let mut sync_task = self.spawn_sync_loop(sync_stop.clone(), &dispatch);

        let startup = tokio::select! {
            () = stop.cancelled() => Startup::Stopped,
            joined = &mut sync_task => Startup::SyncExited(flatten(joined)),
            startup = self.wait_for_startup() => startup,
        };

        match startup {
            Startup::Synced => {}
            Startup::Stopped => {
                info!("Stop requested before the initial sync completed");
                self.transition(LifecycleState::ShuttingDown);
                self.stop_components(&sync_stop, Some(sync_task), JoinSet::new()).await;
                self.transition(LifecycleState::Stopped);
                return Ok(());
            }
            Startup::SyncExited(Ok(())) => {
                self.stop_components(&sync_stop, None, JoinSet::new()).await;
                self.transition(LifecycleState::Stopped);
                return Ok(());
            }
            Startup::SyncExited(Err(e)) => {
                error!("Sync loop failed before the initial sync: {}", e);
                self.stop_components(&sync_stop, None, JoinSet::new()).await;
                self.transition(LifecycleState::Stopped);
                return Err(e);
            }
            Startup::TimedOut(limit) => {
                error!("Timed out after {:?} waiting for caches to sync", limit);
                self.stop_components(&sync_stop, Some(sync_task), JoinSet::new()).await;
                self.transition(LifecycleState::Stopped);
                return Err(ControllerError::StartupTimeout(limit));
            }
        }

        self.transition(LifecycleState::Running);
        let mut pool = JoinSet::new();
        for id in 0..workers {
            let worker = Worker {
                id,
                queue: Arc::clone(&self.queue),
                mirror: Arc::clone(&self.mirror),
                ledger: Arc::clone(&self.ledger),
                reconciler: Arc::clone(&self.reconciler),
            };
            pool.spawn(worker.run().instrument(Span::current()).with_subscriber(dispatch.clone()));
        }
        info!("Controller running with {} workers", workers);

        let (result, sync_task) = tokio::select! {
            () = stop.cancelled() => {
                info!("Stop signal received, shutting down");
                (Ok(()), Some(sync_task))
            }
            joined = &mut sync_task => match flatten(joined) {
                Ok(()) => (Ok(()), None),
                Err(e) => {
                    error!("Sync loop failed, shutting down: {}", e);
                    (Err(e), None)
                }
            },
        };

        self.transition(LifecycleState::ShuttingDown);
        self.stop_components(&sync_stop, sync_task, pool).await;
        self.transition(LifecycleState::Stopped);
        info!("Controller stopped");
        result
    }

    fn spawn_sync_loop(
        &self,
        sync_stop: CancellationToken,
        dispatch: &Dispatch,
    ) -> JoinHandle<Result<(), ControllerError>> {
        let mirror = Arc::clone(&self.mirror);
        let source = Arc::clone(&self.source);
        let detector = ChangeDetector::new(Arc::new(QueueSink::new(
            Arc::clone(&self.queue),
            Arc::clone(&self.ledger),
        )));
        tokio::spawn(
            async move { mirror.run(source.as_ref(), &detector, &sync_stop).await }
                .instrument(Span::current())
                .with_subscriber(dispatch.clone()),
        )
    }

    async fn wait_for_startup(&self) -> Startup {
        match self.config.sync_timeout {
            Some(limit) => match tokio::time::timeout(limit, self.mirror.wait_for_sync()).await {
                Ok(()) => Startup::Synced,
                Err(_elapsed) => Startup::TimedOut(limit),
            },
            None => {
                self.mirror.wait_for_sync().await;
                Startup::Synced
            }
        }
    }

    /// Shuts the queue, stops the sync loop, and waits for workers to drain.
    async fn stop_components(
        &self,
        sync_stop: &CancellationToken,
        sync_task: Option<JoinHandle<Result<(), ControllerError>>>,
        mut pool: JoinSet<()>,
    ) {
        self.queue.shutdown();
        sync_stop.cancel();

        if let Some(task) = sync_task {
            if let Err(e) = flatten(task.await) {
                warn!("Sync loop ended with error during shutdown: {}", e);
            }
        }
        while let Some(joined) = pool.join_next().await {
            if let Err(e) = joined {
                error!("Worker task failed: {}", e);
            }
        }
    }
}

fn flatten(joined: Result<Result<(), ControllerError>, JoinError>) -> Result<(), ControllerError> {
    joined.map_err(|e| ControllerError::SyncTask(e.to_string()))?
}

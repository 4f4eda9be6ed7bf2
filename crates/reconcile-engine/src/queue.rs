//! Deduplicating, rate-limited work queue.
//!
//! Holds at most one entry per [`ResourceKey`] across the pending and
//! in-flight sets. A key added while a worker is processing it is marked
//! dirty and redelivered exactly once after [`WorkQueue::done`].
//!
//! Bookkeeping per key:
//! - `queue`: pending keys in FIFO order
//! - `dirty`: keys that need processing (pending, or re-added while in-flight)
//! - `processing`: keys handed out by [`WorkQueue::get`] and not yet done
//! - `waiting`: keys scheduled by [`WorkQueue::add_after`], keyed by deadline

use crate::backoff::{ItemExponentialRateLimiter, RateLimiter};
use crate::key::ResourceKey;
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::debug;

#[derive(Debug, Default)]
struct QueueState {
    queue: VecDeque<ResourceKey>,
    dirty: HashSet<ResourceKey>,
    processing: HashSet<ResourceKey>,
    waiting: BinaryHeap<Reverse<(Instant, ResourceKey)>>,
    /// Earliest deadline per waiting key; heap entries that disagree are stale.
    waiting_deadlines: HashMap<ResourceKey, Instant>,
    shutting_down: bool,
}

impl QueueState {
    /// Returns true when the key became pending.
    fn insert(&mut self, key: ResourceKey) -> bool {
        if self.dirty.contains(&key) {
            return false;
        }
        self.dirty.insert(key.clone());
        if self.processing.contains(&key) {
            return false;
        }
        self.queue.push_back(key);
        true
    }

    fn schedule(&mut self, key: ResourceKey, deadline: Instant) {
        if let Some(existing) = self.waiting_deadlines.get(&key) {
            if *existing <= deadline {
                return;
            }
        }
        self.waiting_deadlines.insert(key.clone(), deadline);
        self.waiting.push(Reverse((deadline, key)));
    }

    /// Moves every waiting key whose deadline passed into the pending set.
    fn promote_ready(&mut self, now: Instant) {
        while let Some(Reverse((deadline, _))) = self.waiting.peek() {
            if *deadline > now {
                break;
            }
            let Some(Reverse((deadline, key))) = self.waiting.pop() else {
                break;
            };
            if self.waiting_deadlines.get(&key) == Some(&deadline) {
                self.waiting_deadlines.remove(&key);
                self.insert(key);
            }
        }
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.waiting.peek().map(|Reverse((deadline, _))| *deadline)
    }
}

/// Rate-limited work queue with set semantics.
///
/// Safe to share between any number of producers and workers.
#[derive(Debug)]
pub struct WorkQueue {
    state: Mutex<QueueState>,
    notify: Notify,
    rate_limiter: Box<dyn RateLimiter>,
}

impl Default for WorkQueue {
    fn default() -> Self {
        Self::new(Box::new(ItemExponentialRateLimiter::default()))
    }
}

impl WorkQueue {
    /// Creates an empty queue using `rate_limiter` for failed keys.
    pub fn new(rate_limiter: Box<dyn RateLimiter>) -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            notify: Notify::new(),
            rate_limiter,
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Marks `key` as needing processing.
    ///
    /// No-op if the key is already pending or the queue is shut down. If the
    /// key is in flight it is redelivered after [`WorkQueue::done`].
    pub fn add(&self, key: ResourceKey) {
        let pushed = {
            let mut state = self.lock();
            if state.shutting_down {
                return;
            }
            state.insert(key)
        };
        if pushed {
            self.notify.notify_one();
        }
    }

    /// Adds `key` once `delay` has elapsed.
    ///
    /// If the key is already waiting, the earlier deadline wins.
    pub fn add_after(&self, key: ResourceKey, delay: Duration) {
        if delay.is_zero() {
            self.add(key);
            return;
        }
        {
            let mut state = self.lock();
            if state.shutting_down {
                return;
            }
            state.schedule(key, Instant::now() + delay);
        }
        // Wake a blocked worker so it re-arms its timer for the new deadline.
        self.notify.notify_one();
    }

    /// Records a failure for `key` and re-adds it after its backoff delay.
    pub fn add_rate_limited(&self, key: ResourceKey) {
        let delay = self.rate_limiter.when(&key);
        debug!("Requeuing {} in {:?}", key, delay);
        self.add_after(key, delay);
    }

    /// Clears the retry backoff for `key`.
    pub fn forget(&self, key: &ResourceKey) {
        self.rate_limiter.forget(key);
    }

    /// Number of consecutive failures recorded for `key`.
    pub fn num_requeues(&self, key: &ResourceKey) -> u32 {
        self.rate_limiter.num_requeues(key)
    }

    /// Waits for the oldest pending key and marks it in flight.
    ///
    /// Returns `None` once the queue is shut down and no pending keys remain.
    pub async fn get(&self) -> Option<ResourceKey> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            // Register before inspecting state so a concurrent add cannot be missed.
            notified.as_mut().enable();

            let deadline = {
                let mut state = self.lock();
                state.promote_ready(Instant::now());
                if let Some(key) = state.queue.pop_front() {
                    state.dirty.remove(&key);
                    state.processing.insert(key.clone());
                    if !state.queue.is_empty() {
                        // Promoted keys may be left over for another worker.
                        self.notify.notify_one();
                    }
                    return Some(key);
                }
                if state.shutting_down {
                    return None;
                }
                state.next_deadline()
            };

            match deadline {
                Some(deadline) => {
                    tokio::select! {
                        () = &mut notified => {}
                        () = tokio::time::sleep_until(deadline) => {}
                    }
                }
                None => notified.await,
            }
        }
    }

    /// Marks `key` as no longer in flight, requeueing it if it went dirty.
    pub fn done(&self, key: &ResourceKey) {
        let requeued = {
            let mut state = self.lock();
            state.processing.remove(key);
            if state.dirty.contains(key) {
                state.queue.push_back(key.clone());
                true
            } else {
                false
            }
        };
        if requeued {
            self.notify.notify_one();
        }
    }

    /// Stops accepting new keys.
    ///
    /// [`WorkQueue::get`] keeps handing out already-pending keys and then
    /// returns `None`. Keys still waiting on a backoff delay are dropped.
    pub fn shutdown(&self) {
        {
            let mut state = self.lock();
            state.shutting_down = true;
            state.waiting.clear();
            state.waiting_deadlines.clear();
        }
        self.notify.notify_waiters();
    }

    /// Whether [`WorkQueue::shutdown`] was called.
    pub fn is_shutting_down(&self) -> bool {
        self.lock().shutting_down
    }

    /// Number of pending keys, excluding in-flight and delayed keys.
    pub fn len(&self) -> usize {
        self.lock().queue.len()
    }

    /// Whether no key is pending.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of keys currently handed out to workers.
    pub fn in_flight(&self) -> usize {
        self.lock().processing.len()
    }

    /// Number of keys waiting on a delay.
    pub fn delayed(&self) -> usize {
        self.lock().waiting_deadlines.len()
    }

    /// Occurrences of `key` across the pending queue and in-flight set.
    #[cfg(test)]
    pub(crate) fn occurrences(&self, key: &ResourceKey) -> usize {
        let state = self.lock();
        state.queue.iter().filter(|k| *k == key).count() + usize::from(state.processing.contains(key))
    }
}

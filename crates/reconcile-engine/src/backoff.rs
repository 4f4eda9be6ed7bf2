//! # Exponential Backoff
//!
//! Backoff used in three places:
//! - the mirror's list retry loop (stateful [`ExponentialBackoff`], reset on success)
//! - the mirror's watch restarts (a separate [`ExponentialBackoff`], reset once a watch delivers)
//! - the work queue's per-key retry delay ([`ItemExponentialRateLimiter`])
//!
//! Sequence for base `b` and cap `m`: b, 2b, 4b, 8b, ... capped at m.

use crate::key::ResourceKey;
use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

/// Exponential backoff calculator
///
/// Each delay doubles the previous one until `max` is reached.
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    /// First delay (for reset)
    initial: Duration,
    /// Delay returned by the next call
    current: Duration,
    /// Cap
    max: Duration,
}

impl ExponentialBackoff {
    /// Create a new backoff starting at `initial` and capped at `max`.
    #[must_use]
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            current: initial.min(max),
            max,
        }
    }

    /// Get the next delay and advance the sequence.
    pub fn next_backoff(&mut self) -> Duration {
        let result = self.current;
        self.current = self.current.saturating_mul(2).min(self.max);
        result
    }

    /// Reset the backoff to the initial state
    pub fn reset(&mut self) {
        self.current = self.initial.min(self.max);
    }

    /// Delay for the given zero-based attempt number (stateless).
    ///
    /// Returns `base * 2^attempt`, capped at `max`. Overflow saturates to `max`.
    #[must_use]
    pub fn for_attempt(attempt: u32, base: Duration, max: Duration) -> Duration {
        2u32.checked_pow(attempt)
            .and_then(|factor| base.checked_mul(factor))
            .map_or(max, |delay| delay.min(max))
    }
}

/// Decides how long a failing key waits before it is retried.
pub trait RateLimiter: Send + Sync + Debug {
    /// Records a failure for `key` and returns the delay before its next delivery.
    fn when(&self, key: &ResourceKey) -> Duration;

    /// Clears all retry bookkeeping for `key`.
    fn forget(&self, key: &ResourceKey);

    /// Number of failures recorded for `key` since it was last forgotten.
    fn num_requeues(&self, key: &ResourceKey) -> u32;
}

/// Per-key exponential rate limiter.
///
/// No attempt cap: a key keeps retrying at `max_delay` until it succeeds or
/// the queue shuts down.
#[derive(Debug)]
pub struct ItemExponentialRateLimiter {
    base_delay: Duration,
    max_delay: Duration,
    failures: Mutex<HashMap<ResourceKey, u32>>,
}

impl ItemExponentialRateLimiter {
    /// Create a limiter with the given base delay and cap.
    #[must_use]
    pub fn new(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            base_delay,
            max_delay,
            failures: Mutex::new(HashMap::new()),
        }
    }
}

impl Default for ItemExponentialRateLimiter {
    /// 5ms base, 1000s cap.
    fn default() -> Self {
        Self::new(Duration::from_millis(5), Duration::from_secs(1000))
    }
}

impl RateLimiter for ItemExponentialRateLimiter {
    fn when(&self, key: &ResourceKey) -> Duration {
        let mut failures = self.failures.lock().unwrap_or_else(PoisonError::into_inner);
        let count = failures.entry(key.clone()).or_insert(0);
        let attempt = *count;
        *count = count.saturating_add(1);
        ExponentialBackoff::for_attempt(attempt, self.base_delay, self.max_delay)
    }

    fn forget(&self, key: &ResourceKey) {
        self.failures
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key);
    }

    fn num_requeues(&self, key: &ResourceKey) -> u32 {
        self.failures
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .copied()
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exponential_backoff_sequence() {
        let mut backoff = ExponentialBackoff::new(Duration::from_millis(800), Duration::from_secs(30));

        assert_eq!(backoff.next_backoff(), Duration::from_millis(800));
        assert_eq!(backoff.next_backoff(), Duration::from_millis(1600));
        assert_eq!(backoff.next_backoff(), Duration::from_millis(3200));
        assert_eq!(backoff.next_backoff(), Duration::from_millis(6400));
        assert_eq!(backoff.next_backoff(), Duration::from_millis(12800));
        assert_eq!(backoff.next_backoff(), Duration::from_millis(25600));
        assert_eq!(backoff.next_backoff(), Duration::from_secs(30)); // max
        // Should stay at max
        assert_eq!(backoff.next_backoff(), Duration::from_secs(30));
    }

    #[test]
    fn test_exponential_backoff_reset() {
        let mut backoff = ExponentialBackoff::new(Duration::from_secs(1), Duration::from_secs(10));

        assert_eq!(backoff.next_backoff(), Duration::from_secs(1));
        assert_eq!(backoff.next_backoff(), Duration::from_secs(2));
        assert_eq!(backoff.next_backoff(), Duration::from_secs(4));

        backoff.reset();

        // Should restart from beginning after success
        assert_eq!(backoff.next_backoff(), Duration::from_secs(1));
        assert_eq!(backoff.next_backoff(), Duration::from_secs(2));
    }

    #[test]
    fn test_for_attempt_saturates_at_cap() {
        let base = Duration::from_millis(5);
        let max = Duration::from_secs(1000);

        assert_eq!(ExponentialBackoff::for_attempt(0, base, max), Duration::from_millis(5));
        assert_eq!(ExponentialBackoff::for_attempt(3, base, max), Duration::from_millis(40));
        assert_eq!(ExponentialBackoff::for_attempt(40, base, max), max);
        assert_eq!(ExponentialBackoff::for_attempt(u32::MAX, base, max), max);
    }

    #[test]
    fn test_rate_limiter_is_monotonic_and_capped() {
        let limiter = ItemExponentialRateLimiter::new(Duration::from_millis(5), Duration::from_secs(1));
        let key = ResourceKey::from("ns/bar");

        let mut previous = Duration::ZERO;
        for _ in 0..20 {
            let delay = limiter.when(&key);
            assert!(delay >= previous);
            assert!(delay <= Duration::from_secs(1));
            previous = delay;
        }
        assert_eq!(previous, Duration::from_secs(1));
        assert_eq!(limiter.num_requeues(&key), 20);
    }

    #[test]
    fn test_rate_limiter_tracks_keys_independently() {
        let limiter = ItemExponentialRateLimiter::default();
        let a = ResourceKey::from("ns/a");
        let b = ResourceKey::from("ns/b");

        limiter.when(&a);
        limiter.when(&a);
        assert_eq!(limiter.when(&b), Duration::from_millis(5));
        assert_eq!(limiter.num_requeues(&a), 2);

        limiter.forget(&a);
        assert_eq!(limiter.num_requeues(&a), 0);
        assert_eq!(limiter.when(&a), Duration::from_millis(5));
    }
}

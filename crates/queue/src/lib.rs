//! Ursa work queue: deduplicating key queue with in-flight accounting and
//! per-key exponential backoff for failed items.

#![forbid(unsafe_code)]

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use metrics::{counter, gauge};
use rustc_hash::{FxHashMap, FxHashSet};
use tokio::sync::Notify;
use tracing::{debug, trace};
use ursa_core::ResourceKey;

/// Per-item exponential backoff: `base * 2^retries`, capped at `max`.
#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    base: Duration,
    max: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Self { base: Duration::from_millis(5), max: Duration::from_secs(1000) }
    }
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self { base, max }
    }

    pub fn delay(&self, retries: u32) -> Duration {
        let factor = 1u64 << retries.min(63);
        let nanos = (self.base.as_nanos() as u64).saturating_mul(factor);
        self.max.min(Duration::from_nanos(nanos))
    }
}

#[derive(Default)]
struct Inner {
    pending: VecDeque<ResourceKey>,
    /// Keys queued or awaiting redelivery; membership here is the dedup.
    dirty: FxHashSet<ResourceKey>,
    /// Keys currently checked out to a worker.
    active: FxHashSet<ResourceKey>,
    failures: FxHashMap<ResourceKey, u32>,
    shutting_down: bool,
}

/// Deduplicating work queue with at-most-one-in-flight-per-key semantics.
///
/// A key re-added while checked out is remembered and handed out exactly
/// once more after its holder calls [`WorkQueue::done`], so a collapsed
/// duplicate is never silently lost. Once [`WorkQueue::shut_down`] has been
/// called, `add` stops accepting keys and blocked `get`s return `None`.
pub struct WorkQueue {
    inner: Mutex<Inner>,
    wakeup: Notify,
    backoff: Backoff,
}

impl WorkQueue {
    pub fn new() -> Arc<Self> {
        Self::with_backoff(Backoff::default())
    }

    pub fn with_backoff(backoff: Backoff) -> Arc<Self> {
        Arc::new(Self { inner: Mutex::new(Inner::default()), wakeup: Notify::new(), backoff })
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queue a key for delivery. No-op if the key is already pending; a key
    /// currently in flight is re-delivered once after `done`.
    pub fn add(&self, key: ResourceKey) {
        let mut q = self.lock();
        if q.shutting_down {
            return;
        }
        if !q.dirty.insert(key.clone()) {
            return;
        }
        counter!("queue_adds_total", 1u64);
        if q.active.contains(&key) {
            trace!(key = %key, "key in flight, marked for redelivery");
            return;
        }
        q.pending.push_back(key);
        gauge!("queue_depth", q.pending.len() as f64);
        drop(q);
        self.wakeup.notify_one();
    }

    /// Queue a key after its backoff delay. Every call records one more
    /// failure for the key until [`WorkQueue::forget`] clears the count.
    pub fn add_rate_limited(self: Arc<Self>, key: ResourceKey) {
        let delay = {
            let mut q = self.lock();
            if q.shutting_down {
                return;
            }
            let failures = q.failures.entry(key.clone()).or_insert(0);
            let delay = self.backoff.delay(*failures);
            *failures += 1;
            delay
        };
        counter!("queue_requeues_total", 1u64);
        debug!(key = %key, delay_ms = %delay.as_millis(), "redelivery scheduled");
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            self.add(key);
        });
    }

    /// Wait for the next key. Returns `None` once the queue is shut down.
    /// The key stays checked out to the caller until `done`; no other `get`
    /// will return it in between.
    pub async fn get(&self) -> Option<ResourceKey> {
        loop {
            // Register for wakeups before inspecting the queue, so a
            // notify between the check and the await cannot be missed.
            let mut wakeup = std::pin::pin!(self.wakeup.notified());
            wakeup.as_mut().enable();
            {
                let mut q = self.lock();
                if let Some(key) = q.pending.pop_front() {
                    q.dirty.remove(&key);
                    q.active.insert(key.clone());
                    gauge!("queue_depth", q.pending.len() as f64);
                    return Some(key);
                }
                if q.shutting_down {
                    return None;
                }
            }
            wakeup.await;
        }
    }

    /// Release a checked-out key. A key that went dirty while in flight is
    /// queued for one more delivery.
    pub fn done(&self, key: &ResourceKey) {
        let mut q = self.lock();
        q.active.remove(key);
        if q.dirty.contains(key) && !q.shutting_down {
            q.pending.push_back(key.clone());
            gauge!("queue_depth", q.pending.len() as f64);
            drop(q);
            self.wakeup.notify_one();
        }
    }

    /// Clear the key's failure history, ending its backoff progression.
    pub fn forget(&self, key: &ResourceKey) {
        self.lock().failures.remove(key);
    }

    /// Consecutive failures currently recorded for the key.
    pub fn retries(&self, key: &ResourceKey) -> u32 {
        self.lock().failures.get(key).copied().unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.lock().pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stop admitting work and wake every blocked `get`. Keys still pending
    /// are dropped; in-flight keys finish normally.
    pub fn shut_down(&self) {
        let mut q = self.lock();
        q.shutting_down = true;
        q.pending.clear();
        q.dirty.clear();
        drop(q);
        self.wakeup.notify_waiters();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.lock().shutting_down
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_is_monotone_and_capped() {
        let b = Backoff::new(Duration::from_millis(5), Duration::from_secs(1000));
        let mut prev = Duration::ZERO;
        for n in 0..80 {
            let d = b.delay(n);
            assert!(d >= prev, "delay must be non-decreasing at retry {n}");
            assert!(d <= Duration::from_secs(1000));
            prev = d;
        }
        assert_eq!(b.delay(0), Duration::from_millis(5));
        assert_eq!(b.delay(1), Duration::from_millis(10));
        assert_eq!(b.delay(2), Duration::from_millis(20));
        assert_eq!(b.delay(63), Duration::from_secs(1000));
    }
}

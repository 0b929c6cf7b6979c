//! Change classification: decide which cache mutations become queue work.

use std::sync::Arc;

use tracing::debug;
use ursa_core::{Entry, EventHandler};
use ursa_queue::WorkQueue;

/// Policy consulted on updates; adds and deletes always enqueue.
///
/// Suppression is an optimization only. The reconciler tolerates spurious
/// enqueues, so a permissive policy is always safe.
pub trait UpdatePolicy: Send + Sync {
    fn should_enqueue(&self, old: &Entry, new: &Entry) -> bool;
}

/// Default policy: skip updates whose version token is unchanged, or whose
/// designated status field (a JSON pointer) is unchanged.
pub struct VersionGate {
    pointer: Option<String>,
}

impl VersionGate {
    pub fn new(pointer: Option<&str>) -> Self {
        Self { pointer: pointer.map(|p| p.to_string()) }
    }
}

impl UpdatePolicy for VersionGate {
    fn should_enqueue(&self, old: &Entry, new: &Entry) -> bool {
        if old.resource_version == new.resource_version {
            return false;
        }
        match &self.pointer {
            Some(p) => old.raw.pointer(p) != new.raw.pointer(p),
            None => true,
        }
    }
}

/// Feeds the work queue from store mutation callbacks. Only keys cross
/// this boundary; workers re-read current state from the cache.
pub struct Classifier {
    queue: Arc<WorkQueue>,
    policy: Arc<dyn UpdatePolicy>,
}

impl Classifier {
    pub fn new(queue: Arc<WorkQueue>, policy: Arc<dyn UpdatePolicy>) -> Self {
        Self { queue, policy }
    }
}

impl EventHandler for Classifier {
    fn on_add(&self, new: &Arc<Entry>) {
        self.queue.add(new.key.clone());
    }

    fn on_update(&self, old: &Arc<Entry>, new: &Arc<Entry>) {
        if self.policy.should_enqueue(old, new) {
            self.queue.add(new.key.clone());
        } else {
            debug!(key = %new.key, "update suppressed");
        }
    }

    fn on_delete(&self, old: &Arc<Entry>) {
        // The evicted entry still carries the key, so extraction works
        // after the object has left the cache.
        self.queue.add(old.key.clone());
    }
}

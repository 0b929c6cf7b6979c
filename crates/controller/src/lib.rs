//! Ursa controller: wires the store, classifier, work queue, and reconciler
//! into worker loops with a startup barrier and a drain-on-shutdown path.

#![forbid(unsafe_code)]

pub mod classify;
pub mod reconcile;

pub use classify::{Classifier, UpdatePolicy, VersionGate};
pub use reconcile::{Outcome, Reconcile, UserReconciler, MESSAGE_SYNCED, REASON_SYNCED};

use std::sync::Arc;
use std::time::Instant;

use anyhow::{anyhow, Result};
use metrics::{counter, histogram};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{error, info, warn};
use ursa_queue::WorkQueue;
use ursa_store::Handle;

/// Drives reconciliation: blocks workers behind the cache sync gate, runs
/// them against the shared queue, and drains in-flight work on shutdown.
pub struct Controller {
    store: Handle,
    queue: Arc<WorkQueue>,
    reconciler: Arc<dyn Reconcile>,
}

impl Controller {
    pub fn new(store: Handle, queue: Arc<WorkQueue>, reconciler: Arc<dyn Reconcile>) -> Self {
        Self { store, queue, reconciler }
    }

    /// Run until the shutdown signal fires. Errors only when the initial
    /// cache sync fails to complete before shutdown.
    pub async fn run(&self, workers: usize, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        info!("waiting for cache sync");
        if !self.store.wait_synced(&mut shutdown).await {
            return Err(anyhow!("failed to wait for cache sync"));
        }

        info!(workers, "cache synced, starting workers");
        let mut set = JoinSet::new();
        for id in 0..workers {
            let queue = Arc::clone(&self.queue);
            let reconciler = Arc::clone(&self.reconciler);
            set.spawn(async move { worker_loop(id, queue, reconciler).await });
        }

        loop {
            if *shutdown.borrow() {
                break;
            }
            if shutdown.changed().await.is_err() {
                break;
            }
        }

        info!("shutdown requested, draining workers");
        self.queue.shut_down();
        while set.join_next().await.is_some() {}
        info!("workers stopped");
        Ok(())
    }
}

/// One worker: block on the queue, invoke the reconciler, translate the
/// outcome into queue actions. Errors never escape the loop; a failing key
/// cannot take the worker down with it.
async fn worker_loop(id: usize, queue: Arc<WorkQueue>, reconciler: Arc<dyn Reconcile>) {
    while let Some(key) = queue.get().await {
        let t0 = Instant::now();
        let outcome = reconciler.reconcile(&key).await;
        histogram!("reconcile_ms", t0.elapsed().as_secs_f64() * 1000.0);
        match outcome {
            Outcome::Done => {
                counter!("reconcile_total", 1u64, "outcome" => "done");
                info!(worker = id, key = %key, "synced");
                queue.forget(&key);
                queue.done(&key);
            }
            Outcome::Retry(e) => {
                counter!("reconcile_total", 1u64, "outcome" => "retry");
                warn!(worker = id, key = %key, retries = queue.retries(&key), error = %e, "reconcile failed, requeueing");
                queue.done(&key);
                Arc::clone(&queue).add_rate_limited(key);
            }
            Outcome::Discard(e) => {
                counter!("reconcile_total", 1u64, "outcome" => "discard");
                error!(worker = id, key = %key, error = %e, "dropping unprocessable item");
                queue.forget(&key);
                queue.done(&key);
            }
        }
    }
}

//! The reconcile contract and the `User` reconciler.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;
use tracing::{debug, info};
use ursa_core::ResourceKey;
use ursa_kubehub::{EventSink, StatusWriter, WriteError};
use ursa_store::Handle;

pub const REASON_SYNCED: &str = "Synced";
pub const MESSAGE_SYNCED: &str = "User synced successfully";

const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Outcome of one reconcile invocation.
#[derive(Debug)]
pub enum Outcome {
    /// Converged, or nothing left to do.
    Done,
    /// Transient failure; redeliver with backoff.
    Retry(anyhow::Error),
    /// Unprocessable item; drop without retry.
    Discard(anyhow::Error),
}

/// The convergence function: re-read desired state from the cache, compare
/// with the outside world, and act. Implementations must be idempotent —
/// the queue may deliver a key any number of times.
#[async_trait]
pub trait Reconcile: Send + Sync {
    async fn reconcile(&self, key: &ResourceKey) -> Outcome;
}

/// Reconciler for `User` resources: marks the user logged in and persists
/// the status through the write API.
pub struct UserReconciler {
    store: Handle,
    writer: Arc<dyn StatusWriter>,
    sink: Arc<dyn EventSink>,
}

impl UserReconciler {
    pub fn new(store: Handle, writer: Arc<dyn StatusWriter>, sink: Arc<dyn EventSink>) -> Self {
        Self { store, writer, sink }
    }

    fn converged(raw: &serde_json::Value) -> bool {
        raw.pointer("/status/isLogin").and_then(|v| v.as_str()) == Some("true")
    }

    fn stamp_status(raw: &mut serde_json::Value) {
        let Some(obj) = raw.as_object_mut() else { return };
        let status = obj.entry("status").or_insert_with(|| json!({}));
        if !status.is_object() {
            *status = json!({});
        }
        if let Some(status) = status.as_object_mut() {
            status.insert("isLogin".to_string(), json!("true"));
            status.insert(
                "lastLogTime".to_string(),
                json!(chrono::Utc::now().format(TIME_FORMAT).to_string()),
            );
        }
    }
}

#[async_trait]
impl Reconcile for UserReconciler {
    async fn reconcile(&self, key: &ResourceKey) -> Outcome {
        if let Err(e) = key.split() {
            return Outcome::Discard(e.into());
        }

        let entry = match self.store.get(key) {
            Some(entry) => entry,
            None => {
                // Deleted between enqueue and processing: nothing to
                // persist, deletion cleanup only.
                info!(key = %key, "object gone, running deletion cleanup");
                return Outcome::Done;
            }
        };

        if Self::converged(&entry.raw) {
            debug!(key = %key, "already converged");
            return Outcome::Done;
        }

        let mut desired = entry.raw.clone();
        Self::stamp_status(&mut desired);

        match self.writer.update(&desired).await {
            Ok(_) => {
                self.sink.record(&entry.raw, REASON_SYNCED, MESSAGE_SYNCED);
                Outcome::Done
            }
            Err(WriteError::NotFound(name)) => {
                info!(key = %key, name = %name, "object deleted during update");
                Outcome::Done
            }
            Err(e @ WriteError::Transient(_)) => Outcome::Retry(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stamping_sets_login_fields() {
        let mut raw = serde_json::json!({"metadata": {"name": "alice"}});
        UserReconciler::stamp_status(&mut raw);
        assert_eq!(raw.pointer("/status/isLogin").and_then(|v| v.as_str()), Some("true"));
        assert!(raw.pointer("/status/lastLogTime").is_some());
        assert!(UserReconciler::converged(&raw));
    }

    #[test]
    fn stamping_replaces_non_object_status() {
        let mut raw = serde_json::json!({"metadata": {"name": "alice"}, "status": "bogus"});
        UserReconciler::stamp_status(&mut raw);
        assert!(UserReconciler::converged(&raw));
    }
}

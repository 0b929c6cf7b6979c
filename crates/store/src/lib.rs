//! Ursa store: the watch cache. A single ingest task applies feed events in
//! source order and publishes copy-on-write snapshots; readers never block
//! and never observe a half-applied entry.

#![forbid(unsafe_code)]

use std::sync::Arc;

use arc_swap::ArcSwap;
use metrics::{counter, gauge};
use rustc_hash::FxHashMap;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};
use ursa_core::{Entry, EventHandler, FeedEvent, ResourceKey};

/// Immutable view of the mirrored collection at one point in time.
#[derive(Debug, Default)]
pub struct Snapshot {
    epoch: u64,
    by_key: FxHashMap<ResourceKey, Arc<Entry>>,
}

impl Snapshot {
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn len(&self) -> usize {
        self.by_key.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_key.is_empty()
    }

    pub fn get(&self, key: &ResourceKey) -> Option<Arc<Entry>> {
        self.by_key.get(key).cloned()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<Entry>> {
        self.by_key.values()
    }
}

/// Read handle: lock-free `get`/`list` plus the initial-sync gate.
#[derive(Clone)]
pub struct Handle {
    snap: Arc<ArcSwap<Snapshot>>,
    synced_rx: watch::Receiver<bool>,
}

impl Handle {
    pub fn get(&self, key: &ResourceKey) -> Option<Arc<Entry>> {
        self.snap.load().get(key)
    }

    pub fn list(&self, namespace: Option<&str>) -> Vec<Arc<Entry>> {
        self.snap
            .load()
            .iter()
            .filter(|e| namespace.map_or(true, |ns| e.namespace() == Some(ns)))
            .cloned()
            .collect()
    }

    /// Pin the current snapshot; later mutations go to newer snapshots.
    pub fn current(&self) -> Arc<Snapshot> {
        self.snap.load_full()
    }

    /// Whether the initial listing has been applied.
    pub fn has_synced(&self) -> bool {
        *self.synced_rx.borrow()
    }

    /// Wait until the initial listing has been applied or the shutdown
    /// signal fires. Returns whether the cache is synced.
    pub async fn wait_synced(&self, shutdown: &mut watch::Receiver<bool>) -> bool {
        let mut synced = self.synced_rx.clone();
        loop {
            if *synced.borrow() {
                return true;
            }
            if *shutdown.borrow() {
                return false;
            }
            tokio::select! {
                changed = synced.changed() => {
                    if changed.is_err() {
                        return *synced.borrow();
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        return false;
                    }
                }
            }
        }
    }
}

/// Mutable mirror owned by the ingest task. `freeze` clones the key map
/// (entries are shared via `Arc`, so clones are shallow).
#[derive(Default)]
struct Builder {
    epoch: u64,
    by_key: FxHashMap<ResourceKey, Arc<Entry>>,
}

enum Applied {
    Added(Arc<Entry>),
    Updated(Arc<Entry>, Arc<Entry>),
    Removed(Arc<Entry>),
}

impl Builder {
    fn upsert(&mut self, raw: serde_json::Value) -> Result<Applied, ursa_core::KeyError> {
        let new = Arc::new(Entry::from_raw(raw)?);
        match self.by_key.insert(new.key.clone(), Arc::clone(&new)) {
            Some(old) => Ok(Applied::Updated(old, new)),
            None => Ok(Applied::Added(new)),
        }
    }

    fn remove(&mut self, raw: &serde_json::Value) -> Result<Applied, ursa_core::KeyError> {
        let key = ResourceKey::from_raw(raw)?;
        match self.by_key.remove(&key) {
            Some(old) => Ok(Applied::Removed(old)),
            // Never mirrored (or already evicted): synthesize the entry from
            // the deletion payload so consumers still learn the key.
            None => Ok(Applied::Removed(Arc::new(Entry::from_raw(raw.clone())?))),
        }
    }

    /// Replace the mirror with a full listing, reporting the differences
    /// against the previous contents.
    fn replace(&mut self, list: Vec<serde_json::Value>) -> Vec<Applied> {
        let mut next: FxHashMap<ResourceKey, Arc<Entry>> = FxHashMap::default();
        let mut out = Vec::new();
        for raw in list {
            match Entry::from_raw(raw) {
                Ok(e) => {
                    let e = Arc::new(e);
                    next.insert(e.key.clone(), e);
                }
                Err(e) => warn!(error = %e, "dropping unkeyable object in listing"),
            }
        }
        for (key, new) in next.iter() {
            match self.by_key.get(key) {
                Some(old) => out.push(Applied::Updated(Arc::clone(old), Arc::clone(new))),
                None => out.push(Applied::Added(Arc::clone(new))),
            }
        }
        for (key, old) in self.by_key.iter() {
            if !next.contains_key(key) {
                out.push(Applied::Removed(Arc::clone(old)));
            }
        }
        self.by_key = next;
        out
    }

    fn freeze(&mut self) -> Arc<Snapshot> {
        self.epoch = self.epoch.saturating_add(1);
        Arc::new(Snapshot { epoch: self.epoch, by_key: self.by_key.clone() })
    }
}

fn dispatch(handler: &Arc<dyn EventHandler>, applied: Applied) {
    match applied {
        Applied::Added(new) => {
            counter!("store_applied_total", 1u64);
            handler.on_add(&new);
        }
        Applied::Updated(old, new) => {
            counter!("store_applied_total", 1u64);
            handler.on_update(&old, &new);
        }
        Applied::Removed(old) => {
            counter!("store_deleted_total", 1u64);
            handler.on_delete(&old);
        }
    }
}

/// Spawn the ingest task. Feed events sent on the returned channel are
/// applied one at a time in source order; after every applied mutation a
/// fresh snapshot is published and then the handler is invoked, so a
/// consumer re-reading the cache already sees the change it was told about.
/// The first `Resynced` batch flips the sync gate.
pub fn spawn_ingest(cap: usize, handler: Arc<dyn EventHandler>) -> (mpsc::Sender<FeedEvent>, Handle) {
    let (tx, mut rx) = mpsc::channel::<FeedEvent>(cap);
    let snap = Arc::new(ArcSwap::from_pointee(Snapshot::default()));
    let (synced_tx, synced_rx) = watch::channel(false);
    let handle = Handle { snap: Arc::clone(&snap), synced_rx };

    tokio::spawn(async move {
        let mut builder = Builder::default();
        while let Some(ev) = rx.recv().await {
            match ev {
                FeedEvent::Applied(raw) => match builder.upsert(raw) {
                    Ok(applied) => {
                        snap.store(builder.freeze());
                        dispatch(&handler, applied);
                    }
                    Err(e) => warn!(error = %e, "dropping unkeyable object"),
                },
                FeedEvent::Deleted(raw) => match builder.remove(&raw) {
                    Ok(applied) => {
                        snap.store(builder.freeze());
                        dispatch(&handler, applied);
                    }
                    Err(e) => warn!(error = %e, "dropping unkeyable deletion"),
                },
                FeedEvent::Resynced(list) => {
                    let count = list.len();
                    let changes = builder.replace(list);
                    snap.store(builder.freeze());
                    for applied in changes {
                        dispatch(&handler, applied);
                    }
                    if !*synced_tx.borrow() {
                        let _ = synced_tx.send(true);
                    }
                    debug!(count, "listing applied");
                }
            }
            gauge!("store_objects", builder.by_key.len() as f64);
        }
        info!("ingest loop stopped");
    });

    (tx, handle)
}

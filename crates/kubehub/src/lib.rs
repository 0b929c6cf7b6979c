//! Ursa kubehub – kube client plumbing: the list+watch feed, the status
//! write API, and the event sink.

#![forbid(unsafe_code)]

use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use futures::TryStreamExt;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::{
    api::{Api, ListParams, PostParams},
    core::{ApiResource, DynamicObject, GroupVersionKind},
    discovery::{Discovery, Scope},
    runtime::{
        events::{Event as SinkEvent, EventType, Recorder, Reporter},
        watcher::{self, Event},
    },
    Client,
};
use metrics::counter;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use ursa_core::FeedEvent;

static CLIENT: tokio::sync::OnceCell<Client> = tokio::sync::OnceCell::const_new();

/// Shared client for the current kube context.
pub async fn get_kube_client() -> Result<Client> {
    let client = CLIENT
        .get_or_try_init(|| async {
            Client::try_default().await.context("building kube client")
        })
        .await?;
    Ok(client.clone())
}

fn parse_gvk_key(key: &str) -> Result<GroupVersionKind> {
    let parts: Vec<_> = key.split('/').collect();
    match parts.as_slice() {
        [version, kind] => Ok(GroupVersionKind {
            group: String::new(),
            version: (*version).to_string(),
            kind: (*kind).to_string(),
        }),
        [group, version, kind] => Ok(GroupVersionKind {
            group: (*group).to_string(),
            version: (*version).to_string(),
            kind: (*kind).to_string(),
        }),
        _ => Err(anyhow!("invalid gvk key: {} (expect v1/Kind or group/v1/Kind)", key)),
    }
}

async fn find_api_resource(client: Client, gvk: &GroupVersionKind) -> Result<(ApiResource, bool)> {
    let discovery = Discovery::new(client).run().await?;
    for group in discovery.groups() {
        for (ar, caps) in group.recommended_resources() {
            if ar.group == gvk.group && ar.version == gvk.version && ar.kind == gvk.kind {
                let namespaced = matches!(caps.scope, Scope::Namespaced);
                return Ok((ar.clone(), namespaced));
            }
        }
    }
    Err(anyhow!("GVK not found: {}/{}/{}", gvk.group, gvk.version, gvk.kind))
}

fn api_for(client: &Client, ar: &ApiResource, namespaced: bool, namespace: Option<&str>) -> Api<DynamicObject> {
    if namespaced {
        match namespace {
            Some(ns) => Api::namespaced_with(client.clone(), ns, ar),
            None => Api::all_with(client.clone(), ar),
        }
    } else {
        Api::all_with(client.clone(), ar)
    }
}

fn raw_from(obj: &DynamicObject) -> Result<serde_json::Value> {
    let mut raw = serde_json::to_value(obj).context("serializing DynamicObject")?;
    if let Some(meta) = raw.get_mut("metadata").and_then(|m| m.as_object_mut()) {
        meta.remove("managedFields");
    }
    Ok(raw)
}

async fn maybe_tick(interval: &mut Option<tokio::time::Interval>) {
    match interval {
        Some(i) => {
            i.tick().await;
        }
        None => futures::future::pending::<()>().await,
    }
}

/// Start the list+watch feed for a GVK key and pump events into `tx`.
///
/// The underlying watcher re-lists on startup and whenever its version
/// token expires; both surface as `Resynced`. `resync` adds a forced
/// periodic relist on top. Returns once the consumer side is dropped or
/// the stream fails terminally.
pub async fn start_watcher(
    gvk_key: &str,
    namespace: Option<&str>,
    resync: Option<Duration>,
    tx: mpsc::Sender<FeedEvent>,
) -> Result<()> {
    let client = get_kube_client().await?;
    let gvk = parse_gvk_key(gvk_key)?;
    let (ar, namespaced) = find_api_resource(client.clone(), &gvk).await?;
    let api = api_for(&client, &ar, namespaced, namespace);
    let list_api = api.clone();

    let stream = watcher::watcher(api, watcher::Config::default());
    futures::pin_mut!(stream);
    let mut relist = resync.map(|d| tokio::time::interval_at(tokio::time::Instant::now() + d, d));
    info!(gvk = %gvk_key, ns = ?namespace, resync_secs = ?resync.map(|d| d.as_secs()), "watcher started");

    loop {
        tokio::select! {
            ev = stream.try_next() => {
                match ev? {
                    Some(Event::Applied(o)) => {
                        counter!("watch_events_total", 1u64, "kind" => "applied");
                        if tx.send(FeedEvent::Applied(raw_from(&o)?)).await.is_err() {
                            break;
                        }
                    }
                    Some(Event::Deleted(o)) => {
                        counter!("watch_events_total", 1u64, "kind" => "deleted");
                        if tx.send(FeedEvent::Deleted(raw_from(&o)?)).await.is_err() {
                            break;
                        }
                    }
                    Some(Event::Restarted(list)) => {
                        debug!(count = list.len(), "watch restart");
                        counter!("watch_events_total", 1u64, "kind" => "restarted");
                        let items = list.iter().map(raw_from).collect::<Result<Vec<_>>>()?;
                        if tx.send(FeedEvent::Resynced(items)).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }
            _ = maybe_tick(&mut relist) => {
                match list_api.list(&ListParams::default()).await {
                    Ok(list) => {
                        debug!(count = list.items.len(), "forced relist");
                        let items = list.items.iter().map(raw_from).collect::<Result<Vec<_>>>()?;
                        if tx.send(FeedEvent::Resynced(items)).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => warn!(error = %e, "forced relist failed"),
                }
            }
        }
    }
    warn!(gvk = %gvk_key, "watcher stream ended");
    Ok(())
}

/// Errors from the external write API. `NotFound` is distinguishable so a
/// caller can treat a concurrent delete as benign.
#[derive(Debug, thiserror::Error)]
pub enum WriteError {
    #[error("not_found: {0}")]
    NotFound(String),
    #[error("transient: {0}")]
    Transient(String),
}

/// Persists converged objects back through the source of truth.
#[async_trait::async_trait]
pub trait StatusWriter: Send + Sync {
    async fn update(&self, raw: &serde_json::Value) -> Result<serde_json::Value, WriteError>;
}

/// Write API backed by the dynamic kube client.
pub struct KubeStatusWriter {
    client: Client,
    ar: ApiResource,
    namespaced: bool,
}

impl KubeStatusWriter {
    pub async fn for_gvk(gvk_key: &str) -> Result<Self> {
        let client = get_kube_client().await?;
        let gvk = parse_gvk_key(gvk_key)?;
        let (ar, namespaced) = find_api_resource(client.clone(), &gvk).await?;
        Ok(Self { client, ar, namespaced })
    }
}

#[async_trait::async_trait]
impl StatusWriter for KubeStatusWriter {
    async fn update(&self, raw: &serde_json::Value) -> Result<serde_json::Value, WriteError> {
        let obj: DynamicObject = serde_json::from_value(raw.clone())
            .map_err(|e| WriteError::Transient(format!("deserializing object: {e}")))?;
        let name = obj
            .metadata
            .name
            .clone()
            .ok_or_else(|| WriteError::Transient("object missing metadata.name".into()))?;
        let api = api_for(&self.client, &self.ar, self.namespaced, obj.metadata.namespace.as_deref());
        match api.replace(&name, &PostParams::default(), &obj).await {
            Ok(updated) => {
                serde_json::to_value(&updated).map_err(|e| WriteError::Transient(e.to_string()))
            }
            Err(kube::Error::Api(ae)) if ae.code == 404 => Err(WriteError::NotFound(name)),
            Err(e) => Err(WriteError::Transient(e.to_string())),
        }
    }
}

/// Fire-and-forget observability events. Failures are swallowed.
pub trait EventSink: Send + Sync {
    fn record(&self, raw: &serde_json::Value, reason: &str, note: &str);
}

/// Event sink publishing `v1.Event`s through the kube recorder.
pub struct KubeEventSink {
    client: Client,
    reporter: Reporter,
}

impl KubeEventSink {
    pub fn new(client: Client, component: &str) -> Self {
        Self { client, reporter: Reporter { controller: component.to_string(), instance: None } }
    }
}

fn object_reference(raw: &serde_json::Value) -> ObjectReference {
    let field = |p: &str| raw.pointer(p).and_then(|v| v.as_str()).map(|v| v.to_string());
    ObjectReference {
        api_version: field("/apiVersion"),
        kind: field("/kind"),
        name: field("/metadata/name"),
        namespace: field("/metadata/namespace"),
        uid: field("/metadata/uid"),
        resource_version: field("/metadata/resourceVersion"),
        ..Default::default()
    }
}

impl EventSink for KubeEventSink {
    fn record(&self, raw: &serde_json::Value, reason: &str, note: &str) {
        let recorder = Recorder::new(self.client.clone(), self.reporter.clone(), object_reference(raw));
        let reason = reason.to_string();
        let note = note.to_string();
        tokio::spawn(async move {
            let ev = SinkEvent {
                type_: EventType::Normal,
                reason: reason.clone(),
                note: Some(note),
                action: reason,
                secondary: None,
            };
            if let Err(e) = recorder.publish(ev).await {
                warn!(error = %e, "event publish failed");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gvk_key_parses_both_forms() {
        let gvk = parse_gvk_key("v1/ConfigMap").unwrap();
        assert_eq!((gvk.group.as_str(), gvk.version.as_str(), gvk.kind.as_str()), ("", "v1", "ConfigMap"));
        let gvk = parse_gvk_key("stable.example.com/v1/User").unwrap();
        assert_eq!(gvk.group, "stable.example.com");
        assert!(parse_gvk_key("User").is_err());
    }

    #[test]
    fn object_reference_carries_identity() {
        let raw = serde_json::json!({
            "apiVersion": "stable.example.com/v1",
            "kind": "User",
            "metadata": {"name": "alice", "namespace": "default", "uid": "u-1", "resourceVersion": "7"}
        });
        let r = object_reference(&raw);
        assert_eq!(r.name.as_deref(), Some("alice"));
        assert_eq!(r.namespace.as_deref(), Some("default"));
        assert_eq!(r.api_version.as_deref(), Some("stable.example.com/v1"));
        assert_eq!(r.uid.as_deref(), Some("u-1"));
    }
}

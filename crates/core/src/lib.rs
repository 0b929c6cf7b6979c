//! Ursa core types: resource identity, cache entries, and the watch feed contract.

#![forbid(unsafe_code)]

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// Identity of one resource instance: `namespace/name`, or bare `name` for
/// cluster-scoped objects. Two events for the same underlying object always
/// derive the same key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResourceKey(String);

impl ResourceKey {
    pub fn new(namespace: Option<&str>, name: &str) -> Self {
        match namespace {
            Some(ns) if !ns.is_empty() => Self(format!("{}/{}", ns, name)),
            _ => Self(name.to_string()),
        }
    }

    /// Derive the key from a raw object's metadata.
    pub fn from_raw(raw: &serde_json::Value) -> Result<Self, KeyError> {
        let name = raw
            .pointer("/metadata/name")
            .and_then(|v| v.as_str())
            .filter(|s| !s.is_empty())
            .ok_or(KeyError::MissingName)?;
        let namespace = raw.pointer("/metadata/namespace").and_then(|v| v.as_str());
        Ok(Self::new(namespace, name))
    }

    /// Split back into `(namespace, name)`. Anything that is not `name` or
    /// `namespace/name` is malformed.
    pub fn split(&self) -> Result<(Option<&str>, &str), KeyError> {
        let parts: Vec<&str> = self.0.split('/').collect();
        match parts.as_slice() {
            [name] if !name.is_empty() => Ok((None, name)),
            [ns, name] if !ns.is_empty() && !name.is_empty() => Ok((Some(ns), name)),
            _ => Err(KeyError::Invalid(self.0.clone())),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ResourceKey {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum KeyError {
    #[error("object missing metadata.name")]
    MissingName,
    #[error("invalid key: {0:?} (expect name or namespace/name)")]
    Invalid(String),
}

/// Latest known snapshot of one resource plus its change-version token.
/// Owned by the store; replaced wholesale on every observed change and
/// handed to readers behind `Arc`, never partially mutated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Entry {
    pub key: ResourceKey,
    /// Opaque, monotonically advancing marker from the source of truth.
    pub resource_version: String,
    pub raw: serde_json::Value,
}

impl Entry {
    pub fn from_raw(raw: serde_json::Value) -> Result<Self, KeyError> {
        let key = ResourceKey::from_raw(&raw)?;
        let resource_version = raw
            .pointer("/metadata/resourceVersion")
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .to_string();
        Ok(Self { key, resource_version, raw })
    }

    pub fn namespace(&self) -> Option<&str> {
        self.raw.pointer("/metadata/namespace").and_then(|v| v.as_str())
    }

    pub fn name(&self) -> &str {
        self.raw
            .pointer("/metadata/name")
            .and_then(|v| v.as_str())
            .unwrap_or("")
    }
}

/// One item on the watch feed. `Resynced` carries a full listing and stands
/// for both the initial list and any later relist.
#[derive(Debug, Clone)]
pub enum FeedEvent {
    Applied(serde_json::Value),
    Deleted(serde_json::Value),
    Resynced(Vec<serde_json::Value>),
}

/// Mutation callbacks emitted by the store after each applied change.
///
/// `on_update` sees both the previous and the new entry; `on_delete` sees
/// the evicted entry, which outlives its cache slot, so key extraction
/// still works after the object is gone.
pub trait EventHandler: Send + Sync {
    fn on_add(&self, new: &Arc<Entry>);
    fn on_update(&self, old: &Arc<Entry>, new: &Arc<Entry>);
    fn on_delete(&self, old: &Arc<Entry>);
}

pub mod prelude {
    pub use super::{Entry, EventHandler, FeedEvent, KeyError, ResourceKey};
}

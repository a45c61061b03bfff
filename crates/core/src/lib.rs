//! Kurator core types: object keys, watch events and the watch source seam.

#![forbid(unsafe_code)]

use std::fmt;
use std::sync::Arc;

use serde_json::Value;

pub mod config;
pub mod report;

pub use config::ControllerConfig;
pub use report::{ErrorReporter, LogReporter};

/// Immutable view of an observed object as last seen by the watch source.
pub type Snapshot = Arc<Value>;

/// Stable identity of an observed object: `namespace/name`, or `name` for cluster-scoped objects.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Key(Arc<str>);

impl Key {
    pub fn new(s: impl Into<Arc<str>>) -> Self { Self(s.into()) }
    pub fn as_str(&self) -> &str { &self.0 }

    /// Split into `(namespace, name)`.
    pub fn split(&self) -> Result<(Option<&str>, &str), KeyError> {
        let parts: Vec<&str> = self.0.split('/').collect();
        match parts.as_slice() {
            [name] if !name.is_empty() => Ok((None, *name)),
            [ns, name] if !name.is_empty() => Ok((if ns.is_empty() { None } else { Some(*ns) }, *name)),
            _ => Err(KeyError::Malformed(self.0.to_string())),
        }
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(&self.0) }
}

impl From<&str> for Key {
    fn from(s: &str) -> Self { Self::new(s) }
}

impl From<String> for Key {
    fn from(s: String) -> Self { Self::new(s) }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum KeyError {
    #[error("object missing metadata.name")]
    MissingName,
    #[error("unexpected key format: {0:?} (expect name or namespace/name)")]
    Malformed(String),
}

/// Derive the key of an object from `metadata.namespace` and `metadata.name`.
pub fn object_key(obj: &Value) -> Result<Key, KeyError> {
    let meta = obj.get("metadata");
    let name = meta
        .and_then(|m| m.get("name"))
        .and_then(|v| v.as_str())
        .filter(|s| !s.is_empty())
        .ok_or(KeyError::MissingName)?;
    match meta.and_then(|m| m.get("namespace")).and_then(|v| v.as_str()) {
        Some(ns) if !ns.is_empty() => Ok(Key::new(format!("{}/{}", ns, name))),
        _ => Ok(Key::new(name)),
    }
}

/// Payload of a delete notification. The final object body may be unknown when
/// the watch missed the delete and only noticed the absence on relist.
#[derive(Debug, Clone)]
pub enum DeletedObject {
    Known(Snapshot),
    Tombstone { key: Key, last_known: Option<Snapshot> },
}

impl DeletedObject {
    pub fn last_known(&self) -> Option<&Snapshot> {
        match self {
            DeletedObject::Known(o) => Some(o),
            DeletedObject::Tombstone { last_known, .. } => last_known.as_ref(),
        }
    }
}

/// Deletion-safe key function: tombstones carry their key, known objects derive it.
pub fn deletion_key(deleted: &DeletedObject) -> Result<Key, KeyError> {
    match deleted {
        DeletedObject::Known(o) => object_key(o),
        DeletedObject::Tombstone { key, .. } => Ok(key.clone()),
    }
}

/// Raw notification produced by a watch source.
#[derive(Debug, Clone)]
pub enum SourceEvent {
    /// Full listing of every object (initial list or relist).
    Listed(Vec<Value>),
    /// Object created or modified.
    Applied(Value),
    Deleted(DeletedObject),
}

/// Change notification handed to the dispatch function after the cache was updated.
#[derive(Debug, Clone)]
pub enum ObjectEvent {
    Added(Snapshot),
    Updated { old: Snapshot, new: Snapshot },
    Deleted(DeletedObject),
}

impl ObjectEvent {
    pub fn key(&self) -> Result<Key, KeyError> {
        match self {
            ObjectEvent::Added(o) => object_key(o),
            ObjectEvent::Updated { new, .. } => object_key(new),
            ObjectEvent::Deleted(d) => deletion_key(d),
        }
    }
}

pub type SourceStream = futures::stream::BoxStream<'static, anyhow::Result<SourceEvent>>;

/// Producer of the initial listing and subsequent change notifications.
///
/// The returned stream is dropped when the controller stops; implementations
/// release their resources on drop.
#[async_trait::async_trait]
pub trait WatchSource: Send + 'static {
    async fn open(self: Box<Self>) -> anyhow::Result<SourceStream>;
}

pub mod prelude {
    pub use super::{
        deletion_key, object_key, ControllerConfig, DeletedObject, ErrorReporter, Key, KeyError, LogReporter,
        ObjectEvent, Snapshot, SourceEvent, SourceStream, WatchSource,
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn namespaced_object_key() {
        let o = json!({ "metadata": { "name": "a", "namespace": "ns" } });
        assert_eq!(object_key(&o).unwrap().as_str(), "ns/a");
    }

    #[test]
    fn cluster_scoped_object_key() {
        let o = json!({ "metadata": { "name": "node-1" } });
        assert_eq!(object_key(&o).unwrap().as_str(), "node-1");
        let o = json!({ "metadata": { "name": "node-1", "namespace": "" } });
        assert_eq!(object_key(&o).unwrap().as_str(), "node-1");
    }

    #[test]
    fn missing_name_is_an_error() {
        assert_eq!(object_key(&json!({ "metadata": {} })), Err(KeyError::MissingName));
        assert_eq!(object_key(&json!({})), Err(KeyError::MissingName));
    }

    #[test]
    fn tombstone_key_does_not_need_a_body() {
        let d = DeletedObject::Tombstone { key: Key::from("ns/gone"), last_known: None };
        assert_eq!(deletion_key(&d).unwrap().as_str(), "ns/gone");
        let d = DeletedObject::Known(Arc::new(json!({ "metadata": { "name": "b", "namespace": "x" } })));
        assert_eq!(deletion_key(&d).unwrap().as_str(), "x/b");
    }

    #[test]
    fn split_key_forms() {
        assert_eq!(Key::from("ns/a").split().unwrap(), (Some("ns"), "a"));
        assert_eq!(Key::from("a").split().unwrap(), (None, "a"));
        assert!(Key::from("a/b/c").split().is_err());
        assert!(Key::from("").split().is_err());
        assert!(Key::from("ns/").split().is_err());
    }
}

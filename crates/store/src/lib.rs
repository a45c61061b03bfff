//! Kurator store: local cache mirroring the watch source, and the informer
//! feeding cache changes into the work queue.

#![forbid(unsafe_code)]

use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use kurator_core::{deletion_key, object_key, DeletedObject, Key, ObjectEvent, Snapshot, SourceEvent};
use metrics::gauge;
use rustc_hash::FxHashMap;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

mod informer;
mod source;

pub use informer::{dispatch, Informer};
pub use source::{ChannelSource, SourceHandle};

type Objects = FxHashMap<Key, Snapshot>;

/// Create an empty, unsynced cache. The writer belongs to the informer;
/// readers are handed to workers.
pub fn cache() -> (CacheWriter, CacheReader) {
    let objects = Arc::new(RwLock::new(Objects::default()));
    let (synced_tx, synced_rx) = watch::channel(false);
    (
        CacheWriter { objects: objects.clone(), synced: synced_tx },
        CacheReader { objects, synced: synced_rx },
    )
}

/// Read-only view of the cache. Lookups return shared snapshots.
#[derive(Clone)]
pub struct CacheReader {
    objects: Arc<RwLock<Objects>>,
    synced: watch::Receiver<bool>,
}

impl CacheReader {
    fn read(&self) -> RwLockReadGuard<'_, Objects> { self.objects.read().unwrap_or_else(|e| e.into_inner()) }

    pub fn get(&self, key: &Key) -> Option<Snapshot> { self.read().get(key).cloned() }

    pub fn keys(&self) -> Vec<Key> {
        let mut keys: Vec<Key> = self.read().keys().cloned().collect();
        keys.sort_unstable();
        keys
    }

    pub fn list(&self) -> Vec<Snapshot> { self.read().values().cloned().collect() }

    pub fn len(&self) -> usize { self.read().len() }

    pub fn is_empty(&self) -> bool { self.len() == 0 }

    /// True once the first full listing has been applied.
    pub fn has_synced(&self) -> bool { *self.synced.borrow() }

    /// Wait for the initial listing. Returns false when `cancel` fires first
    /// or the writer went away without syncing.
    pub async fn wait_for_sync(&self, cancel: &CancellationToken) -> bool {
        let mut rx = self.synced.clone();
        tokio::select! {
            r = rx.wait_for(|s| *s) => r.is_ok(),
            _ = cancel.cancelled() => false,
        }
    }
}

/// Exclusive writer side of the cache.
pub struct CacheWriter {
    objects: Arc<RwLock<Objects>>,
    synced: watch::Sender<bool>,
}

impl CacheWriter {
    fn write(&self) -> RwLockWriteGuard<'_, Objects> { self.objects.write().unwrap_or_else(|e| e.into_inner()) }

    pub fn reader(&self) -> CacheReader {
        CacheReader { objects: self.objects.clone(), synced: self.synced.subscribe() }
    }

    /// Apply a source notification and return the resulting handler events.
    /// Objects without a usable key are skipped.
    pub fn apply(&self, ev: SourceEvent) -> Vec<ObjectEvent> {
        let out = match ev {
            SourceEvent::Listed(list) => self.replace(list),
            SourceEvent::Applied(raw) => {
                let key = match object_key(&raw) {
                    Ok(k) => k,
                    Err(e) => {
                        warn!(error = %e, "skipping applied object");
                        return Vec::new();
                    }
                };
                let new: Snapshot = Arc::new(raw);
                match self.write().insert(key, new.clone()) {
                    Some(old) => vec![ObjectEvent::Updated { old, new }],
                    None => vec![ObjectEvent::Added(new)],
                }
            }
            SourceEvent::Deleted(deleted) => {
                let key = match deletion_key(&deleted) {
                    Ok(k) => k,
                    Err(e) => {
                        warn!(error = %e, "skipping deleted object");
                        return Vec::new();
                    }
                };
                let removed = self.write().remove(&key);
                let deleted = match removed {
                    None => {
                        debug!(key = %key, "delete for uncached key");
                        deleted
                    }
                    // a bare tombstone inherits the body the cache still held
                    Some(old) if deleted.last_known().is_none() => DeletedObject::Tombstone { key, last_known: Some(old) },
                    Some(_) => deleted,
                };
                vec![ObjectEvent::Deleted(deleted)]
            }
        };
        gauge!("cache_objects", self.objects.read().map(|m| m.len()).unwrap_or(0) as f64);
        out
    }

    /// Swap in a full listing. Keys missing from it become tombstoned deletes.
    fn replace(&self, list: Vec<serde_json::Value>) -> Vec<ObjectEvent> {
        let mut next = Objects::default();
        for raw in list {
            match object_key(&raw) {
                Ok(k) => { next.insert(k, Arc::new(raw)); }
                Err(e) => warn!(error = %e, "skipping listed object"),
            }
        }
        let mut out = Vec::with_capacity(next.len());
        let mut objects = self.write();
        for (key, new) in next.iter() {
            match objects.get(key) {
                Some(old) => out.push(ObjectEvent::Updated { old: old.clone(), new: new.clone() }),
                None => out.push(ObjectEvent::Added(new.clone())),
            }
        }
        for (key, old) in objects.iter() {
            if !next.contains_key(key) {
                out.push(ObjectEvent::Deleted(DeletedObject::Tombstone { key: key.clone(), last_known: Some(old.clone()) }));
            }
        }
        *objects = next;
        let count = objects.len();
        drop(objects);
        if !*self.synced.borrow() {
            info!(objects = count, "initial listing applied; cache synced");
            self.synced.send_replace(true);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn obj(name: &str, ns: &str, v: u32) -> serde_json::Value {
        json!({ "metadata": { "name": name, "namespace": ns, "resourceVersion": v.to_string() } })
    }

    #[test]
    fn applied_twice_yields_added_then_updated() {
        let (w, r) = cache();
        let ev = w.apply(SourceEvent::Applied(obj("a", "ns", 1)));
        assert!(matches!(ev.as_slice(), [ObjectEvent::Added(_)]));
        let ev = w.apply(SourceEvent::Applied(obj("a", "ns", 2)));
        match ev.as_slice() {
            [ObjectEvent::Updated { old, new }] => {
                assert_eq!(old["metadata"]["resourceVersion"], "1");
                assert_eq!(new["metadata"]["resourceVersion"], "2");
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(r.get(&Key::from("ns/a")).unwrap()["metadata"]["resourceVersion"], "2");
    }

    #[test]
    fn relist_tombstones_vanished_keys() {
        let (w, r) = cache();
        w.apply(SourceEvent::Listed(vec![obj("a", "ns", 1), obj("b", "ns", 1)]));
        assert!(r.has_synced());
        let ev = w.apply(SourceEvent::Listed(vec![obj("a", "ns", 2)]));
        assert_eq!(ev.len(), 2);
        let gone: Vec<_> = ev
            .iter()
            .filter_map(|e| match e {
                ObjectEvent::Deleted(DeletedObject::Tombstone { key, last_known }) => Some((key.clone(), last_known.is_some())),
                _ => None,
            })
            .collect();
        assert_eq!(gone, vec![(Key::from("ns/b"), true)]);
        assert_eq!(r.keys(), vec![Key::from("ns/a")]);
    }

    #[test]
    fn delete_of_unknown_key_still_emits() {
        let (w, r) = cache();
        let ev = w.apply(SourceEvent::Deleted(DeletedObject::Tombstone { key: Key::from("ns/x"), last_known: None }));
        assert_eq!(ev.len(), 1);
        assert!(r.is_empty());
    }

    #[test]
    fn bare_tombstone_picks_up_cached_body() {
        let (w, r) = cache();
        w.apply(SourceEvent::Applied(obj("a", "ns", 3)));
        let ev = w.apply(SourceEvent::Deleted(DeletedObject::Tombstone { key: Key::from("ns/a"), last_known: None }));
        match ev.as_slice() {
            [ObjectEvent::Deleted(d)] => {
                assert_eq!(d.last_known().unwrap()["metadata"]["resourceVersion"], "3");
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(r.is_empty());
    }

    #[test]
    fn objects_without_name_are_skipped() {
        let (w, r) = cache();
        assert!(w.apply(SourceEvent::Applied(json!({ "metadata": {} }))).is_empty());
        w.apply(SourceEvent::Listed(vec![json!({}), obj("a", "ns", 1)]));
        assert_eq!(r.len(), 1);
    }

    #[tokio::test]
    async fn wait_for_sync_respects_cancellation() {
        let (w, r) = cache();
        let cancel = CancellationToken::new();
        cancel.cancel();
        assert!(!r.wait_for_sync(&cancel).await);
        w.apply(SourceEvent::Listed(Vec::new()));
        assert!(r.wait_for_sync(&CancellationToken::new()).await);
    }

    #[tokio::test]
    async fn wait_for_sync_fails_when_writer_dropped() {
        let (w, r) = cache();
        drop(w);
        assert!(!r.wait_for_sync(&CancellationToken::new()).await);
    }
}

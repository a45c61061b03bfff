//! Kurator kubehub: discovery lookup and list+watch wiring for one GVK.

#![forbid(unsafe_code)]

use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use futures::StreamExt;
use kube::{
    api::Api,
    core::{ApiResource, DynamicObject, GroupVersionKind},
    discovery::{Discovery, Scope},
    runtime::{
        watcher::{self, Event},
        WatchStreamExt,
    },
    Client,
};
use kurator_core::{DeletedObject, SourceEvent, SourceStream, WatchSource};
use metrics::counter;
use tracing::{debug, info};

/// Parse `v1/Kind` or `group/v1/Kind`.
pub fn parse_gvk_key(key: &str) -> Result<GroupVersionKind> {
    let parts: Vec<_> = key.split('/').collect();
    match parts.as_slice() {
        [version, kind] if !version.is_empty() && !kind.is_empty() => {
            Ok(GroupVersionKind { group: String::new(), version: version.to_string(), kind: kind.to_string() })
        }
        [group, version, kind] if !version.is_empty() && !kind.is_empty() => Ok(GroupVersionKind {
            group: (*group).to_string(),
            version: (*version).to_string(),
            kind: (*kind).to_string(),
        }),
        _ => Err(anyhow!("invalid gvk key: {} (expect v1/Kind or group/v1/Kind)", key)),
    }
}

async fn find_api_resource(client: Client, gvk: &GroupVersionKind) -> Result<(ApiResource, bool)> {
    let discovery = Discovery::new(client).run().await.context("running api discovery")?;
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

fn strip_managed_fields(v: &mut serde_json::Value) {
    if let Some(meta) = v.get_mut("metadata") {
        if let Some(obj) = meta.as_object_mut() {
            obj.remove("managedFields");
        }
    }
}

fn to_raw(obj: &DynamicObject) -> Result<serde_json::Value> {
    let mut raw = serde_json::to_value(obj).context("serializing DynamicObject")?;
    strip_managed_fields(&mut raw);
    Ok(raw)
}

fn source_event_from(ev: Event<DynamicObject>) -> Result<SourceEvent> {
    match ev {
        Event::Applied(o) => Ok(SourceEvent::Applied(to_raw(&o)?)),
        Event::Deleted(o) => Ok(SourceEvent::Deleted(DeletedObject::Known(Arc::new(to_raw(&o)?)))),
        Event::Restarted(list) => {
            debug!(count = list.len(), "watch restart");
            let raws = list.iter().map(to_raw).collect::<Result<Vec<_>>>()?;
            Ok(SourceEvent::Listed(raws))
        }
    }
}

/// List+watch source for a GVK key, optionally limited to one namespace.
pub struct KubeWatchSource {
    gvk_key: String,
    namespace: Option<String>,
    client: Option<Client>,
}

impl KubeWatchSource {
    pub fn new(gvk_key: impl Into<String>, namespace: Option<String>) -> Self {
        Self { gvk_key: gvk_key.into(), namespace, client: None }
    }

    /// Use an existing client instead of the default kubeconfig/in-cluster one.
    pub fn with_client(mut self, client: Client) -> Self {
        self.client = Some(client);
        self
    }
}

#[async_trait::async_trait]
impl WatchSource for KubeWatchSource {
    async fn open(self: Box<Self>) -> Result<SourceStream> {
        let client = match self.client {
            Some(c) => c,
            None => Client::try_default().await.context("creating kube client")?,
        };
        let gvk = parse_gvk_key(&self.gvk_key)?;
        let (ar, namespaced) = find_api_resource(client.clone(), &gvk).await?;

        let api: Api<DynamicObject> = match (namespaced, self.namespace.as_deref()) {
            (true, Some(ns)) => Api::namespaced_with(client, ns, &ar),
            _ => Api::all_with(client, &ar),
        };

        info!(gvk = %self.gvk_key, ns = ?self.namespace, "watcher started");
        let stream = watcher::watcher(api, watcher::Config::default())
            .default_backoff()
            .map(|r| {
                r.map_err(|e| {
                    counter!("kube_watch_errors_total", 1u64);
                    anyhow::Error::new(e).context("kube watch")
                })
                .and_then(source_event_from)
            });
        Ok(stream.boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(name: &str) -> DynamicObject {
        let gvk = GroupVersionKind { group: String::new(), version: "v1".into(), kind: "Node".into() };
        let mut o = DynamicObject::new(name, &ApiResource::from_gvk(&gvk));
        o.metadata.managed_fields = Some(Vec::new());
        o
    }

    #[test]
    fn parse_gvk_key_parses_core() {
        let gvk = parse_gvk_key("v1/Node").expect("ok");
        assert_eq!(gvk.group, "");
        assert_eq!(gvk.version, "v1");
        assert_eq!(gvk.kind, "Node");
    }

    #[test]
    fn parse_gvk_key_parses_group() {
        let gvk = parse_gvk_key("apps/v1/Deployment").expect("ok");
        assert_eq!(gvk.group, "apps");
        assert_eq!(gvk.kind, "Deployment");
    }

    #[test]
    fn parse_gvk_key_invalid_returns_err() {
        assert!(parse_gvk_key("invalid").is_err());
        assert!(parse_gvk_key("").is_err());
        assert!(parse_gvk_key("a/b/c/d").is_err());
        assert!(parse_gvk_key("v1/").is_err());
    }

    #[test]
    fn restarted_maps_to_full_listing() {
        match source_event_from(Event::Restarted(vec![node("a"), node("b")])).unwrap() {
            SourceEvent::Listed(list) => {
                assert_eq!(list.len(), 2);
                assert_eq!(list[0]["metadata"]["name"], "a");
                assert!(list[0]["metadata"].get("managedFields").is_none());
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn deleted_keeps_object_body() {
        match source_event_from(Event::Deleted(node("gone"))).unwrap() {
            SourceEvent::Deleted(d) => {
                assert_eq!(kurator_core::deletion_key(&d).unwrap().as_str(), "gone");
            }
            other => panic!("unexpected {:?}", other),
        }
    }
}

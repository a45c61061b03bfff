use std::sync::Arc;

use futures::StreamExt;
use kurator_core::{DeletedObject, Key, SourceEvent, SourceStream, WatchSource};
use serde_json::Value;
use tokio::sync::mpsc;

/// In-process watch source fed through a channel. Useful for embedding and tests.
pub struct ChannelSource {
    rx: mpsc::UnboundedReceiver<SourceEvent>,
}

/// Sending half of a [`ChannelSource`].
#[derive(Clone)]
pub struct SourceHandle {
    tx: mpsc::UnboundedSender<SourceEvent>,
}

impl ChannelSource {
    pub fn new() -> (SourceHandle, ChannelSource) {
        let (tx, rx) = mpsc::unbounded_channel();
        (SourceHandle { tx }, ChannelSource { rx })
    }
}

impl SourceHandle {
    /// Returns false once the source was dropped.
    pub fn send(&self, ev: SourceEvent) -> bool { self.tx.send(ev).is_ok() }

    pub fn list(&self, objects: Vec<Value>) -> bool { self.send(SourceEvent::Listed(objects)) }

    pub fn apply(&self, object: Value) -> bool { self.send(SourceEvent::Applied(object)) }

    pub fn delete(&self, object: Value) -> bool { self.send(SourceEvent::Deleted(DeletedObject::Known(Arc::new(object)))) }

    /// Delete notification carrying only the key.
    pub fn delete_key(&self, key: impl Into<Key>) -> bool {
        self.send(SourceEvent::Deleted(DeletedObject::Tombstone { key: key.into(), last_known: None }))
    }
}

#[async_trait::async_trait]
impl WatchSource for ChannelSource {
    async fn open(self: Box<Self>) -> anyhow::Result<SourceStream> {
        let stream = futures::stream::unfold(self.rx, |mut rx| async move {
            rx.recv().await.map(|ev| (Ok(ev), rx))
        });
        Ok(stream.boxed())
    }
}

use std::time::Duration;

use anyhow::{Context, Result};
use futures::StreamExt;
use kurator_core::{ObjectEvent, WatchSource};
use kurator_queue::WorkQueue;
use metrics::counter;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::{CacheReader, CacheWriter};

/// Route one handler event into the queue. Events whose key cannot be
/// derived are dropped.
pub fn dispatch(queue: &WorkQueue, ev: &ObjectEvent) {
    let kind = match ev {
        ObjectEvent::Added(_) => "added",
        ObjectEvent::Updated { .. } => "updated",
        ObjectEvent::Deleted(_) => "deleted",
    };
    counter!("informer_events_total", 1u64, "kind" => kind);
    match ev.key() {
        Ok(key) => {
            trace!(key = %key, kind, "enqueue");
            queue.add(key);
        }
        Err(e) => debug!(error = %e, kind, "dropping event without key"),
    }
}

/// Runs a watch source, mirrors it into the cache and enqueues every change.
pub struct Informer {
    source: Box<dyn WatchSource>,
    writer: CacheWriter,
    queue: WorkQueue,
    resync: Option<Duration>,
}

impl Informer {
    pub fn new(source: Box<dyn WatchSource>, writer: CacheWriter, queue: WorkQueue) -> Self {
        Self { source, writer, queue, resync: None }
    }

    /// Periodically re-enqueue every cached object as an update.
    pub fn with_resync(mut self, period: Option<Duration>) -> Self {
        self.resync = period.filter(|p| !p.is_zero());
        self
    }

    pub fn reader(&self) -> CacheReader { self.writer.reader() }

    /// Consume the source until `stop` fires or the stream ends.
    pub async fn run(self, stop: CancellationToken) -> Result<()> {
        let Informer { source, writer, queue, resync } = self;
        let mut stream = source.open().await.context("opening watch source")?;
        info!(resync = ?resync, "informer started");

        let period = resync.unwrap_or(Duration::from_secs(3600));
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let reader = writer.reader();

        loop {
            tokio::select! {
                _ = stop.cancelled() => {
                    debug!("stop requested; closing watch stream");
                    break;
                }
                next = stream.next() => match next {
                    Some(Ok(ev)) => {
                        for oe in writer.apply(ev) {
                            dispatch(&queue, &oe);
                        }
                    }
                    Some(Err(e)) => {
                        counter!("informer_stream_errors_total", 1u64);
                        warn!(error = %format!("{:#}", e), "watch stream error");
                    }
                    None => {
                        warn!("watch stream ended");
                        break;
                    }
                },
                _ = ticker.tick(), if resync.is_some() => {
                    if !reader.has_synced() {
                        continue;
                    }
                    let objects = reader.list();
                    debug!(objects = objects.len(), "resync");
                    for o in objects {
                        dispatch(&queue, &ObjectEvent::Updated { old: o.clone(), new: o });
                    }
                }
            }
        }
        info!("informer stopped");
        Ok(())
    }
}

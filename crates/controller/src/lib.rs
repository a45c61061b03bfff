//! Kurator controller.
//!
//! Wires a watch source, the local cache and the work queue together:
//! start the informer, wait for the initial listing, run N workers until the
//! stop token fires, then shut the queue down and wait for in-flight work.

#![forbid(unsafe_code)]

use std::any::Any;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::anyhow;
use futures::FutureExt;
use kurator_core::{ControllerConfig, ErrorReporter, Key, LogReporter, WatchSource};
use kurator_queue::WorkQueue;
use kurator_store::{cache, CacheReader, Informer};
use metrics::{gauge, histogram};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub mod retry;

pub use retry::{Outcome, RetryPolicy};

/// Domain logic applied to one key. Must be idempotent: it may run again for
/// the same key with the same or a newer cached state. A key missing from the
/// cache means the object was deleted, which is not an error.
#[async_trait::async_trait]
pub trait Reconciler: Send + Sync + 'static {
    async fn reconcile(&self, key: &Key, cache: &CacheReader) -> anyhow::Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerState {
    NotStarted,
    Syncing,
    Running,
    ShuttingDown,
    Stopped,
}

impl fmt::Display for ControllerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ControllerState::NotStarted => "not-started",
            ControllerState::Syncing => "syncing",
            ControllerState::Running => "running",
            ControllerState::ShuttingDown => "shutting-down",
            ControllerState::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ControllerError {
    #[error("timed out after {0:?} waiting for caches to sync")]
    SyncTimeout(Duration),
    #[error("stopped before caches synced")]
    SyncCancelled,
    #[error("watch source failed before caches synced: {0:#}")]
    Source(anyhow::Error),
    #[error("controller already started")]
    AlreadyStarted,
    #[error("invalid config: {0}")]
    InvalidConfig(String),
}

struct Worker {
    queue: WorkQueue,
    cache: CacheReader,
    reconciler: Arc<dyn Reconciler>,
    reporter: Arc<dyn ErrorReporter>,
    policy: RetryPolicy,
}

pub struct Controller {
    cfg: ControllerConfig,
    queue: WorkQueue,
    cache: CacheReader,
    informer: Mutex<Option<Informer>>,
    reconciler: Arc<dyn Reconciler>,
    reporter: Arc<dyn ErrorReporter>,
    state: watch::Sender<ControllerState>,
}

impl Controller {
    /// Build a controller. Must be called within a tokio runtime (the queue spawns its timer).
    pub fn new(cfg: ControllerConfig, source: Box<dyn WatchSource>, reconciler: Arc<dyn Reconciler>) -> Result<Self, ControllerError> {
        cfg.validate().map_err(ControllerError::InvalidConfig)?;
        let queue = WorkQueue::from_config(&cfg);
        let (writer, reader) = cache();
        let informer = Informer::new(source, writer, queue.clone()).with_resync(cfg.resync_period);
        let (state, _) = watch::channel(ControllerState::NotStarted);
        Ok(Self {
            cfg,
            queue,
            cache: reader,
            informer: Mutex::new(Some(informer)),
            reconciler,
            reporter: Arc::new(LogReporter),
            state,
        })
    }

    /// Replace the sink for errors of dropped keys.
    pub fn with_reporter(mut self, reporter: Arc<dyn ErrorReporter>) -> Self {
        self.reporter = reporter;
        self
    }

    pub fn queue(&self) -> &WorkQueue { &self.queue }

    pub fn cache(&self) -> &CacheReader { &self.cache }

    pub fn config(&self) -> &ControllerConfig { &self.cfg }

    pub fn state(&self) -> watch::Receiver<ControllerState> { self.state.subscribe() }

    fn set_state(&self, next: ControllerState) {
        let prev = self.state.send_replace(next);
        info!(from = %prev, to = %next, "controller state");
    }

    /// Run until `stop` fires. Fails without starting workers when the
    /// initial listing does not complete within the sync timeout.
    pub async fn run(&self, workers: usize, stop: CancellationToken) -> Result<(), ControllerError> {
        if workers == 0 {
            return Err(ControllerError::InvalidConfig("workers must be at least 1".into()));
        }
        let informer = self
            .informer
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
            .ok_or(ControllerError::AlreadyStarted)?;

        info!(queue = %self.queue.name(), workers, "starting controller");
        self.set_state(ControllerState::Syncing);
        let informer_stop = stop.child_token();
        let mut task = Some(tokio::spawn(informer.run(informer_stop.clone())));

        if let Err(e) = self.wait_for_sync(&mut task, &stop).await {
            error!(error = %e, "caches did not sync; not starting workers");
            informer_stop.cancel();
            self.queue.shutdown();
            join_informer(task).await;
            self.set_state(ControllerState::Stopped);
            return Err(e);
        }

        self.set_state(ControllerState::Running);
        let handles = self.spawn_workers(workers);
        gauge!("controller_workers", workers as f64);

        stop.cancelled().await;
        self.set_state(ControllerState::ShuttingDown);
        self.queue.shutdown();
        for h in handles {
            if let Err(e) = h.await {
                warn!(error = %e, "worker task failed");
            }
        }
        gauge!("controller_workers", 0.0);
        join_informer(task).await;
        self.set_state(ControllerState::Stopped);
        info!("controller stopped");
        Ok(())
    }

    /// Clears `informer` when the task finished while waiting.
    async fn wait_for_sync(&self, informer: &mut Option<JoinHandle<anyhow::Result<()>>>, stop: &CancellationToken) -> Result<(), ControllerError> {
        let deadline = self.cfg.sync_timeout;
        let Some(handle) = informer.as_mut() else {
            return Err(ControllerError::Source(anyhow!("informer is not running")));
        };
        let waited = tokio::select! {
            biased;
            done = handle => Err(done),
            r = tokio::time::timeout(deadline, self.cache.wait_for_sync(stop)) => Ok(r),
        };
        let waited = match waited {
            Ok(r) => r,
            Err(done) => {
                *informer = None;
                // the stream may end right after delivering its listing
                if self.cache.has_synced() {
                    log_informer_exit(done);
                    return Ok(());
                }
                return Err(ControllerError::Source(informer_failure(done)));
            }
        };
        match waited {
            Ok(true) => Ok(()),
            Ok(false) if stop.is_cancelled() => Err(ControllerError::SyncCancelled),
            // the cache writer is gone: the informer exited before listing
            Ok(false) => match informer.take() {
                Some(task) => Err(ControllerError::Source(informer_failure(task.await))),
                None => Err(ControllerError::Source(anyhow!("informer is not running"))),
            },
            Err(_) => Err(ControllerError::SyncTimeout(deadline)),
        }
    }

    fn spawn_workers(&self, n: usize) -> Vec<JoinHandle<()>> {
        let worker = Arc::new(Worker {
            queue: self.queue.clone(),
            cache: self.cache.clone(),
            reconciler: self.reconciler.clone(),
            reporter: self.reporter.clone(),
            policy: RetryPolicy::new(self.cfg.max_retries),
        });
        (0..n)
            .map(|id| {
                let w = worker.clone();
                tokio::spawn(async move {
                    debug!(worker = id, "worker started");
                    while w.process_next().await {}
                    debug!(worker = id, "worker stopped");
                })
            })
            .collect()
    }
}

async fn join_informer(task: Option<JoinHandle<anyhow::Result<()>>>) {
    if let Some(task) = task {
        log_informer_exit(task.await);
    }
}

fn log_informer_exit(done: Result<anyhow::Result<()>, tokio::task::JoinError>) {
    match done {
        Ok(Ok(())) => debug!("informer exited"),
        Ok(Err(e)) => warn!(error = %format!("{:#}", e), "informer exited with error"),
        Err(e) => warn!(error = %e, "informer task failed"),
    }
}

fn informer_failure(done: Result<anyhow::Result<()>, tokio::task::JoinError>) -> anyhow::Error {
    match done {
        Ok(Ok(())) => anyhow!("watch stream ended before the initial listing"),
        Ok(Err(e)) => e,
        Err(e) => anyhow!("informer task failed: {}", e),
    }
}

fn panic_message(p: &(dyn Any + Send)) -> String {
    if let Some(s) = p.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = p.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

impl Worker {
    /// Handle one key. Returns false once the queue is shut down and empty.
    async fn process_next(&self) -> bool {
        let Some(lease) = self.queue.get().await else { return false };
        let key = lease.key().clone();
        let started = Instant::now();
        let res = AssertUnwindSafe(self.reconciler.reconcile(&key, &self.cache))
            .catch_unwind()
            .await
            .unwrap_or_else(|p| Err(anyhow!("reconcile panicked: {}", panic_message(p.as_ref()))));
        histogram!("controller_reconcile_duration_seconds", started.elapsed().as_secs_f64());
        lease.done();
        self.policy.handle(&self.queue, self.reporter.as_ref(), &key, res);
        true
    }
}

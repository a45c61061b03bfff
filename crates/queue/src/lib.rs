//! Kurator work queue.
//!
//! A deduplicating set of pending keys with per-key exclusivity:
//! - a key is handed to at most one worker at a time;
//! - re-adding a key while it is processed marks it dirty, and `done` re-queues it once;
//! - failures are retried after a rate-limited delay handled by a timer task.
//!
//! Delivery order across distinct keys is best-effort FIFO only.

#![forbid(unsafe_code)]

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use kurator_core::{ControllerConfig, Key};
use metrics::{counter, gauge, histogram};
use rustc_hash::FxHashMap;
use tokio::sync::{mpsc, Notify};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace};

mod delay;
pub mod limiter;

pub use limiter::{default_controller_limiter, limiter_from_config, ItemExponential, MaxOf, RateLimiter, TokenBucket};

#[derive(Debug, Default)]
struct ItemState {
    queued: bool,
    processing: bool,
    dirty: bool,
    added_at: Option<Instant>,
    started_at: Option<Instant>,
}

#[derive(Default)]
struct State {
    order: VecDeque<Key>,
    items: FxHashMap<Key, ItemState>,
    processing: usize,
    shutting_down: bool,
}

/// What an `add` did to the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Added {
    Queued,
    /// In flight; `done` re-queues it.
    Dirty,
    /// Already pending.
    Coalesced,
    Closed,
}

pub(crate) struct Inner {
    name: String,
    state: Mutex<State>,
    /// Wakes blocked `get` callers.
    ready: Notify,
    /// Wakes `shutdown_with_drain` when the last in-flight key is done.
    idle: Notify,
    limiter: Mutex<Box<dyn RateLimiter>>,
    delay_tx: mpsc::UnboundedSender<delay::DelayRequest>,
    closed: CancellationToken,
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn limiter(&self) -> MutexGuard<'_, Box<dyn RateLimiter>> {
        self.limiter.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn record_depth(&self, st: &State) {
        gauge!("workqueue_depth", st.order.len() as f64, "queue" => self.name.clone());
    }

    pub(crate) fn add(&self, key: Key) -> Added {
        let mut st = self.lock();
        if st.shutting_down {
            trace!(queue = %self.name, key = %key, "add after shutdown ignored");
            return Added::Closed;
        }
        let item = st.items.entry(key.clone()).or_default();
        if item.queued || item.dirty {
            trace!(key = %key, "already pending; coalesced");
            return Added::Coalesced;
        }
        counter!("workqueue_adds_total", 1u64, "queue" => self.name.clone());
        if item.processing {
            debug!(key = %key, "added while processing; marked dirty");
            item.dirty = true;
            return Added::Dirty;
        }
        item.queued = true;
        item.added_at = Some(Instant::now());
        st.order.push_back(key);
        self.record_depth(&st);
        drop(st);
        self.ready.notify_one();
        Added::Queued
    }

    fn done(&self, key: &Key) {
        let mut st = self.lock();
        let Some(item) = st.items.get_mut(key) else { return };
        if !item.processing {
            return;
        }
        item.processing = false;
        if let Some(t) = item.started_at.take() {
            histogram!("workqueue_work_duration_seconds", t.elapsed().as_secs_f64(), "queue" => self.name.clone());
        }
        let requeue = item.dirty;
        if requeue {
            item.dirty = false;
            item.queued = true;
            item.added_at = Some(Instant::now());
        } else {
            st.items.remove(key);
        }
        st.processing -= 1;
        gauge!("workqueue_unfinished_work", st.processing as f64, "queue" => self.name.clone());
        if requeue {
            st.order.push_back(key.clone());
            self.record_depth(&st);
        }
        let idle = st.processing == 0 && st.shutting_down;
        drop(st);
        if requeue {
            self.ready.notify_one();
        }
        if idle {
            self.idle.notify_waiters();
        }
    }
}

/// `now + delay`, clamped to a far-future instant when the sum overflows.
fn ready_at(now: Instant, delay: Duration) -> Instant {
    now.checked_add(delay).unwrap_or_else(|| now + FAR_FUTURE)
}

/// Roughly 30 years.
const FAR_FUTURE: Duration = Duration::from_secs(86400 * 365 * 30);

/// Shared handle to a work queue. Cloning is cheap; all clones address the same queue.
#[derive(Clone)]
pub struct WorkQueue {
    inner: Arc<Inner>,
}

/// A key leased to one worker. Dropping the lease marks the attempt done.
pub struct Lease {
    queue: WorkQueue,
    key: Key,
}

impl Lease {
    pub fn key(&self) -> &Key { &self.key }

    /// Finish the attempt now instead of at scope end.
    pub fn done(self) {}
}

impl Drop for Lease {
    fn drop(&mut self) { self.queue.inner.done(&self.key); }
}

impl std::fmt::Debug for Lease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lease").field("key", &self.key).finish()
    }
}

impl WorkQueue {
    /// Create a queue and spawn its delay timer. Must be called within a tokio runtime.
    pub fn new(name: impl Into<String>, limiter: Box<dyn RateLimiter>) -> Self {
        let (delay_tx, delay_rx) = mpsc::unbounded_channel();
        let closed = CancellationToken::new();
        let inner = Arc::new(Inner {
            name: name.into(),
            state: Mutex::new(State::default()),
            ready: Notify::new(),
            idle: Notify::new(),
            limiter: Mutex::new(limiter),
            delay_tx,
            closed: closed.clone(),
        });
        tokio::spawn(delay::run(Arc::downgrade(&inner), delay_rx, closed));
        Self { inner }
    }

    pub fn from_config(cfg: &ControllerConfig) -> Self {
        Self::new(cfg.queue_name.clone(), Box::new(limiter_from_config(cfg)))
    }

    pub fn name(&self) -> &str { &self.inner.name }

    /// Mark `key` as needing processing. Collapses with a pending entry; marks
    /// dirty when in flight; ignored after shutdown.
    pub fn add(&self, key: Key) { self.inner.add(key); }

    /// Wait for a pending key. Returns `None` once the queue is shut down and
    /// nothing is left pending.
    pub async fn get(&self) -> Option<Lease> {
        loop {
            let notified = self.inner.ready.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut st = self.inner.lock();
                if let Some(key) = st.order.pop_front() {
                    if let Some(item) = st.items.get_mut(&key) {
                        item.queued = false;
                        item.processing = true;
                        item.started_at = Some(Instant::now());
                        if let Some(t) = item.added_at.take() {
                            histogram!("workqueue_queue_duration_seconds", t.elapsed().as_secs_f64(), "queue" => self.inner.name.clone());
                        }
                    }
                    st.processing += 1;
                    gauge!("workqueue_unfinished_work", st.processing as f64, "queue" => self.inner.name.clone());
                    self.inner.record_depth(&st);
                    let more = !st.order.is_empty();
                    drop(st);
                    if more {
                        // pass the wakeup on so a parked worker picks the rest
                        self.inner.ready.notify_one();
                    }
                    return Some(Lease { queue: self.clone(), key });
                }
                if st.shutting_down {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Finish an attempt for a key obtained from `get` without going through its lease.
    pub fn done(&self, key: &Key) { self.inner.done(key); }

    /// Re-queue after the limiter's backoff for this key.
    pub fn add_rate_limited(&self, key: Key) {
        if self.is_shutting_down() {
            return;
        }
        let delay = self.inner.limiter().when(&key);
        counter!("workqueue_retries_total", 1u64, "queue" => self.inner.name.clone());
        trace!(key = %key, ?delay, "rate limited requeue");
        self.add_after(key, delay);
    }

    /// Add `key` once `delay` has elapsed. A zero delay adds immediately.
    pub fn add_after(&self, key: Key, delay: Duration) {
        if self.is_shutting_down() {
            return;
        }
        if delay.is_zero() {
            self.add(key);
            return;
        }
        let _ = self.inner.delay_tx.send((ready_at(Instant::now(), delay), key));
    }

    /// Clear the retry history of `key`. Its pending/in-flight state is untouched.
    pub fn forget(&self, key: &Key) { self.inner.limiter().forget(key); }

    pub fn num_requeues(&self, key: &Key) -> u32 { self.inner.limiter().num_requeues(key) }

    /// Number of pending (not in-flight) keys.
    pub fn len(&self) -> usize { self.inner.lock().order.len() }

    pub fn is_empty(&self) -> bool { self.len() == 0 }

    /// Whether `key` is pending or in flight.
    pub fn contains(&self, key: &Key) -> bool { self.inner.lock().items.contains_key(key) }

    pub fn is_shutting_down(&self) -> bool { self.inner.lock().shutting_down }

    /// Stop accepting keys and wake every blocked `get`. Keys already pending
    /// are still handed out; delayed keys are discarded.
    pub fn shutdown(&self) {
        {
            let mut st = self.inner.lock();
            if st.shutting_down {
                return;
            }
            st.shutting_down = true;
            info!(queue = %self.inner.name, pending = st.order.len(), in_flight = st.processing, "work queue shutting down");
        }
        self.inner.closed.cancel();
        self.inner.ready.notify_waiters();
    }

    /// `shutdown`, then wait until no key is in flight.
    pub async fn shutdown_with_drain(&self) {
        self.shutdown();
        loop {
            let idle = self.inner.idle.notified();
            tokio::pin!(idle);
            idle.as_mut().enable();
            if self.inner.lock().processing == 0 {
                return;
            }
            idle.await;
        }
    }
}

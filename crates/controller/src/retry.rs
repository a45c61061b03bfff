//! Bounded retry: requeue with backoff up to `max_retries`, then drop.

use kurator_core::{ErrorReporter, Key};
use kurator_queue::WorkQueue;
use metrics::counter;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Success; retry history cleared.
    Forgotten,
    /// Failure; key scheduled again after backoff.
    Requeued,
    /// Failure with retries exhausted; key dropped until the next notification.
    Dropped,
}

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: u32,
}

impl RetryPolicy {
    pub fn new(max_retries: u32) -> Self { Self { max_retries } }

    pub fn handle(&self, queue: &WorkQueue, reporter: &dyn ErrorReporter, key: &Key, res: anyhow::Result<()>) -> Outcome {
        let err = match res {
            Ok(()) => {
                queue.forget(key);
                counter!("controller_reconcile_total", 1u64, "result" => "ok");
                return Outcome::Forgotten;
            }
            Err(e) => e,
        };
        counter!("controller_reconcile_total", 1u64, "result" => "error");

        let requeues = queue.num_requeues(key);
        if requeues < self.max_retries {
            info!(key = %key, attempt = requeues + 1, error = %format!("{:#}", err), "error syncing; requeueing");
            queue.add_rate_limited(key.clone());
            return Outcome::Requeued;
        }

        queue.forget(key);
        counter!("controller_dropped_total", 1u64);
        reporter.report(Some(key), &err);
        warn!(key = %key, retries = requeues, error = %format!("{:#}", err), "dropping key out of the queue");
        Outcome::Dropped
    }
}

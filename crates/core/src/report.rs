//! Sink for non-fatal errors that escape retry handling.

use metrics::counter;
use tracing::error;

use crate::Key;

/// Receives errors the controller gave up on. Must never panic.
pub trait ErrorReporter: Send + Sync {
    fn report(&self, key: Option<&Key>, err: &anyhow::Error);
}

/// Default reporter: logs and counts.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogReporter;

impl ErrorReporter for LogReporter {
    fn report(&self, key: Option<&Key>, err: &anyhow::Error) {
        counter!("controller_errors_total", 1u64);
        match key {
            Some(k) => error!(key = %k, error = %format!("{:#}", err), "unhandled error"),
            None => error!(error = %format!("{:#}", err), "unhandled error"),
        }
    }
}

//! Controller settings with env overrides (`KURATOR_*`).

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Scalar knobs consumed by the queue and the controller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControllerConfig {
    /// Queue name used as metrics label.
    pub queue_name: String,
    /// Number of concurrent worker loops.
    pub workers: usize,
    /// Failed attempts tolerated before a key is dropped.
    pub max_retries: u32,
    /// Per-key exponential backoff: first delay.
    pub backoff_base: Duration,
    /// Per-key exponential backoff: upper bound.
    pub backoff_cap: Duration,
    /// Overall retry rate (token bucket refill per second).
    pub qps: f64,
    pub burst: u32,
    /// Deadline for the initial listing to land in the cache.
    pub sync_timeout: Duration,
    /// Re-enqueue every cached key at this interval; `None` disables resync.
    pub resync_period: Option<Duration>,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            queue_name: "default".to_string(),
            workers: 1,
            max_retries: 5,
            backoff_base: Duration::from_millis(5),
            backoff_cap: Duration::from_secs(1000),
            qps: 10.0,
            burst: 100,
            sync_timeout: Duration::from_secs(30),
            resync_period: None,
        }
    }
}

const VARS: &[(&str, &str, &str)] = &[
    ("KURATOR_WORKERS", "1", "number of concurrent workers"),
    ("KURATOR_MAX_RETRIES", "5", "failed attempts before a key is dropped"),
    ("KURATOR_BACKOFF_BASE_MS", "5", "first retry delay for a failing key"),
    ("KURATOR_BACKOFF_CAP_SECS", "1000", "maximum retry delay for a failing key"),
    ("KURATOR_QPS", "10", "overall retry rate"),
    ("KURATOR_BURST", "100", "overall retry burst"),
    ("KURATOR_SYNC_TIMEOUT_SECS", "30", "deadline for the initial listing"),
    ("KURATOR_RESYNC_SECS", "0", "periodic resync of all keys (0 = off)"),
];

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|s| s.trim().parse::<T>().ok())
}

impl ControllerConfig {
    /// Defaults overridden by any parsable `KURATOR_*` variables.
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        if let Some(v) = env_parse::<usize>("KURATOR_WORKERS") { cfg.workers = v; }
        if let Some(v) = env_parse::<u32>("KURATOR_MAX_RETRIES") { cfg.max_retries = v; }
        if let Some(v) = env_parse::<u64>("KURATOR_BACKOFF_BASE_MS") { cfg.backoff_base = Duration::from_millis(v); }
        if let Some(v) = env_parse::<u64>("KURATOR_BACKOFF_CAP_SECS") { cfg.backoff_cap = Duration::from_secs(v); }
        if let Some(v) = env_parse::<f64>("KURATOR_QPS") { cfg.qps = v; }
        if let Some(v) = env_parse::<u32>("KURATOR_BURST") { cfg.burst = v; }
        if let Some(v) = env_parse::<u64>("KURATOR_SYNC_TIMEOUT_SECS") { cfg.sync_timeout = Duration::from_secs(v); }
        if let Some(v) = env_parse::<u64>("KURATOR_RESYNC_SECS") {
            cfg.resync_period = if v == 0 { None } else { Some(Duration::from_secs(v)) };
        }
        cfg
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.workers == 0 { return Err("workers must be at least 1".into()); }
        if !(self.qps > 0.0) { return Err(format!("qps must be positive (got {})", self.qps)); }
        if self.burst == 0 { return Err("burst must be at least 1".into()); }
        if self.backoff_base > self.backoff_cap {
            return Err(format!("backoff base {:?} exceeds cap {:?}", self.backoff_base, self.backoff_cap));
        }
        Ok(())
    }

    /// Printable table of recognised variables.
    pub fn usage() -> String {
        let mut out = String::from("KEY                          DEFAULT  DESCRIPTION\n");
        for (k, d, desc) in VARS {
            out.push_str(&format!("{:<28} {:<8} {}\n", k, d, desc));
        }
        out
    }
}

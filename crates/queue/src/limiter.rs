//! Retry delay policies. Per-key failure counts double as the requeue bookkeeping.

use std::time::{Duration, Instant};

use kurator_core::{ControllerConfig, Key};
use rustc_hash::FxHashMap;

/// Decides how long a key waits before it is re-queued after a failure.
pub trait RateLimiter: Send {
    /// Delay for the next retry of `key`; records one more failure.
    fn when(&mut self, key: &Key) -> Duration;
    /// Drop all bookkeeping for `key`.
    fn forget(&mut self, key: &Key);
    fn num_requeues(&self, key: &Key) -> u32;
}

/// Per-key exponential backoff: `base * 2^failures`, capped.
pub struct ItemExponential {
    base: Duration,
    cap: Duration,
    failures: FxHashMap<Key, u32>,
}

impl ItemExponential {
    pub fn new(base: Duration, cap: Duration) -> Self {
        Self { base, cap, failures: FxHashMap::default() }
    }
}

impl RateLimiter for ItemExponential {
    fn when(&mut self, key: &Key) -> Duration {
        let n = self.failures.entry(key.clone()).or_insert(0);
        let exp = *n;
        *n = n.saturating_add(1);
        let secs = self.base.as_secs_f64() * 2f64.powi(exp.min(1023) as i32);
        if !secs.is_finite() || secs >= self.cap.as_secs_f64() {
            return self.cap;
        }
        Duration::from_secs_f64(secs)
    }

    fn forget(&mut self, key: &Key) { self.failures.remove(key); }

    fn num_requeues(&self, key: &Key) -> u32 { self.failures.get(key).copied().unwrap_or(0) }
}

/// Overall retry rate limit shared by all keys.
pub struct TokenBucket {
    qps: f64,
    burst: f64,
    tokens: f64,
    last: Instant,
}

impl TokenBucket {
    pub fn new(qps: f64, burst: u32) -> Self {
        let burst = burst.max(1) as f64;
        Self { qps: qps.max(f64::MIN_POSITIVE), burst, tokens: burst, last: Instant::now() }
    }
}

impl RateLimiter for TokenBucket {
    fn when(&mut self, _key: &Key) -> Duration {
        let now = Instant::now();
        let elapsed = now.saturating_duration_since(self.last).as_secs_f64();
        self.last = now;
        self.tokens = (self.tokens + elapsed * self.qps).min(self.burst);
        // Reserve a token even when in debt; the debt is the wait.
        self.tokens -= 1.0;
        if self.tokens >= 0.0 {
            Duration::ZERO
        } else {
            // overflows to the maximum for a vanishing qps
            Duration::try_from_secs_f64(-self.tokens / self.qps).unwrap_or(Duration::MAX)
        }
    }

    fn forget(&mut self, _key: &Key) {}

    fn num_requeues(&self, _key: &Key) -> u32 { 0 }
}

/// Combines limiters: the longest delay wins.
pub struct MaxOf(Vec<Box<dyn RateLimiter>>);

impl MaxOf {
    pub fn new(limiters: Vec<Box<dyn RateLimiter>>) -> Self { Self(limiters) }
}

impl RateLimiter for MaxOf {
    fn when(&mut self, key: &Key) -> Duration {
        self.0.iter_mut().map(|l| l.when(key)).max().unwrap_or(Duration::ZERO)
    }

    fn forget(&mut self, key: &Key) {
        for l in self.0.iter_mut() { l.forget(key); }
    }

    fn num_requeues(&self, key: &Key) -> u32 {
        self.0.iter().map(|l| l.num_requeues(key)).max().unwrap_or(0)
    }
}

/// Exponential 5ms..1000s per key combined with a 10 qps / 100 burst bucket.
pub fn default_controller_limiter() -> MaxOf {
    limiter_from_config(&ControllerConfig::default())
}

pub fn limiter_from_config(cfg: &ControllerConfig) -> MaxOf {
    MaxOf::new(vec![
        Box::new(ItemExponential::new(cfg.backoff_base, cfg.backoff_cap)),
        Box::new(TokenBucket::new(cfg.qps, cfg.burst)),
    ])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exponential_doubles_until_cap() {
        let mut l = ItemExponential::new(Duration::from_millis(5), Duration::from_millis(30));
        let k = Key::from("x");
        assert_eq!(l.when(&k), Duration::from_millis(5));
        assert_eq!(l.when(&k), Duration::from_millis(10));
        assert_eq!(l.when(&k), Duration::from_millis(20));
        assert_eq!(l.when(&k), Duration::from_millis(30));
        assert_eq!(l.when(&k), Duration::from_millis(30));
        assert_eq!(l.num_requeues(&k), 5);
        // other keys are independent
        assert_eq!(l.when(&Key::from("y")), Duration::from_millis(5));
    }

    #[test]
    fn exponential_survives_huge_failure_counts() {
        let mut l = ItemExponential::new(Duration::from_millis(5), Duration::from_secs(1000));
        let k = Key::from("x");
        for _ in 0..2000 { l.when(&k); }
        assert_eq!(l.when(&k), Duration::from_secs(1000));
    }

    #[test]
    fn forget_resets_requeues() {
        let mut l = default_controller_limiter();
        let k = Key::from("ns/a");
        l.when(&k);
        l.when(&k);
        assert_eq!(l.num_requeues(&k), 2);
        l.forget(&k);
        assert_eq!(l.num_requeues(&k), 0);
    }

    #[test]
    fn bucket_allows_burst_then_delays() {
        let mut b = TokenBucket::new(1.0, 2);
        let k = Key::from("k");
        assert_eq!(b.when(&k), Duration::ZERO);
        assert_eq!(b.when(&k), Duration::ZERO);
        let d = b.when(&k);
        assert!(d > Duration::from_millis(900) && d <= Duration::from_secs(1), "d={:?}", d);
        let d2 = b.when(&k);
        assert!(d2 > Duration::from_millis(1900), "d2={:?}", d2);
    }

    #[test]
    fn bucket_with_vanishing_qps_saturates() {
        let mut b = TokenBucket::new(1e-300, 1);
        let k = Key::from("k");
        assert_eq!(b.when(&k), Duration::ZERO);
        assert_eq!(b.when(&k), Duration::MAX);
    }

    #[test]
    fn max_of_takes_longest_delay() {
        let mut m = MaxOf::new(vec![
            Box::new(ItemExponential::new(Duration::from_millis(1), Duration::from_secs(1))),
            Box::new(ItemExponential::new(Duration::from_millis(7), Duration::from_secs(1))),
        ]);
        let k = Key::from("k");
        assert_eq!(m.when(&k), Duration::from_millis(7));
        assert_eq!(m.num_requeues(&k), 1);
    }
}

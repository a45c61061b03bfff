//! Timer task that re-inserts keys once their delay elapsed.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::sync::Weak;

use kurator_core::Key;
use rustc_hash::FxHashMap;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::Inner;

pub(crate) type DelayRequest = (Instant, Key);

/// Min-heap of `(ready_at, seq, key)`. `waiting` holds the authoritative fire
/// time per key; heap entries that disagree with it are stale and skipped.
#[derive(Default)]
struct Waiting {
    heap: BinaryHeap<Reverse<(Instant, u64, Key)>>,
    waiting: FxHashMap<Key, Instant>,
    seq: u64,
}

impl Waiting {
    fn insert(&mut self, at: Instant, key: Key) {
        if let Some(prev) = self.waiting.get(&key) {
            if *prev <= at {
                return;
            }
        }
        self.seq = self.seq.wrapping_add(1);
        self.waiting.insert(key.clone(), at);
        self.heap.push(Reverse((at, self.seq, key)));
    }

    fn next_at(&self) -> Option<Instant> { self.heap.peek().map(|Reverse((at, _, _))| *at) }

    fn pop_ready(&mut self, now: Instant) -> Vec<Key> {
        let mut out = Vec::new();
        while let Some(Reverse((at, _, _))) = self.heap.peek() {
            if *at > now {
                break;
            }
            let Some(Reverse((at, _, key))) = self.heap.pop() else { break };
            if self.waiting.get(&key) == Some(&at) {
                self.waiting.remove(&key);
                out.push(key);
            }
        }
        out
    }
}

pub(crate) async fn run(inner: Weak<Inner>, mut rx: mpsc::UnboundedReceiver<DelayRequest>, closed: CancellationToken) {
    let mut w = Waiting::default();
    loop {
        let next = w.next_at();
        tokio::select! {
            _ = closed.cancelled() => break,
            msg = rx.recv() => match msg {
                Some((at, key)) => {
                    trace!(key = %key, "delayed add scheduled");
                    w.insert(at, key);
                }
                None => break,
            },
            _ = tokio::time::sleep_until(next.unwrap_or_else(Instant::now)), if next.is_some() => {
                let ready = w.pop_ready(Instant::now());
                let Some(inner) = inner.upgrade() else { break };
                for key in ready {
                    inner.add(key);
                }
            }
        }
    }
    debug!(pending = w.waiting.len(), "delay loop stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn earlier_time_wins_for_same_key() {
        let now = Instant::now();
        let mut w = Waiting::default();
        w.insert(now + Duration::from_secs(10), Key::from("a"));
        w.insert(now + Duration::from_secs(1), Key::from("a"));
        w.insert(now + Duration::from_secs(5), Key::from("a"));
        assert_eq!(w.next_at(), Some(now + Duration::from_secs(1)));
        assert_eq!(w.pop_ready(now + Duration::from_secs(2)), vec![Key::from("a")]);
        // the stale 10s entry must not fire again
        assert!(w.pop_ready(now + Duration::from_secs(20)).is_empty());
    }

    #[test]
    fn pops_in_time_order() {
        let now = Instant::now();
        let mut w = Waiting::default();
        w.insert(now + Duration::from_millis(30), Key::from("c"));
        w.insert(now + Duration::from_millis(10), Key::from("a"));
        w.insert(now + Duration::from_millis(20), Key::from("b"));
        assert_eq!(w.pop_ready(now + Duration::from_millis(25)), vec![Key::from("a"), Key::from("b")]);
        assert_eq!(w.pop_ready(now + Duration::from_millis(30)), vec![Key::from("c")]);
    }
}

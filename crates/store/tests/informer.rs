#![forbid(unsafe_code)]

use std::time::Duration;

use kurator_core::Key;
use kurator_queue::{default_controller_limiter, WorkQueue};
use kurator_store::{cache, ChannelSource, Informer};
use tokio_util::sync::CancellationToken;

fn obj(name: &str, ns: &str, rv: &str) -> serde_json::Value {
    serde_json::json!({ "metadata": { "name": name, "namespace": ns, "resourceVersion": rv } })
}

async fn next_key(q: &WorkQueue) -> Key {
    let lease = tokio::time::timeout(Duration::from_secs(1), q.get()).await.expect("key enqueued").expect("queue open");
    lease.key().clone()
}

async fn wait_until(cond: impl Fn() -> bool) {
    for _ in 0..100 {
        if cond() { return; }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn changes_reach_cache_and_queue() {
    let queue = WorkQueue::new("informer", Box::new(default_controller_limiter()));
    let (handle, source) = ChannelSource::new();
    let (writer, reader) = cache();
    let stop = CancellationToken::new();
    let task = tokio::spawn(Informer::new(Box::new(source), writer, queue.clone()).run(stop.clone()));

    handle.list(vec![obj("a", "ns", "1")]);
    assert!(tokio::time::timeout(Duration::from_secs(1), reader.wait_for_sync(&stop)).await.unwrap());
    assert_eq!(next_key(&queue).await, Key::from("ns/a"));

    handle.apply(obj("b", "ns", "1"));
    handle.apply(obj("b", "ns", "2"));
    wait_until(|| reader.get(&Key::from("ns/b")).map(|o| o["metadata"]["resourceVersion"] == "2").unwrap_or(false)).await;
    // let the dispatch following the cache write land
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(next_key(&queue).await, Key::from("ns/b"));
    assert!(queue.is_empty(), "two updates for one key collapse");
    assert_eq!(reader.get(&Key::from("ns/b")).unwrap()["metadata"]["resourceVersion"], "2");

    // delete with only a key still reaches the queue
    handle.delete_key("ns/a");
    assert_eq!(next_key(&queue).await, Key::from("ns/a"));
    wait_until(|| reader.get(&Key::from("ns/a")).is_none()).await;

    stop.cancel();
    tokio::time::timeout(Duration::from_secs(1), task).await.unwrap().unwrap().unwrap();
}

#[tokio::test]
async fn resync_reenqueues_every_cached_key() {
    let queue = WorkQueue::new("resync", Box::new(default_controller_limiter()));
    let (handle, source) = ChannelSource::new();
    let (writer, _reader) = cache();
    let stop = CancellationToken::new();
    let informer = Informer::new(Box::new(source), writer, queue.clone()).with_resync(Some(Duration::from_millis(30)));
    let task = tokio::spawn(informer.run(stop.clone()));

    handle.list(vec![obj("a", "ns", "1"), obj("b", "ns", "1")]);
    let mut first = vec![next_key(&queue).await, next_key(&queue).await];
    first.sort();
    assert_eq!(first, vec![Key::from("ns/a"), Key::from("ns/b")]);

    // no new notifications; the resync tick brings both keys back
    let mut again = vec![next_key(&queue).await, next_key(&queue).await];
    again.sort();
    assert_eq!(again, first);

    stop.cancel();
    task.await.unwrap().unwrap();
}

#[tokio::test]
async fn informer_returns_when_stream_ends() {
    let queue = WorkQueue::new("ended", Box::new(default_controller_limiter()));
    let (handle, source) = ChannelSource::new();
    let (writer, _reader) = cache();
    let task = tokio::spawn(Informer::new(Box::new(source), writer, queue).run(CancellationToken::new()));
    drop(handle);
    tokio::time::timeout(Duration::from_secs(1), task).await.unwrap().unwrap().unwrap();
}

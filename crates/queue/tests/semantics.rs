#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use ursa_core::ResourceKey;
use ursa_queue::{Backoff, WorkQueue};

fn ms(n: u64) -> Duration {
    Duration::from_millis(n)
}

#[tokio::test]
async fn duplicate_adds_collapse() {
    let q = WorkQueue::new();
    let key = ResourceKey::from("default/alice");
    q.add(key.clone());
    q.add(key.clone());
    q.add(key.clone());
    assert_eq!(q.len(), 1);
    assert_eq!(q.get().await, Some(key.clone()));
    q.done(&key);
    assert!(q.is_empty());
}

#[tokio::test]
async fn in_flight_key_redelivered_exactly_once() {
    let q = WorkQueue::new();
    let key = ResourceKey::from("default/alice");
    q.add(key.clone());
    let held = q.get().await.expect("first delivery");

    // Re-adds while the key is checked out must not enter the pending set...
    q.add(key.clone());
    q.add(key.clone());
    assert_eq!(q.len(), 0);

    // ...but completing the in-flight copy redelivers it once.
    q.done(&held);
    assert_eq!(q.len(), 1);
    assert_eq!(q.get().await, Some(key.clone()));
    q.done(&key);
    assert!(q.is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn no_second_delivery_while_checked_out() {
    let q = WorkQueue::new();
    let key = ResourceKey::from("default/alice");
    q.add(key.clone());
    let held = q.get().await.expect("first delivery");
    q.add(key.clone());

    // The only copy of the key is in flight; a second consumer must block.
    let blocked = tokio::time::timeout(ms(50), q.get()).await;
    assert!(blocked.is_err(), "key must not be delivered twice concurrently");

    q.done(&held);
    assert_eq!(q.get().await, Some(key));
}

#[tokio::test(start_paused = true)]
async fn rate_limited_redelivery_backs_off() {
    let q = WorkQueue::with_backoff(Backoff::new(ms(10), ms(80)));
    let key = ResourceKey::from("default/bob");

    let mut waits = Vec::new();
    for _ in 0..5 {
        Arc::clone(&q).add_rate_limited(key.clone());
        let t0 = tokio::time::Instant::now();
        let got = q.get().await.expect("redelivery");
        waits.push(t0.elapsed());
        q.done(&got);
    }

    // 10ms, 20ms, 40ms, 80ms, then pinned at the 80ms ceiling.
    assert!(
        waits.windows(2).all(|w| w[0] <= w[1]),
        "delays must be non-decreasing: {waits:?}"
    );
    assert!(waits[0] >= ms(10) && waits[0] < ms(20), "first delay: {:?}", waits[0]);
    assert!(*waits.last().expect("waits") <= ms(81), "ceiling: {waits:?}");
    assert_eq!(q.retries(&key), 5);

    q.forget(&key);
    assert_eq!(q.retries(&key), 0);
}

#[tokio::test(start_paused = true)]
async fn forget_resets_backoff_progression() {
    let q = WorkQueue::with_backoff(Backoff::new(ms(10), ms(80)));
    let key = ResourceKey::from("default/bob");
    for _ in 0..3 {
        Arc::clone(&q).add_rate_limited(key.clone());
        let got = q.get().await.expect("redelivery");
        q.done(&got);
    }
    q.forget(&key);

    Arc::clone(&q).add_rate_limited(key.clone());
    let t0 = tokio::time::Instant::now();
    let got = q.get().await.expect("redelivery");
    assert!(t0.elapsed() < ms(20), "after forget the delay restarts at base");
    q.done(&got);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn shutdown_unblocks_consumers_and_rejects_work() {
    let q = WorkQueue::new();
    let waiter = {
        let q = q.clone();
        tokio::spawn(async move { q.get().await })
    };
    tokio::time::sleep(ms(20)).await;
    q.shut_down();
    assert_eq!(waiter.await.expect("join"), None);

    q.add(ResourceKey::from("default/alice"));
    assert!(q.is_empty(), "add after shutdown must be a no-op");
    assert_eq!(q.get().await, None);
}

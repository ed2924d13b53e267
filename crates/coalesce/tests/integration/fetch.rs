use std::sync::Arc;
use std::time::Duration;

use coalesce::{CacheError, CellStatus, CoalescingCache, FnKeys};
use tokio::runtime::Handle;

use crate::utils::{TestProducer, TrackingScopes, spawn_get, test, test_cache};

#[tokio::test(start_paused = true)]
async fn test_concurrent_fetches_share_one_invocation() {
    let producer = TestProducer::with_latency(7, Duration::from_millis(50));
    let (cache, _) = test_cache(&producer);

    let (first, second) = tokio::join!(cache.get("A".into()), cache.get("A".into()));

    assert_eq!(first.unwrap(), 7);
    assert_eq!(second.unwrap(), 7);
    assert_eq!(producer.calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_many_waiters_share_one_invocation() {
    let producer = TestProducer::with_latency(3, Duration::from_millis(50));
    let (cache, _) = test_cache(&producer);

    let waiters: Vec<_> = (0..20).map(|_| spawn_get(&cache, "A")).collect();
    for waiter in waiters {
        assert_eq!(waiter.await.unwrap().unwrap(), 3);
    }

    assert_eq!(producer.calls(), 1);
    assert_eq!(producer.interrupted(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_cached_value_is_reused() {
    let producer = TestProducer::with_latency(7, Duration::from_millis(50));
    let (cache, _) = test_cache(&producer);

    assert_eq!(cache.get("A".into()).await.unwrap(), 7);
    assert_eq!(cache.status(&"A".into()).unwrap(), CellStatus::Resolved);

    producer.set_value(8);
    assert_eq!(cache.get("A".into()).await.unwrap(), 7);
    assert_eq!(producer.calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_distinct_keys_compute_separately() {
    let producer = TestProducer::with_latency(7, Duration::from_millis(50));
    let (cache, _) = test_cache(&producer);

    let (a, b) = tokio::join!(cache.get("A".into()), cache.get("B".into()));
    assert_eq!(a.unwrap(), 7);
    assert_eq!(b.unwrap(), 7);
    assert_eq!(producer.calls(), 2);
    assert_eq!(cache.entry_count(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_status_transitions() {
    let producer = TestProducer::with_latency(7, Duration::from_millis(50));
    let (cache, _) = test_cache(&producer);
    let key = String::from("A");

    assert_eq!(cache.status(&key).unwrap(), CellStatus::Empty);

    let waiter = spawn_get(&cache, "A");
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(cache.status(&key).unwrap(), CellStatus::Pending);

    waiter.await.unwrap().unwrap();
    assert_eq!(cache.status(&key).unwrap(), CellStatus::Resolved);

    cache.remove(&key).unwrap();
    assert_eq!(cache.status(&key).unwrap(), CellStatus::Empty);
}

#[tokio::test(start_paused = true)]
async fn test_failure_fans_out_and_retries() {
    let producer = TestProducer::with_latency(7, Duration::from_millis(50));
    let (cache, _) = test_cache(&producer);
    producer.fail_next("upstream unavailable");

    let (first, second) = tokio::join!(cache.get("A".into()), cache.get("A".into()));

    for result in [first, second] {
        let err = result.unwrap_err();
        assert!(matches!(err, CacheError::ProducerFailed(_)), "{err:?}");
        assert_eq!(err.to_string(), "producer failed: upstream unavailable");
    }
    assert_eq!(producer.calls(), 1);
    assert_eq!(cache.status(&"A".into()).unwrap(), CellStatus::Failed);

    // a failure is not cached for later requests
    assert_eq!(cache.get("A".into()).await.unwrap(), 7);
    assert_eq!(producer.calls(), 2);
    assert_eq!(cache.status(&"A".into()).unwrap(), CellStatus::Resolved);
}

#[tokio::test(start_paused = true)]
async fn test_custom_key_policy() {
    test::setup();
    let producer = TestProducer::with_latency(7, Duration::from_millis(50));
    let cache = CoalescingCache::new(
        TrackingScopes::new(Arc::clone(&producer)),
        FnKeys(|request: &String| request.to_lowercase()),
        &test::cache_config("case-insensitive"),
        Handle::current(),
    );

    let (upper, lower) = tokio::join!(cache.get("KEY".into()), cache.get("key".into()));
    assert_eq!(upper.unwrap(), 7);
    assert_eq!(lower.unwrap(), 7);
    assert_eq!(producer.calls(), 1);
    assert_eq!(cache.name(), "case-insensitive");
}

#[tokio::test]
async fn test_from_producer() {
    test::setup();
    let producer = TestProducer::new(11);
    let cache = CoalescingCache::from_producer(
        Arc::clone(&producer),
        &test::cache_config("shared"),
        Handle::current(),
    );

    assert_eq!(cache.get("A".into()).await.unwrap(), 11);
    assert_eq!(cache.get("A".into()).await.unwrap(), 11);
    assert_eq!(producer.calls(), 1);
}

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use coalesce::{CacheError, CancellationToken};

use crate::utils::{TestProducer, test_cache};

#[tokio::test(start_paused = true)]
async fn test_sequential_transforms_accumulate() {
    let producer = TestProducer::with_latency(1, Duration::from_millis(50));
    let (cache, _) = test_cache(&producer);

    for expected in 2..=6 {
        let value = cache
            .transform("A".into(), |value| async move { value + 1 })
            .await
            .unwrap();
        assert_eq!(value, expected);
    }

    assert_eq!(cache.get("A".into()).await.unwrap(), 6);
    assert_eq!(producer.calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_transform_computes_missing_value() {
    let producer = TestProducer::with_latency(21, Duration::from_millis(50));
    let (cache, _) = test_cache(&producer);

    let value = cache
        .transform("A".into(), |value| async move { value * 2 })
        .await
        .unwrap();
    assert_eq!(value, 42);
    assert_eq!(cache.get("A".into()).await.unwrap(), 42);
    assert_eq!(producer.calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_transform_retries_after_concurrent_set() {
    let producer = TestProducer::with_latency(1, Duration::from_millis(50));
    let (cache, _) = test_cache(&producer);
    assert_eq!(cache.get("A".into()).await.unwrap(), 1);

    let applied = AtomicUsize::new(0);
    let (transformed, ()) = tokio::join!(
        cache.transform("A".into(), |value| {
            applied.fetch_add(1, Ordering::SeqCst);
            async move {
                tokio::time::sleep(Duration::from_millis(50)).await;
                value + 10
            }
        }),
        async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            cache.set(&"A".into(), 100).unwrap();
        },
    );

    assert_eq!(transformed.unwrap(), 110);
    assert_eq!(applied.load(Ordering::SeqCst), 2);
    assert_eq!(cache.get("A".into()).await.unwrap(), 110);
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_transforms_both_apply() {
    let producer = TestProducer::with_latency(1, Duration::from_millis(50));
    let (cache, _) = test_cache(&producer);

    let increment = |value: u64| async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        value + 1
    };
    let (first, second) = tokio::join!(
        cache.transform("A".into(), increment),
        cache.transform("A".into(), increment),
    );

    let mut results = [first.unwrap(), second.unwrap()];
    results.sort();
    assert_eq!(results, [2, 3]);
    assert_eq!(cache.get("A".into()).await.unwrap(), 3);
    assert_eq!(producer.calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_transform_retries_after_removal() {
    let producer = TestProducer::with_latency(1, Duration::from_millis(50));
    let (cache, _) = test_cache(&producer);

    let (transformed, ()) = tokio::join!(
        cache.transform("A".into(), |value| async move { value + 1 }),
        async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            producer.set_value(5);
            cache.remove(&"A".into()).unwrap();
        },
    );

    assert_eq!(transformed.unwrap(), 6);
    assert_eq!(producer.calls(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_transform_propagates_failure() {
    let producer = TestProducer::with_latency(1, Duration::from_millis(50));
    let (cache, _) = test_cache(&producer);
    producer.fail_next("boom");

    let applied = AtomicUsize::new(0);
    let err = cache
        .transform("A".into(), |value| {
            applied.fetch_add(1, Ordering::SeqCst);
            async move { value + 1 }
        })
        .await
        .unwrap_err();

    assert!(matches!(err, CacheError::ProducerFailed(_)), "{err:?}");
    assert_eq!(applied.load(Ordering::SeqCst), 0);
}

#[tokio::test(start_paused = true)]
async fn test_cancelled_transform_keeps_value() {
    let producer = TestProducer::with_latency(1, Duration::from_millis(50));
    let (cache, _) = test_cache(&producer);
    assert_eq!(cache.get("A".into()).await.unwrap(), 1);

    let token = CancellationToken::new();
    let (transformed, ()) = tokio::join!(
        cache.transform_with_cancellation(
            "A".into(),
            |value| async move {
                tokio::time::sleep(Duration::from_millis(100)).await;
                value + 1
            },
            &token,
        ),
        async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            token.cancel();
        },
    );

    assert!(transformed.unwrap_err().is_cancelled());
    assert_eq!(cache.get("A".into()).await.unwrap(), 1);
}

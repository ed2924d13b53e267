use std::sync::Arc;
use std::time::Duration;

use coalesce::{CacheError, CancellationToken, CellStatus};

use crate::utils::{TestProducer, test_cache};

#[tokio::test(start_paused = true)]
async fn test_cancelled_caller_does_not_affect_others() {
    let producer = TestProducer::with_latency(7, Duration::from_millis(50));
    let (cache, _) = test_cache(&producer);

    let token = CancellationToken::new();
    let cancelled = {
        let cache = Arc::clone(&cache);
        let token = token.clone();
        tokio::spawn(async move { cache.get_with_cancellation("A".into(), &token).await })
    };
    let patient = {
        let cache = Arc::clone(&cache);
        tokio::spawn(async move { cache.get("A".into()).await })
    };

    tokio::time::sleep(Duration::from_millis(10)).await;
    token.cancel();

    let err = cancelled.await.unwrap().unwrap_err();
    assert!(err.is_cancelled());
    assert_eq!(patient.await.unwrap().unwrap(), 7);

    assert_eq!(producer.calls(), 1);
    assert_eq!(producer.interrupted(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_abandoned_computation_still_populates() {
    let producer = TestProducer::with_latency(7, Duration::from_millis(50));
    let (cache, _) = test_cache(&producer);

    let token = CancellationToken::new();
    let (first, second, ()) = tokio::join!(
        cache.get_with_cancellation("A".into(), &token),
        cache.get_with_cancellation("A".into(), &token),
        async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            token.cancel();
        },
    );
    assert!(matches!(first, Err(CacheError::Cancelled)));
    assert!(matches!(second, Err(CacheError::Cancelled)));

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(cache.status(&"A".into()).unwrap(), CellStatus::Resolved);

    assert_eq!(cache.get("A".into()).await.unwrap(), 7);
    assert_eq!(producer.calls(), 1);
    assert_eq!(producer.interrupted(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_dropped_caller_does_not_stop_computation() {
    let producer = TestProducer::with_latency(7, Duration::from_millis(50));
    let (cache, _) = test_cache(&producer);

    let timed_out = tokio::time::timeout(Duration::from_millis(10), cache.get("A".into())).await;
    assert!(timed_out.is_err());

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(producer.completed(), 1);
    assert_eq!(cache.get("A".into()).await.unwrap(), 7);
    assert_eq!(producer.calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_cancelled_before_waiting() {
    let producer = TestProducer::with_latency(7, Duration::from_millis(50));
    let (cache, _) = test_cache(&producer);

    let token = CancellationToken::new();
    token.cancel();
    let err = cache
        .get_with_cancellation("A".into(), &token)
        .await
        .unwrap_err();
    assert!(err.is_cancelled());

    // the computation was started anyway and is picked up by the next caller
    assert_eq!(cache.get("A".into()).await.unwrap(), 7);
    assert_eq!(producer.calls(), 1);
}

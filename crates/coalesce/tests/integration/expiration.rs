use std::sync::Arc;
use std::time::Duration;

use coalesce::{CacheEntry, CacheKey, CoalescingCache, ExpirationPolicy, KeyPolicy};
use tokio::runtime::Handle;

use crate::utils::{TestProducer, TrackingScopes, test};

/// Keys prefixed with `short-` expire after `ttl` without access, all others never expire.
struct ShortLivedKeys {
    ttl: Duration,
}

impl KeyPolicy<String> for ShortLivedKeys {
    fn cache_key(&self, request: &String) -> CacheEntry<CacheKey> {
        Ok(request.as_str().into())
    }

    fn expiration(&self, request: &String) -> Option<ExpirationPolicy> {
        request
            .starts_with("short-")
            .then(|| ExpirationPolicy::sliding(self.ttl))
    }
}

fn short_lived_cache(
    producer: &Arc<TestProducer>,
    ttl: Duration,
) -> CoalescingCache<TrackingScopes<TestProducer>, ShortLivedKeys> {
    test::setup();
    CoalescingCache::new(
        TrackingScopes::new(Arc::clone(producer)),
        ShortLivedKeys { ttl },
        &test::cache_config("expiration"),
        Handle::current(),
    )
}

#[tokio::test]
async fn test_expiration_per_request() {
    let producer = TestProducer::new(7);
    let cache = short_lived_cache(&producer, Duration::from_millis(200));

    assert_eq!(cache.get("short-a".into()).await.unwrap(), 7);
    assert_eq!(cache.get("long-a".into()).await.unwrap(), 7);
    assert_eq!(cache.get("short-a".into()).await.unwrap(), 7);
    assert_eq!(producer.calls(), 2);

    tokio::time::sleep(Duration::from_millis(800)).await;
    cache.run_pending_tasks();

    producer.set_value(8);
    assert_eq!(cache.get("long-a".into()).await.unwrap(), 7);
    assert_eq!(producer.calls(), 2);

    assert_eq!(cache.get("short-a".into()).await.unwrap(), 8);
    assert_eq!(producer.calls(), 3);
}

#[tokio::test]
async fn test_sliding_expiration_renews_on_access() {
    let producer = TestProducer::new(7);
    let cache = short_lived_cache(&producer, Duration::from_millis(500));

    assert_eq!(cache.get("short-a".into()).await.unwrap(), 7);
    for _ in 0..8 {
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(cache.get("short-a".into()).await.unwrap(), 7);
    }
    assert_eq!(producer.calls(), 1);

    tokio::time::sleep(Duration::from_millis(1200)).await;
    assert_eq!(cache.get("short-a".into()).await.unwrap(), 7);
    assert_eq!(producer.calls(), 2);
}

use std::sync::Arc;

use coalesce::{CoalescingCache, JsonKeys};
use tokio::runtime::Handle;

pub use coalesce_test as test;
pub use coalesce_test::{TestProducer, TrackingScopes};

pub type TestCache = CoalescingCache<TrackingScopes<TestProducer>>;

/// Creates a cache in front of `producer`, along with a handle on its scope counters.
pub fn test_cache(producer: &Arc<TestProducer>) -> (Arc<TestCache>, TrackingScopes<TestProducer>) {
    test::setup();

    let scopes = TrackingScopes::new(Arc::clone(producer));
    let cache = CoalescingCache::new(
        scopes.clone(),
        JsonKeys,
        &test::cache_config("test"),
        Handle::current(),
    );
    (Arc::new(cache), scopes)
}

/// Spawns a `get` for `key` that can be awaited later.
pub fn spawn_get(
    cache: &Arc<TestCache>,
    key: &str,
) -> tokio::task::JoinHandle<coalesce::CacheEntry<u64>> {
    let cache = Arc::clone(cache);
    let key = key.to_owned();
    tokio::spawn(async move { cache.get(key).await })
}

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;

use crate::cell::{Cell, CellStatus};
use crate::computation::{Launcher, RequestOf, ResponseOf};
use crate::config::CacheConfig;
use crate::error::CacheEntry;
use crate::expiration::ExpirationPolicy;
use crate::key::{JsonKeys, KeyPolicy};
use crate::producer::Producer;
use crate::scope::{InstanceOf, ScopeFactory, SharedScopeFactory};
use crate::table::CacheTable;

/// A request-coalescing cache in front of a [`Producer`].
///
/// Concurrent requests that map to the same key share a single producer invocation, and its
/// result is cached for later requests according to the configured [`ExpirationPolicy`].
///
/// Every producer invocation runs against a fresh scope created by the [`ScopeFactory`] `F`. The
/// [`KeyPolicy`] `K` decides which requests are considered equal.
pub struct CoalescingCache<F, K = JsonKeys>
where
    F: ScopeFactory,
    InstanceOf<F>: Producer,
{
    launcher: Launcher<F>,
    keys: K,
    expiration: ExpirationPolicy,
    table: CacheTable<ResponseOf<F>>,
}

impl<F, K> fmt::Debug for CoalescingCache<F, K>
where
    F: ScopeFactory,
    InstanceOf<F>: Producer,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CoalescingCache")
            .field("name", &self.launcher.name())
            .field("expiration", &self.expiration)
            .field("in-memory items", &self.table.entry_count())
            .finish()
    }
}

impl<P> CoalescingCache<SharedScopeFactory<P>, JsonKeys>
where
    P: Producer + 'static,
    P::Request: serde::Serialize,
{
    /// Creates a cache for a producer that needs no per-invocation scope, keyed by the JSON
    /// serialization of its requests.
    pub fn from_producer(producer: P, config: &CacheConfig, runtime: Handle) -> Self {
        Self::new(SharedScopeFactory::new(producer), JsonKeys, config, runtime)
    }
}

impl<F, K> CoalescingCache<F, K>
where
    F: ScopeFactory,
    InstanceOf<F>: Producer,
    K: KeyPolicy<RequestOf<F>>,
{
    /// Creates a new cache.
    ///
    /// Producer invocations are spawned onto `runtime`.
    pub fn new(factory: F, keys: K, config: &CacheConfig, runtime: Handle) -> Self {
        let name: Arc<str> = config.name.as_str().into();
        Self {
            table: CacheTable::new(&name, config.capacity),
            launcher: Launcher::new(Arc::new(factory), runtime, name),
            keys,
            expiration: config.expiration,
        }
    }

    /// Spawns producer invocations onto `runtime` instead.
    pub fn with_runtime(mut self, runtime: Handle) -> Self {
        self.launcher = self.launcher.with_runtime(runtime);
        self
    }

    /// The name of this cache.
    pub fn name(&self) -> &str {
        self.launcher.name()
    }

    fn cell(&self, request: &RequestOf<F>) -> CacheEntry<Arc<Cell<ResponseOf<F>>>> {
        let key = self.keys.cache_key(request)?;
        let expiration = self.keys.expiration(request).unwrap_or(self.expiration);
        Ok(self.table.get_or_create(key, expiration))
    }

    /// Returns the value for `request`, invoking the producer if it is not cached.
    ///
    /// Concurrent calls for the same key share one producer invocation. Dropping the returned
    /// future stops waiting without cancelling that invocation.
    pub async fn get(&self, request: RequestOf<F>) -> CacheEntry<ResponseOf<F>> {
        self.get_with_cancellation(request, &CancellationToken::new())
            .await
    }

    /// Like [`get`](Self::get), but stops waiting with
    /// [`Cancelled`](crate::CacheError::Cancelled) once `cancel` is triggered.
    pub async fn get_with_cancellation(
        &self,
        request: RequestOf<F>,
        cancel: &CancellationToken,
    ) -> CacheEntry<ResponseOf<F>> {
        metric!(counter("cache.access") += 1, "cache" => self.name(), "op" => "get");

        let cell = self.cell(&request)?;
        cell.fetch(&self.launcher, &Arc::new(request), cancel).await
    }

    /// Caches `response` for `request`.
    ///
    /// Callers currently waiting on a producer invocation for this key receive `response`, and
    /// that invocation is cancelled.
    pub fn set(&self, request: &RequestOf<F>, response: ResponseOf<F>) -> CacheEntry {
        metric!(counter("cache.access") += 1, "cache" => self.name(), "op" => "set");

        self.cell(request)?.overwrite(response);
        Ok(())
    }

    /// Removes the cached value for `request`.
    ///
    /// A producer invocation currently running for this key is cancelled, and callers waiting on
    /// it receive [`Cancelled`](crate::CacheError::Cancelled). The next request invokes the
    /// producer again.
    pub fn remove(&self, request: &RequestOf<F>) -> CacheEntry {
        metric!(counter("cache.access") += 1, "cache" => self.name(), "op" => "remove");

        let key = self.keys.cache_key(request)?;
        if let Some(cell) = self.table.get(&key) {
            cell.invalidate();
        }
        Ok(())
    }

    /// Replaces the value for `request` with the result of applying `f` to it.
    ///
    /// The value is computed first if it is not cached. If the value changes while `f` runs,
    /// `f` is applied again to the new value, so it may be called more than once.
    pub async fn transform<Fun, Fut>(
        &self,
        request: RequestOf<F>,
        f: Fun,
    ) -> CacheEntry<ResponseOf<F>>
    where
        Fun: FnMut(ResponseOf<F>) -> Fut,
        Fut: Future<Output = ResponseOf<F>>,
    {
        self.transform_with_cancellation(request, f, &CancellationToken::new())
            .await
    }

    /// Like [`transform`](Self::transform), but gives up with
    /// [`Cancelled`](crate::CacheError::Cancelled) once `cancel` is triggered.
    pub async fn transform_with_cancellation<Fun, Fut>(
        &self,
        request: RequestOf<F>,
        f: Fun,
        cancel: &CancellationToken,
    ) -> CacheEntry<ResponseOf<F>>
    where
        Fun: FnMut(ResponseOf<F>) -> Fut,
        Fut: Future<Output = ResponseOf<F>>,
    {
        metric!(counter("cache.access") += 1, "cache" => self.name(), "op" => "transform");

        let cell = self.cell(&request)?;
        cell.transform(&self.launcher, &Arc::new(request), f, cancel)
            .await
    }

    /// Returns the state of the cached value for `request`.
    pub fn status(&self, request: &RequestOf<F>) -> CacheEntry<CellStatus> {
        let key = self.keys.cache_key(request)?;
        Ok(self
            .table
            .get(&key)
            .map_or(CellStatus::Empty, |cell| cell.status()))
    }

    /// The approximate number of keys held by this cache.
    pub fn entry_count(&self) -> u64 {
        self.table.entry_count()
    }

    /// Performs pending eviction work and reports the cache size.
    pub fn run_pending_tasks(&self) {
        self.table.run_pending_tasks();
        metric!(gauge("cache.entries") = self.entry_count(), "cache" => self.name());
    }
}

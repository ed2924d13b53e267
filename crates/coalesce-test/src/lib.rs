//! Helpers for testing the cache.
//!
//! When writing tests, keep the following points in mind:
//!
//!  - In every test, call [`setup`]. This will set up the logger so that all console output
//!    is captured by the test runner.
//!
//!  - The [`TestProducer`] and [`TrackingScopes`] hand out shared counters. Keep a clone around
//!    to make assertions after the factory was moved into the cache.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use coalesce::config::CacheConfig;
use coalesce::{CancellationToken, ExpirationPolicy, Producer, ResourceScope, ScopeFactory};
use futures::future::BoxFuture;
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt::fmt;

/// Setup the test environment.
///
///  - Initializes logs: The logger only captures logs from the `coalesce` crate and mutes all
///    other logs.
pub fn setup() {
    fmt()
        .with_env_filter(EnvFilter::new("coalesce=trace"))
        .with_target(false)
        .pretty()
        .with_test_writer()
        .try_init()
        .ok();
}

/// A cache config that never expires entries on its own.
pub fn cache_config(name: &str) -> CacheConfig {
    CacheConfig {
        name: name.into(),
        capacity: 1_000,
        expiration: ExpirationPolicy::Never,
    }
}

/// Marks an invocation as interrupted unless it ran to completion.
struct Interrupted<'a> {
    counter: &'a AtomicUsize,
    finished: bool,
}

impl Drop for Interrupted<'_> {
    fn drop(&mut self) {
        if !self.finished {
            self.counter.fetch_add(1, Ordering::SeqCst);
        }
    }
}

/// A producer that answers every request with a configurable value after some latency.
///
/// It counts its invocations, and how many of them got interrupted before they could finish,
/// either because they were dropped or because they observed their cancellation token.
#[derive(Debug, Default)]
pub struct TestProducer {
    value: AtomicU64,
    latency: Mutex<Duration>,
    failures: Mutex<VecDeque<String>>,
    calls: AtomicUsize,
    interrupted: AtomicUsize,
    completed: AtomicUsize,
}

impl TestProducer {
    /// Creates a producer that responds with `value` right away.
    pub fn new(value: u64) -> Arc<Self> {
        Arc::new(Self {
            value: AtomicU64::new(value),
            ..Default::default()
        })
    }

    /// Creates a producer that responds with `value` after `latency`.
    pub fn with_latency(value: u64, latency: Duration) -> Arc<Self> {
        let producer = Self::new(value);
        producer.set_latency(latency);
        producer
    }

    /// Changes the value returned by future invocations.
    pub fn set_value(&self, value: u64) {
        self.value.store(value, Ordering::SeqCst);
    }

    /// Changes the latency of future invocations.
    pub fn set_latency(&self, latency: Duration) {
        *self.latency.lock().unwrap() = latency;
    }

    /// Makes the next invocation fail with `message`.
    ///
    /// Can be called repeatedly to queue up multiple failures.
    pub fn fail_next(&self, message: &str) {
        self.failures.lock().unwrap().push_back(message.to_owned());
    }

    /// The number of times this producer was invoked.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// The number of invocations that did not run to completion.
    pub fn interrupted(&self) -> usize {
        self.interrupted.load(Ordering::SeqCst)
    }

    /// The number of invocations that ran to completion, successfully or not.
    pub fn completed(&self) -> usize {
        self.completed.load(Ordering::SeqCst)
    }
}

impl Producer for TestProducer {
    type Request = String;
    type Response = u64;

    fn handle<'a>(
        &'a self,
        request: &'a Self::Request,
        cancel: CancellationToken,
    ) -> BoxFuture<'a, anyhow::Result<Self::Response>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let latency = *self.latency.lock().unwrap();

        Box::pin(async move {
            let mut guard = Interrupted {
                counter: &self.interrupted,
                finished: false,
            };

            tokio::select! {
                _ = cancel.cancelled() => anyhow::bail!("computing {request} was cancelled"),
                _ = tokio::time::sleep(latency) => {}
            }

            guard.finished = true;
            self.completed.fetch_add(1, Ordering::SeqCst);

            if let Some(message) = self.failures.lock().unwrap().pop_front() {
                anyhow::bail!("{message}");
            }
            Ok(self.value.load(Ordering::SeqCst))
        })
    }
}

#[derive(Debug)]
struct ScopeCounters<P> {
    producer: Arc<P>,
    created: AtomicUsize,
    released: AtomicUsize,
    broken: AtomicBool,
}

/// A [`ScopeFactory`] that tracks how many scopes are created and released.
#[derive(Debug)]
pub struct TrackingScopes<P> {
    inner: Arc<ScopeCounters<P>>,
}

impl<P> Clone for TrackingScopes<P> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<P> TrackingScopes<P> {
    /// Creates a factory whose scopes hand out `producer`.
    pub fn new(producer: Arc<P>) -> Self {
        Self {
            inner: Arc::new(ScopeCounters {
                producer,
                created: AtomicUsize::new(0),
                released: AtomicUsize::new(0),
                broken: AtomicBool::new(false),
            }),
        }
    }

    /// Makes resolving the instance of new scopes fail.
    pub fn set_broken(&self, broken: bool) {
        self.inner.broken.store(broken, Ordering::SeqCst);
    }

    /// The number of scopes created so far.
    pub fn created(&self) -> usize {
        self.inner.created.load(Ordering::SeqCst)
    }

    /// The number of scopes released so far.
    pub fn released(&self) -> usize {
        self.inner.released.load(Ordering::SeqCst)
    }
}

/// A scope created by [`TrackingScopes`].
#[derive(Debug)]
pub struct TrackingScope<P> {
    inner: Arc<ScopeCounters<P>>,
}

impl<P: Send + Sync + 'static> ResourceScope for TrackingScope<P> {
    type Instance = Arc<P>;

    fn instance(&self) -> anyhow::Result<Self::Instance> {
        if self.inner.broken.load(Ordering::SeqCst) {
            anyhow::bail!("producer is not registered in this scope");
        }
        Ok(Arc::clone(&self.inner.producer))
    }

    fn release(self) -> BoxFuture<'static, ()> {
        Box::pin(async move {
            self.inner.released.fetch_add(1, Ordering::SeqCst);
        })
    }
}

impl<P: Send + Sync + 'static> ScopeFactory for TrackingScopes<P> {
    type Scope = TrackingScope<P>;

    fn create_scope(&self) -> anyhow::Result<Self::Scope> {
        self.inner.created.fetch_add(1, Ordering::SeqCst);
        Ok(TrackingScope {
            inner: Arc::clone(&self.inner),
        })
    }
}

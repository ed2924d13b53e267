use std::sync::Arc;

use futures::future::BoxFuture;
use tokio_util::sync::CancellationToken;

/// The expensive computation whose results are cached.
///
/// A producer is expected to be idempotent per cache key: two invocations for requests that map
/// to the same key should yield interchangeable responses.
pub trait Producer: Send + Sync {
    /// Input argument to the producer.
    type Request: Send + Sync + 'static;
    /// The resulting output, handed out as a clone to every caller.
    type Response: Clone + Send + Sync + 'static;

    /// Computes a response for `request`.
    ///
    /// `cancel` is triggered when the cached value is overwritten or removed while this call is
    /// still running. Producers should stop early when they observe it; whatever they return
    /// afterwards is discarded.
    fn handle<'a>(
        &'a self,
        request: &'a Self::Request,
        cancel: CancellationToken,
    ) -> BoxFuture<'a, anyhow::Result<Self::Response>>;
}

impl<P: Producer + ?Sized> Producer for Arc<P> {
    type Request = P::Request;
    type Response = P::Response;

    fn handle<'a>(
        &'a self,
        request: &'a Self::Request,
        cancel: CancellationToken,
    ) -> BoxFuture<'a, anyhow::Result<Self::Response>> {
        (**self).handle(request, cancel)
    }
}

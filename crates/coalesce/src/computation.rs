use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;

use futures::FutureExt;
use sentry::{Hub, SentryFutureExt};
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;

use crate::cell::{Cell, Generation};
use crate::error::{CacheEntry, CacheError};
use crate::producer::Producer;
use crate::scope::{InstanceOf, OwnedScope, ScopeFactory};

/// The request type of the producer created by the [`ScopeFactory`] `F`.
pub type RequestOf<F> = <InstanceOf<F> as Producer>::Request;

/// The response type of the producer created by the [`ScopeFactory`] `F`.
pub type ResponseOf<F> = <InstanceOf<F> as Producer>::Response;

/// Runs producer invocations on behalf of coordination cells.
///
/// Invocations are spawned onto `runtime`, detached from the caller that triggered them, so that
/// the caller going away does not abort the computation for everyone else waiting on it.
pub(crate) struct Launcher<F> {
    factory: Arc<F>,
    runtime: Handle,
    name: Arc<str>,
}

impl<F> Clone for Launcher<F> {
    fn clone(&self) -> Self {
        Self {
            factory: Arc::clone(&self.factory),
            runtime: self.runtime.clone(),
            name: Arc::clone(&self.name),
        }
    }
}

impl<F> Launcher<F>
where
    F: ScopeFactory,
    InstanceOf<F>: Producer,
{
    pub fn new(factory: Arc<F>, runtime: Handle, name: Arc<str>) -> Self {
        Self {
            factory,
            runtime,
            name,
        }
    }

    /// The cache name used in logs and metrics.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn with_runtime(mut self, runtime: Handle) -> Self {
        self.runtime = runtime;
        self
    }

    /// Spawns the producer-invocation loop for `generation` of `cell`.
    pub fn spawn(
        &self,
        cell: Arc<Cell<ResponseOf<F>>>,
        request: Arc<RequestOf<F>>,
        generation: Generation,
    ) {
        let launcher = self.clone();
        let task = async move {
            let mut generation = generation;
            loop {
                tracing::trace!(
                    cache = launcher.name(),
                    generation = generation.id(),
                    "Starting computation"
                );

                let Some(outcome) = launcher.invoke(&request, generation.token()).await else {
                    tracing::trace!(
                        cache = launcher.name(),
                        generation = generation.id(),
                        "Computation cancelled"
                    );
                    return;
                };

                match cell.complete(&generation, outcome, launcher.name()) {
                    Some(next) => generation = next,
                    None => return,
                }
            }
        };

        // Bind a fresh hub so the detached task does not share scope state with its caller.
        self.runtime
            .spawn(task.bind_hub(Hub::new_from_top(Hub::current())));
    }

    /// Runs the producer once inside a freshly acquired scope.
    ///
    /// Returns `None` if the invocation was cancelled through `cancel`.
    async fn invoke(
        &self,
        request: &RequestOf<F>,
        cancel: &CancellationToken,
    ) -> Option<CacheEntry<ResponseOf<F>>> {
        let name = self.name();
        metric!(counter("cache.computation") += 1, "cache" => name);

        let scope = match OwnedScope::acquire(&*self.factory).await {
            Ok(scope) => scope,
            Err(err) => {
                metric!(counter("cache.scope.acquire_failed") += 1, "cache" => name);
                tracing::error!(
                    error = AsRef::<dyn std::error::Error>::as_ref(&err),
                    cache = name,
                    "Failed to acquire producer scope"
                );
                return (!cancel.is_cancelled()).then(|| Err(CacheError::scope(err)));
            }
        };

        let start = Instant::now();
        let computation = AssertUnwindSafe(scope.instance().handle(request, cancel.clone()))
            .catch_unwind()
            .map(|result| match result {
                Ok(result) => result.map_err(CacheError::producer),
                Err(_) => Err(CacheError::producer(anyhow::anyhow!("producer panicked"))),
            });

        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            outcome = computation => Some(outcome),
        };

        scope.release().await;
        metric!(timer("cache.computation.duration") = start.elapsed(), "cache" => name);

        match outcome {
            // The producer noticed its own cancellation and bailed out with an error.
            Some(Err(_)) if cancel.is_cancelled() => None,
            outcome => outcome,
        }
    }
}

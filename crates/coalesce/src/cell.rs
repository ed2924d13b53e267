//! The per-key coordination state machine.
//!
//! A [`Cell`] owns the currently authoritative answer for one cache key, in the form of a
//! single-assignment [`PendingResult`], and the [`Generation`] (if any) that is computing it.
//!
//! States and transitions:
//!
//! - `Empty`: no pending result. A fetch installs a pending result together with a new
//!   generation and moves to `Pending`.
//! - `Pending`: a generation is running. Its success or failure moves the cell to `Resolved`.
//! - `Resolved`: the pending result holds a value or a failure. A failure is handed out to the
//!   callers that were waiting for it, the next fetch starts a new generation.
//!
//! Overwriting moves any state to `Resolved`, removing moves any state to `Empty`. Both cancel
//! the running generation. Transforms read a resolved value and install their result only if
//! the pending result they read from is still the current one.
//!
//! The lock is only held for the state swaps themselves, never across the producer call or a
//! user supplied transform function.

use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures::channel::oneshot;
use futures::future::{FutureExt, Shared};
use tokio_util::sync::CancellationToken;

use crate::computation::{Launcher, RequestOf};
use crate::error::{CacheEntry, CacheError};
use crate::producer::Producer;
use crate::scope::{InstanceOf, ScopeFactory};

/// The externally observable state of a [`Cell`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CellStatus {
    /// Nothing is cached and nothing is being computed.
    Empty,
    /// A computation is running.
    Pending,
    /// A value is cached.
    Resolved,
    /// The last computation failed.
    Failed,
}

/// One attempt of the producer-invocation loop.
#[derive(Debug)]
pub(crate) struct Generation {
    id: u64,
    cancel: CancellationToken,
}

impl Generation {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn token(&self) -> &CancellationToken {
        &self.cancel
    }
}

/// A single-assignment future of the response.
struct PendingResult<T> {
    /// Identifies this exact future instance.
    id: u64,
    sender: Option<oneshot::Sender<CacheEntry<T>>>,
    receiver: Shared<oneshot::Receiver<CacheEntry<T>>>,
    outcome: Option<CacheEntry<T>>,
}

impl<T: Clone> PendingResult<T> {
    fn new(id: u64) -> Self {
        let (sender, receiver) = oneshot::channel();
        Self {
            id,
            sender: Some(sender),
            receiver: receiver.shared(),
            outcome: None,
        }
    }

    fn resolved(id: u64, outcome: CacheEntry<T>) -> Self {
        let mut pending = Self::new(id);
        pending.resolve(outcome);
        pending
    }

    /// Resolves this future, releasing everyone waiting on it.
    ///
    /// Does nothing if it was already resolved.
    fn resolve(&mut self, outcome: CacheEntry<T>) {
        if let Some(sender) = self.sender.take() {
            // nobody might be waiting, which is fine
            sender.send(outcome.clone()).ok();
            self.outcome = Some(outcome);
        }
    }

    fn is_resolved(&self) -> bool {
        self.outcome.is_some()
    }

    fn is_failed(&self) -> bool {
        matches!(self.outcome, Some(Err(_)))
    }

    fn waiter(&self) -> Waiter<T> {
        let state = match &self.outcome {
            Some(outcome) => WaitState::Ready(outcome.clone()),
            None => WaitState::Pending(self.receiver.clone()),
        };
        Waiter { id: self.id, state }
    }
}

enum WaitState<T> {
    Ready(CacheEntry<T>),
    Pending(Shared<oneshot::Receiver<CacheEntry<T>>>),
}

/// A caller's handle on one [`PendingResult`].
struct Waiter<T> {
    id: u64,
    state: WaitState<T>,
}

impl<T: Clone> Waiter<T> {
    /// Waits for the result, or until the caller cancels.
    ///
    /// Cancelling only ends this wait, the computation itself keeps going.
    async fn wait(self, cancel: &CancellationToken) -> CacheEntry<T> {
        match self.state {
            WaitState::Ready(outcome) => outcome,
            WaitState::Pending(receiver) => tokio::select! {
                biased;
                _ = cancel.cancelled() => Err(CacheError::Cancelled),
                // the sender is dropped when the pending result gets removed
                outcome = receiver => outcome.unwrap_or(Err(CacheError::Cancelled)),
            },
        }
    }
}

struct CellState<T> {
    pending: Option<PendingResult<T>>,
    generation: Option<Generation>,
    next_id: u64,
}

impl<T: Clone> CellState<T> {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    /// Installs a fresh pending result fed by a new generation.
    fn start_generation(&mut self) -> (Generation, Waiter<T>) {
        let id = self.next_id();
        let cancel = CancellationToken::new();

        if let Some(previous) = self.generation.replace(Generation {
            id,
            cancel: cancel.clone(),
        }) {
            previous.cancel.cancel();
        }
        let pending = PendingResult::new(id);
        let waiter = pending.waiter();
        self.pending = Some(pending);

        (Generation { id, cancel }, waiter)
    }

    /// Whether `generation` is still the one feeding the pending result.
    fn is_current(&self, generation: &Generation) -> bool {
        self.generation
            .as_ref()
            .is_some_and(|current| current.id == generation.id)
            && self
                .pending
                .as_ref()
                .is_some_and(|pending| pending.id == generation.id)
    }

    fn cancel_generation(&mut self) {
        if let Some(generation) = self.generation.take() {
            tracing::trace!(generation = generation.id, "Cancelling computation");
            generation.cancel.cancel();
        }
    }
}

/// The coordination cell for one cache key.
pub(crate) struct Cell<T> {
    state: Mutex<CellState<T>>,
}

impl<T> Cell<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self {
            state: Mutex::new(CellState {
                pending: None,
                generation: None,
                next_id: 0,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, CellState<T>> {
        // None of the critical sections can leave the state half-updated.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn status(&self) -> CellStatus {
        let state = self.lock();
        match &state.pending {
            None => CellStatus::Empty,
            Some(pending) if pending.is_failed() => CellStatus::Failed,
            Some(pending) if pending.is_resolved() => CellStatus::Resolved,
            Some(_) => CellStatus::Pending,
        }
    }

    /// Returns the current pending result, starting a new generation if there is none or the
    /// last one failed.
    fn current_or_launch<F>(
        self: &Arc<Self>,
        launcher: &Launcher<F>,
        request: &Arc<RequestOf<F>>,
    ) -> Waiter<T>
    where
        F: ScopeFactory,
        InstanceOf<F>: Producer<Response = T>,
    {
        let mut state = self.lock();
        if let Some(pending) = state.pending.as_ref().filter(|p| !p.is_failed()) {
            metric!(counter("cache.memory.hit") += 1, "cache" => launcher.name());
            return pending.waiter();
        }

        let (generation, waiter) = state.start_generation();
        drop(state);

        launcher.spawn(Arc::clone(self), Arc::clone(request), generation);
        waiter
    }

    /// Returns the cached value, computing it if necessary.
    pub async fn fetch<F>(
        self: &Arc<Self>,
        launcher: &Launcher<F>,
        request: &Arc<RequestOf<F>>,
        cancel: &CancellationToken,
    ) -> CacheEntry<T>
    where
        F: ScopeFactory,
        InstanceOf<F>: Producer<Response = T>,
    {
        self.current_or_launch(launcher, request)
            .wait(cancel)
            .await
    }

    /// Replaces the cached value with `value`.
    ///
    /// Callers waiting on a computation are released with `value` right away, and the running
    /// computation is cancelled.
    pub fn overwrite(&self, value: T) {
        let mut state = self.lock();
        match state.pending.as_mut() {
            Some(pending) if !pending.is_resolved() => pending.resolve(Ok(value)),
            _ => {
                let id = state.next_id();
                state.pending = Some(PendingResult::resolved(id, Ok(value)));
            }
        }
        state.cancel_generation();
    }

    /// Drops the cached value and cancels the running computation.
    ///
    /// Callers waiting on the computation observe [`CacheError::Cancelled`].
    pub fn invalidate(&self) {
        let mut state = self.lock();
        state.pending = None;
        state.cancel_generation();
    }

    /// Applies `f` to the cached value and caches its result.
    ///
    /// If the value `f` was applied to got replaced in the meantime, the result is discarded and
    /// `f` is applied again to the new value.
    pub async fn transform<F, Fun, Fut>(
        self: &Arc<Self>,
        launcher: &Launcher<F>,
        request: &Arc<RequestOf<F>>,
        mut f: Fun,
        cancel: &CancellationToken,
    ) -> CacheEntry<T>
    where
        F: ScopeFactory,
        InstanceOf<F>: Producer<Response = T>,
        Fun: FnMut(T) -> Fut,
        Fut: Future<Output = T>,
    {
        loop {
            let waiter = self.current_or_launch(launcher, request);
            let base_id = waiter.id;

            let base = match waiter.wait(cancel).await {
                Ok(base) => base,
                // the value was removed while we were waiting for it
                Err(CacheError::Cancelled) if !cancel.is_cancelled() => {
                    metric!(counter("cache.transform.retry") += 1, "cache" => launcher.name());
                    continue;
                }
                Err(err) => return Err(err),
            };

            let candidate = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(CacheError::Cancelled),
                candidate = f(base) => candidate,
            };

            let mut state = self.lock();
            let unchanged = state
                .pending
                .as_ref()
                .is_some_and(|pending| pending.id == base_id && pending.is_resolved());
            if unchanged {
                let id = state.next_id();
                state.pending = Some(PendingResult::resolved(id, Ok(candidate.clone())));
                return Ok(candidate);
            }
            drop(state);

            tracing::trace!(cache = launcher.name(), "Transform base superseded");
            metric!(counter("cache.transform.retry") += 1, "cache" => launcher.name());
        }
    }

    /// Records the outcome of `generation`.
    ///
    /// Returns the next generation if the loop has to run again.
    pub(crate) fn complete(
        &self,
        generation: &Generation,
        outcome: CacheEntry<T>,
        name: &str,
    ) -> Option<Generation> {
        let mut state = self.lock();

        if state.is_current(generation) {
            state.generation = None;
            if let Err(err) = &outcome {
                metric!(
                    counter("cache.computation.failed") += 1,
                    "cache" => name,
                    "error" => err.metrics_tag(),
                );
            }
            if let Some(pending) = state.pending.as_mut() {
                pending.resolve(outcome);
            }
            return None;
        }

        metric!(counter("cache.computation.superseded") += 1, "cache" => name);
        match outcome {
            Ok(_) if state.pending.is_none() && state.generation.is_none() => {
                tracing::trace!(
                    cache = name,
                    generation = generation.id,
                    "Computation superseded by removal, restarting"
                );
                let (next, _) = state.start_generation();
                Some(next)
            }
            Ok(_) => {
                tracing::trace!(
                    cache = name,
                    generation = generation.id,
                    "Discarding superseded computation"
                );
                None
            }
            Err(err) => {
                tracing::debug!(
                    error = &err as &dyn std::error::Error,
                    cache = name,
                    generation = generation.id,
                    "Swallowing failure of superseded computation"
                );
                None
            }
        }
    }
}

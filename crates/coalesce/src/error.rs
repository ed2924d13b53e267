use std::sync::Arc;

use thiserror::Error;

/// The error a cache operation can resolve to.
///
/// A single outcome of the producer is fanned out to every caller waiting on it, which is why
/// this type is [`Clone`] and wraps the underlying errors in an [`Arc`].
#[derive(Debug, Clone, Error)]
pub enum CacheError {
    /// The wait was cancelled.
    ///
    /// This is either the caller's own cancellation, or the computation it was waiting on was
    /// cancelled because the cached value was removed.
    #[error("cancelled")]
    Cancelled,
    /// The producer failed with an error other than cancellation.
    ///
    /// All callers waiting on the same computation receive the same error.
    #[error("producer failed: {0:#}")]
    ProducerFailed(Arc<anyhow::Error>),
    /// The resource scope for the producer could not be acquired.
    ///
    /// This is treated exactly like a producer failure.
    #[error("failed to acquire producer scope: {0:#}")]
    ScopeUnavailable(Arc<anyhow::Error>),
    /// No cache key could be derived from the request.
    #[error("failed to derive cache key: {0}")]
    KeyDerivation(String),
}

impl CacheError {
    /// Wraps a producer failure.
    pub fn producer(err: anyhow::Error) -> Self {
        Self::ProducerFailed(Arc::new(err))
    }

    /// Wraps a failure to acquire the producer scope.
    pub fn scope(err: anyhow::Error) -> Self {
        Self::ScopeUnavailable(Arc::new(err))
    }

    /// Returns `true` if this is [`Cancelled`](Self::Cancelled).
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// A short tag used for metrics.
    pub(crate) fn metrics_tag(&self) -> &'static str {
        match self {
            Self::Cancelled => "cancelled",
            Self::ProducerFailed(_) => "producer",
            Self::ScopeUnavailable(_) => "scope",
            Self::KeyDerivation(_) => "key",
        }
    }
}

impl From<serde_json::Error> for CacheError {
    fn from(err: serde_json::Error) -> Self {
        Self::KeyDerivation(err.to_string())
    }
}

/// An entry in a cache, containing either `Ok(T)` or an error denoting why no value could be
/// produced for the request.
pub type CacheEntry<T = ()> = Result<T, CacheError>;

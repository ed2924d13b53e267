use std::time::Duration;

use serde::Deserialize;

/// How long an idle cache entry is kept before it is evicted.
///
/// Eviction drops the coordination cell of a key together with whatever value it holds. A
/// computation that is still running keeps its cell alive until it finishes, but later callers
/// will not see its result.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(tag = "policy", rename_all = "lowercase")]
pub enum ExpirationPolicy {
    /// The entry expires `ttl` after it was last accessed.
    Sliding {
        /// Time since last access.
        #[serde(with = "humantime_serde")]
        ttl: Duration,
    },
    /// The entry expires `ttl` after it was created, regardless of accesses.
    Absolute {
        /// Time since creation.
        #[serde(with = "humantime_serde")]
        ttl: Duration,
    },
    /// The entry is only evicted when the cache runs out of capacity.
    Never,
}

impl ExpirationPolicy {
    /// A sliding expiration of `ttl`.
    pub fn sliding(ttl: Duration) -> Self {
        Self::Sliding { ttl }
    }

    /// An absolute expiration of `ttl`.
    pub fn absolute(ttl: Duration) -> Self {
        Self::Absolute { ttl }
    }

    /// The time to live of a freshly created entry.
    pub(crate) fn after_create(&self) -> Option<Duration> {
        match *self {
            Self::Sliding { ttl } | Self::Absolute { ttl } => Some(ttl),
            Self::Never => None,
        }
    }

    /// The remaining time to live of an entry that was just read.
    pub(crate) fn after_read(&self, remaining: Option<Duration>) -> Option<Duration> {
        match *self {
            Self::Sliding { ttl } => Some(ttl),
            Self::Absolute { .. } | Self::Never => remaining,
        }
    }
}

impl Default for ExpirationPolicy {
    fn default() -> Self {
        Self::sliding(Duration::from_secs(5 * 60))
    }
}

use std::borrow::Borrow;
use std::fmt;
use std::sync::Arc;

use serde::Serialize;

use crate::error::CacheEntry;
use crate::expiration::ExpirationPolicy;

/// The key addressing one coordination cell.
///
/// Keys are opaque strings that are fully determined by the request they were derived from.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey(Arc<str>);

impl CacheKey {
    /// The string form of this key.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for CacheKey {
    fn from(key: String) -> Self {
        Self(key.into())
    }
}

impl From<&str> for CacheKey {
    fn from(key: &str) -> Self {
        Self(key.into())
    }
}

impl Borrow<str> for CacheKey {
    fn borrow(&self) -> &str {
        &self.0
    }
}

/// Derives cache keys and per-entry expiration from requests.
pub trait KeyPolicy<Req>: Send + Sync + 'static {
    /// Returns the cache key for `request`.
    ///
    /// Requests considered equal must map to equal keys.
    fn cache_key(&self, request: &Req) -> CacheEntry<CacheKey>;

    /// Overrides the expiration policy for the entry created for `request`.
    ///
    /// Returning `None` uses the policy the cache was configured with.
    fn expiration(&self, _request: &Req) -> Option<ExpirationPolicy> {
        None
    }
}

/// Uses the JSON serialization of a request as its key.
///
/// Object keys are sorted, so requests holding hash maps or sets produce the same key regardless
/// of their iteration order.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonKeys;

impl<Req: Serialize> KeyPolicy<Req> for JsonKeys {
    fn cache_key(&self, request: &Req) -> CacheEntry<CacheKey> {
        Ok(serde_json::to_value(request)?.to_string().into())
    }
}

/// Derives keys with a closure.
#[derive(Clone, Copy)]
pub struct FnKeys<F>(pub F);

impl<F> fmt::Debug for FnKeys<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("FnKeys").finish_non_exhaustive()
    }
}

impl<Req, F, K> KeyPolicy<Req> for FnKeys<F>
where
    F: Fn(&Req) -> K + Send + Sync + 'static,
    K: Into<CacheKey>,
{
    fn cache_key(&self, request: &Req) -> CacheEntry<CacheKey> {
        Ok((self.0)(request).into())
    }
}

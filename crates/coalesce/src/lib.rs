//! A request-coalescing, cancellation-aware cache for expensive async computations.
//!
//! The [`CoalescingCache`] guarantees at most one in-flight producer invocation per key, fans its
//! result out to all callers waiting for it, and allows the cached value to be overwritten,
//! removed or transformed while a computation is still running:
//!
//! - [`set`](CoalescingCache::set) releases all waiters with the new value immediately and
//!   cancels the running computation, whose result will never replace the new value.
//! - [`remove`](CoalescingCache::remove) cancels the running computation. The next request
//!   triggers a new one.
//! - [`transform`](CoalescingCache::transform) is an optimistic read-modify-write that retries
//!   when the value it read was replaced concurrently.
//!
//! A caller that stops waiting, by dropping its future or through a [`CancellationToken`],
//! never affects the computation other callers are waiting on.
//!
//! Every producer invocation gets its own [`ResourceScope`] from a [`ScopeFactory`], which is
//! released on every exit path.
//!
//! [`CancellationToken`]: tokio_util::sync::CancellationToken

#![warn(missing_docs)]

#[macro_use]
pub mod metrics;

mod cache;
mod cell;
mod computation;
pub mod config;
mod error;
mod expiration;
mod key;
pub mod logging;
mod producer;
mod scope;
mod table;

pub use cache::CoalescingCache;
pub use cell::CellStatus;
pub use computation::{RequestOf, ResponseOf};
pub use error::{CacheEntry, CacheError};
pub use expiration::ExpirationPolicy;
pub use key::{CacheKey, FnKeys, JsonKeys, KeyPolicy};
pub use producer::Producer;
pub use scope::{
    InstanceOf, OwnedScope, ResourceScope, ScopeFactory, SharedScope, SharedScopeFactory,
};
pub use tokio_util::sync::CancellationToken;

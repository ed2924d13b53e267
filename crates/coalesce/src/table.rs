use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::cell::Cell;
use crate::expiration::ExpirationPolicy;
use crate::key::CacheKey;

/// An item saved in the moka cache.
#[derive(Clone)]
struct TableEntry<T> {
    cell: Arc<Cell<T>>,
    /// How this entry expires, fixed when it is created.
    expiration: ExpirationPolicy,
}

/// A struct implementing [`moka::Expiry`] that uses the [`ExpirationPolicy`] stored in each
/// [`TableEntry`].
struct EntryExpiration;

impl<T> moka::Expiry<CacheKey, TableEntry<T>> for EntryExpiration {
    fn expire_after_create(
        &self,
        _key: &CacheKey,
        value: &TableEntry<T>,
        _current_time: Instant,
    ) -> Option<Duration> {
        value.expiration.after_create()
    }

    fn expire_after_read(
        &self,
        _key: &CacheKey,
        value: &TableEntry<T>,
        _current_time: Instant,
        current_duration: Option<Duration>,
        _last_modified_at: Instant,
    ) -> Option<Duration> {
        value.expiration.after_read(current_duration)
    }

    fn expire_after_update(
        &self,
        _key: &CacheKey,
        value: &TableEntry<T>,
        _current_time: Instant,
        _current_duration: Option<Duration>,
    ) -> Option<Duration> {
        value.expiration.after_create()
    }
}

/// Maps cache keys to their coordination [`Cell`]s.
///
/// Eviction is fully delegated to moka: an evicted cell is simply dropped, and the next access to
/// its key creates a fresh one.
pub(crate) struct CacheTable<T> {
    cells: moka::sync::Cache<CacheKey, TableEntry<T>>,
}

impl<T> CacheTable<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn new(name: &str, capacity: u64) -> Self {
        let cells = moka::sync::Cache::builder()
            .name(name)
            .max_capacity(capacity)
            .expire_after(EntryExpiration)
            .build();
        Self { cells }
    }

    /// Returns the cell for `key`, creating it if it does not exist.
    ///
    /// Concurrent callers racing to create the same key all observe the same cell.
    pub fn get_or_create(&self, key: CacheKey, expiration: ExpirationPolicy) -> Arc<Cell<T>> {
        self.cells
            .get_with(key, || TableEntry {
                cell: Arc::new(Cell::new()),
                expiration,
            })
            .cell
    }

    /// Returns the cell for `key` if it exists.
    pub fn get(&self, key: &CacheKey) -> Option<Arc<Cell<T>>> {
        self.cells.get(key).map(|entry| entry.cell)
    }

    pub fn entry_count(&self) -> u64 {
        self.cells.entry_count()
    }

    pub fn run_pending_tasks(&self) {
        self.cells.run_pending_tasks();
    }
}

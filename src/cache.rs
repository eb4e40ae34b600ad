//! Generic reference-counted resource cache.
//!
//! The page cache, the data manager and the version manager all keep their
//! loaded objects in a [`ResourceCache`]. Each of them plugs in a
//! [`CacheBackend`] that knows how to load an object for a key and what to do
//! when the last reference to it goes away.
//!
//! A `get` hands out a [`CacheHandle`]; dropping (or explicitly releasing) the
//! handle decrements the reference count and evicts the object once the count
//! reaches zero. A bounded cache that is full refuses new keys with
//! [`DbError::CacheFull`] instead of blocking.

use std::collections::{HashMap, HashSet};
use std::ops::Deref;
use std::sync::Arc;

use log::error;
use parking_lot::{Condvar, Mutex};

use crate::error::{DbError, DbResult};

/// Strategy plugged into a [`ResourceCache`].
pub trait CacheBackend<T>: Send + Sync {
    /// Load the object for `key`. Called without the cache lock held.
    fn load(&self, key: u64) -> DbResult<T>;

    /// Called once the last reference to `value` is released, or on close.
    fn evict(&self, key: u64, value: &T) -> DbResult<()>;
}

struct CacheEntry<T> {
    value: Arc<T>,
    refs: usize,
}

struct CacheState<T> {
    entries: HashMap<u64, CacheEntry<T>>,
    /// Keys currently being loaded or evicted. They occupy a slot and
    /// concurrent lookups for them wait.
    in_flight: HashSet<u64>,
}

struct CacheInner<T> {
    state: Mutex<CacheState<T>>,
    settled: Condvar,
    backend: Box<dyn CacheBackend<T>>,
    capacity: usize,
}

/// Bounded, reference-counted cache keyed by a 64-bit identifier.
pub struct ResourceCache<T> {
    inner: Arc<CacheInner<T>>,
}

impl<T> Clone for ResourceCache<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Send + Sync> ResourceCache<T> {
    /// Create a cache holding at most `capacity` live entries (0 = unbounded).
    pub fn new(capacity: usize, backend: Box<dyn CacheBackend<T>>) -> Self {
        Self {
            inner: Arc::new(CacheInner {
                state: Mutex::new(CacheState {
                    entries: HashMap::new(),
                    in_flight: HashSet::new(),
                }),
                settled: Condvar::new(),
                backend,
                capacity,
            }),
        }
    }

    /// Get a handle to the object for `key`, loading it on first access.
    pub fn get(&self, key: u64) -> DbResult<CacheHandle<T>> {
        {
            let mut state = self.inner.state.lock();
            loop {
                if state.in_flight.contains(&key) {
                    self.inner.settled.wait(&mut state);
                    continue;
                }

                if let Some(entry) = state.entries.get_mut(&key) {
                    entry.refs += 1;
                    return Ok(CacheHandle::new(
                        Arc::clone(&self.inner),
                        key,
                        Arc::clone(&entry.value),
                    ));
                }

                let occupied = state.entries.len() + state.in_flight.len();
                if self.inner.capacity > 0 && occupied >= self.inner.capacity {
                    return Err(DbError::CacheFull { key });
                }

                state.in_flight.insert(key);
                break;
            }
        }

        // Load outside the lock so unrelated lookups are not blocked on I/O.
        let loaded = self.inner.backend.load(key);

        let mut state = self.inner.state.lock();
        state.in_flight.remove(&key);
        self.inner.settled.notify_all();

        let value = Arc::new(loaded?);
        state.entries.insert(
            key,
            CacheEntry {
                value: Arc::clone(&value),
                refs: 1,
            },
        );
        Ok(CacheHandle::new(Arc::clone(&self.inner), key, value))
    }

    /// Evict every entry regardless of outstanding references.
    ///
    /// Handles still alive afterwards release nothing when dropped.
    pub fn close(&self) -> DbResult<()> {
        let drained: Vec<(u64, Arc<T>)> = {
            let mut state = self.inner.state.lock();
            state
                .entries
                .drain()
                .map(|(key, entry)| (key, entry.value))
                .collect()
        };

        let mut first_error = None;
        for (key, value) in drained {
            if let Err(e) = self.inner.backend.evict(key, &value) {
                error!("Failed to evict cache entry {:#x} on close: {}", key, e);
                first_error.get_or_insert(e);
            }
        }

        first_error.map_or(Ok(()), Err)
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        self.inner.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Current reference count for `key`, if it is cached.
    pub fn ref_count(&self, key: u64) -> Option<usize> {
        self.inner.state.lock().entries.get(&key).map(|e| e.refs)
    }
}

impl<T> CacheInner<T> {
    fn release(&self, key: u64, value: &Arc<T>) -> DbResult<()> {
        let evicted = {
            let mut state = self.state.lock();
            let Some(entry) = state.entries.get_mut(&key) else {
                return Ok(());
            };
            // A stale handle from before a close must not touch a reloaded entry.
            if !Arc::ptr_eq(&entry.value, value) {
                return Ok(());
            }

            entry.refs -= 1;
            if entry.refs > 0 {
                return Ok(());
            }

            let Some(entry) = state.entries.remove(&key) else {
                return Ok(());
            };
            state.in_flight.insert(key);
            entry.value
        };

        let result = self.backend.evict(key, &evicted);

        let mut state = self.state.lock();
        state.in_flight.remove(&key);
        self.settled.notify_all();

        result
    }
}

/// A pinned reference to a cached object.
pub struct CacheHandle<T> {
    cache: Arc<CacheInner<T>>,
    key: u64,
    value: Arc<T>,
    released: bool,
}

impl<T> CacheHandle<T> {
    fn new(cache: Arc<CacheInner<T>>, key: u64, value: Arc<T>) -> Self {
        Self {
            cache,
            key,
            value,
            released: false,
        }
    }

    pub fn key(&self) -> u64 {
        self.key
    }

    /// Release the handle and report any error raised by the eviction callback.
    pub fn release(mut self) -> DbResult<()> {
        self.released = true;
        self.cache.release(self.key, &self.value)
    }
}

impl<T> Deref for CacheHandle<T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        &self.value
    }
}

impl<T> Drop for CacheHandle<T> {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if let Err(e) = self.cache.release(self.key, &self.value) {
            error!("Failed to evict cache entry {:#x}: {}", self.key, e);
        }
    }
}

// storage/src/cache/mod.rs

//! Generic reference-counted cache.
//!
//! A [`RefCountCache`] maps `u64` keys to shared items produced by a
//! [`CacheBackend`]. Every successful [`RefCountCache::get`] takes a reference
//! that must be returned with [`RefCountCache::release`]; when the count
//! drops to zero the backend's `evict` runs and the item leaves the cache.
//!
//! Concurrent `get`s for a key that is still loading wait on a condition
//! variable instead of loading it twice.

use crate::{Result, StorageError};
use log::{error, trace, warn};
use parking_lot::{Condvar, Mutex};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Load and writeback callbacks for a [`RefCountCache`].
pub trait CacheBackend: Send + Sync {
    type Item: Send + Sync;

    /// Produces the item for `key`. Called without the cache lock held.
    fn load(&self, key: u64) -> Result<Self::Item>;

    /// Writes back an item leaving the cache. Called with the cache lock held,
    /// so no `get` for the same key can observe stale storage meanwhile.
    fn evict(&self, key: u64, item: &Self::Item) -> Result<()>;
}

struct CacheState<T> {
    entries: HashMap<u64, Arc<T>>,
    references: HashMap<u64, usize>,
    loading: HashSet<u64>,
    closed: bool,
}

pub struct RefCountCache<B: CacheBackend> {
    backend: B,
    state: Mutex<CacheState<B::Item>>,
    loaded: Condvar,
    loads: AtomicU64,
    evictions: AtomicU64,
}

impl<B: CacheBackend> RefCountCache<B> {
    pub fn new(backend: B) -> Self {
        Self {
            backend,
            state: Mutex::new(CacheState {
                entries: HashMap::new(),
                references: HashMap::new(),
                loading: HashSet::new(),
                closed: false,
            }),
            loaded: Condvar::new(),
            loads: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Returns the item for `key`, loading it on a miss, and takes a reference.
    pub fn get(&self, key: u64) -> Result<Arc<B::Item>> {
        let mut state = self.state.lock();
        loop {
            if state.closed {
                return Err(StorageError::CacheClosed);
            }
            if state.loading.contains(&key) {
                self.loaded.wait(&mut state);
                continue;
            }
            if let Some(item) = state.entries.get(&key).cloned() {
                *state.references.entry(key).or_insert(0) += 1;
                trace!("cache hit {:#x}", key);
                return Ok(item);
            }
            state.loading.insert(key);
            break;
        }
        drop(state);

        let loaded = self.backend.load(key);

        let mut state = self.state.lock();
        state.loading.remove(&key);
        self.loaded.notify_all();

        let item = Arc::new(loaded?);
        if state.closed {
            drop(state);
            self.backend.evict(key, &item)?;
            return Err(StorageError::CacheClosed);
        }

        state.entries.insert(key, Arc::clone(&item));
        state.references.insert(key, 1);
        self.loads.fetch_add(1, Ordering::Relaxed);
        trace!("cache load {:#x}", key);
        Ok(item)
    }

    /// Puts an item created outside the backend into the cache with one
    /// reference held by the caller.
    pub fn insert_loaded(&self, key: u64, item: B::Item) -> Result<Arc<B::Item>> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(StorageError::CacheClosed);
        }
        let item = Arc::new(item);
        if state.entries.insert(key, Arc::clone(&item)).is_some() {
            warn!("cache entry {:#x} replaced by a fresh item", key);
        }
        *state.references.entry(key).or_insert(0) += 1;
        Ok(item)
    }

    /// Drops one reference to `key`, evicting it once none remain.
    ///
    /// If the writeback fails the entry stays cached with zero references and
    /// the next release or `close` retries it.
    pub fn release(&self, key: u64) -> Result<()> {
        let mut state = self.state.lock();
        let remaining = match state.references.get_mut(&key) {
            Some(count) if *count > 0 => {
                *count -= 1;
                *count
            }
            _ => {
                if !state.closed {
                    warn!("release of unreferenced cache key {:#x}", key);
                }
                return Ok(());
            }
        };
        if remaining > 0 {
            return Ok(());
        }

        let item = match state.entries.get(&key) {
            Some(item) => Arc::clone(item),
            None => {
                state.references.remove(&key);
                return Ok(());
            }
        };
        self.backend.evict(key, &item)?;
        state.entries.remove(&key);
        state.references.remove(&key);
        self.evictions.fetch_add(1, Ordering::Relaxed);
        trace!("cache evict {:#x}", key);
        drop(state);

        // The last Arc may own other cached handles; drop it unlocked.
        drop(item);
        Ok(())
    }

    /// Evicts every entry regardless of its reference count and refuses
    /// further `get`s. Blocked waiters wake up with `CacheClosed`.
    pub fn close(&self) -> Result<()> {
        let mut first_error = None;
        let drained: Vec<(u64, Arc<B::Item>)> = {
            let mut state = self.state.lock();
            if state.closed {
                return Ok(());
            }
            state.closed = true;
            self.loaded.notify_all();

            let drained: Vec<_> = state.entries.drain().collect();
            state.references.clear();
            for (key, item) in &drained {
                if let Err(e) = self.backend.evict(*key, item) {
                    error!("writeback of {:#x} failed on close: {}", key, e);
                    first_error.get_or_insert(e);
                } else {
                    self.evictions.fetch_add(1, Ordering::Relaxed);
                }
            }
            drained
        };
        drop(drained);

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// The items cached right now, without taking references.
    pub fn entries(&self) -> Vec<(u64, Arc<B::Item>)> {
        self.state
            .lock()
            .entries
            .iter()
            .map(|(key, item)| (*key, Arc::clone(item)))
            .collect()
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    pub fn contains(&self, key: u64) -> bool {
        self.state.lock().entries.contains_key(&key)
    }

    pub fn reference_count(&self, key: u64) -> usize {
        self.state
            .lock()
            .references
            .get(&key)
            .copied()
            .unwrap_or(0)
    }

    /// Number of items currently cached.
    pub fn cached(&self) -> usize {
        self.state.lock().entries.len()
    }

    /// Number of backend loads performed so far.
    pub fn loads(&self) -> u64 {
        self.loads.load(Ordering::Relaxed)
    }

    pub fn evictions(&self) -> u64 {
        self.evictions.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Barrier;
    use std::thread;
    use std::time::Duration;

    #[derive(Default)]
    struct CountingBackend {
        loads: AtomicUsize,
        evicted: Mutex<Vec<u64>>,
        fail_key: Option<u64>,
        delay: Option<Duration>,
    }

    impl CacheBackend for CountingBackend {
        type Item = String;

        fn load(&self, key: u64) -> Result<String> {
            self.loads.fetch_add(1, Ordering::SeqCst);
            if let Some(delay) = self.delay {
                thread::sleep(delay);
            }
            if self.fail_key == Some(key) {
                return Err(StorageError::PageNotFound(key as u32));
            }
            Ok(format!("item-{}", key))
        }

        fn evict(&self, key: u64, _item: &String) -> Result<()> {
            self.evicted.lock().push(key);
            Ok(())
        }
    }

    #[test]
    fn test_get_and_release() {
        let cache = RefCountCache::new(CountingBackend::default());

        let a = cache.get(1).unwrap();
        let b = cache.get(1).unwrap();
        assert_eq!(*a, "item-1");
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(cache.reference_count(1), 2);
        assert_eq!(cache.loads(), 1);

        cache.release(1).unwrap();
        assert!(cache.contains(1));
        cache.release(1).unwrap();
        assert!(!cache.contains(1));
        assert_eq!(cache.evictions(), 1);
        assert_eq!(*cache.backend().evicted.lock(), vec![1]);
    }

    #[test]
    fn test_release_unknown_key_is_noop() {
        let cache = RefCountCache::new(CountingBackend::default());
        cache.release(42).unwrap();
        assert_eq!(cache.evictions(), 0);
    }

    #[test]
    fn test_failed_load_clears_marker() {
        let cache = RefCountCache::new(CountingBackend {
            fail_key: Some(7),
            ..Default::default()
        });

        assert!(cache.get(7).is_err());
        assert!(!cache.contains(7));
        // A retry goes back to the backend rather than waiting forever.
        assert!(cache.get(7).is_err());
        assert_eq!(cache.backend().loads.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_concurrent_get_loads_once() {
        let cache = Arc::new(RefCountCache::new(CountingBackend {
            delay: Some(Duration::from_millis(20)),
            ..Default::default()
        }));
        let threads = 8;
        let barrier = Arc::new(Barrier::new(threads));

        let handles: Vec<_> = (0..threads)
            .map(|_| {
                let cache = Arc::clone(&cache);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    cache.get(3).unwrap()
                })
            })
            .collect();
        for handle in handles {
            assert_eq!(*handle.join().unwrap(), "item-3");
        }

        assert_eq!(cache.backend().loads.load(Ordering::SeqCst), 1);
        assert_eq!(cache.reference_count(3), threads);

        for _ in 0..threads {
            cache.release(3).unwrap();
        }
        assert_eq!(cache.evictions(), 1);
    }

    #[test]
    fn test_close_evicts_everything() {
        let cache = RefCountCache::new(CountingBackend::default());
        cache.get(1).unwrap();
        cache.get(2).unwrap();

        cache.close().unwrap();
        let mut evicted = cache.backend().evicted.lock().clone();
        evicted.sort();
        assert_eq!(evicted, vec![1, 2]);
        assert!(matches!(cache.get(1), Err(StorageError::CacheClosed)));
        // Releasing after close is harmless.
        cache.release(1).unwrap();
    }

    #[test]
    fn test_insert_loaded() {
        let cache = RefCountCache::new(CountingBackend::default());
        let item = cache.insert_loaded(9, "fresh".to_string()).unwrap();
        assert_eq!(*item, "fresh");
        assert_eq!(*cache.get(9).unwrap(), "fresh");
        assert_eq!(cache.loads(), 0);
        assert_eq!(cache.reference_count(9), 2);
    }
}

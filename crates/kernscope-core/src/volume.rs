//! Volume counters with LRU eviction
//!
//! Counters are approximate: when the aggregator is full the least recently
//! touched key is dropped to make room, and its totals are gone. A key that
//! comes back after eviction starts from zero and is reported as new again.

use kernscope_common::Volumes;
use lru::LruCache;
use parking_lot::Mutex;
use std::hash::Hash;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::debug;

/// Result of one [`VolumeAggregator::accumulate`] call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Accumulated<K> {
    /// Totals for the key including this delta
    pub totals: Volumes,
    /// The key was not present before this call
    pub is_new: bool,
    /// Key evicted to make room, if any
    pub evicted: Option<K>,
}

pub struct VolumeAggregator<K: Hash + Eq> {
    name: &'static str,
    cache: Mutex<LruCache<K, Volumes>>,
    evictions: AtomicU64,
}

impl<K: Hash + Eq + Copy> VolumeAggregator<K> {
    /// A zero capacity is treated as one
    pub fn new(name: &'static str, capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            name,
            cache: Mutex::new(LruCache::new(capacity)),
            evictions: AtomicU64::new(0),
        }
    }

    /// Add `delta` to the counters for `key`, inserting it if absent.
    ///
    /// Lookup, eviction and insert happen under one lock, so two callers
    /// filling the aggregator at once cannot lose each other's updates.
    pub fn accumulate(&self, key: K, delta: Volumes) -> Accumulated<K> {
        let mut cache = self.cache.lock();
        if let Some(totals) = cache.get_mut(&key) {
            totals.add(&delta);
            return Accumulated {
                totals: *totals,
                is_new: false,
                evicted: None,
            };
        }

        let mut totals = Volumes::default();
        totals.add(&delta);
        let evicted = cache.push(key, totals).map(|(old, _)| old);
        if evicted.is_some() {
            self.evictions.fetch_add(1, Ordering::Relaxed);
            debug!(aggregator = self.name, "Evicted least recently used volume counter");
        }
        Accumulated {
            totals,
            is_new: true,
            evicted,
        }
    }

    /// Current totals without touching recency
    pub fn peek(&self, key: &K) -> Option<Volumes> {
        self.cache.lock().peek(key).copied()
    }

    /// All keys, most recently touched first
    pub fn snapshot(&self) -> Vec<(K, Volumes)> {
        self.cache.lock().iter().map(|(k, v)| (*k, *v)).collect()
    }

    pub fn len(&self) -> usize {
        self.cache.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.cache.lock().cap().get()
    }

    pub fn evictions(&self) -> u64 {
        self.evictions.load(Ordering::Relaxed)
    }

    pub fn clear(&self) {
        self.cache.lock().clear();
    }
}

impl<K: Hash + Eq> std::fmt::Debug for VolumeAggregator<K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VolumeAggregator")
            .field("name", &self.name)
            .field("evictions", &self.evictions.load(Ordering::Relaxed))
            .finish()
    }
}

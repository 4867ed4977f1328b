//! Bounded in-memory cache with per-entry TTL and LRU eviction.
//!
//! Entries past their TTL are no longer served by [`Cache::get`] but stay
//! around for [`Cache::get_stale`] until the sweep drops them, so a reader can
//! fall back to the last known value when the store is down.

use std::{
    hash::Hash,
    num::NonZeroUsize,
    sync::{
        atomic::{AtomicU64, Ordering},
        Mutex, MutexGuard, PoisonError,
    },
    time::{Duration, Instant},
};

use lru::LruCache;

#[derive(Debug, Clone)]
pub struct CacheEntry<V> {
    pub value: V,
    pub expires_at: Instant,
    pub last_touched: Instant,
}

impl<V> CacheEntry<V> {
    fn is_fresh(&self, now: Instant) -> bool {
        now < self.expires_at
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CacheStats {
    pub size: usize,
    pub capacity: usize,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub expired_cleanups: u64,
    pub hit_rate: f64,
}

pub struct Cache<K: Hash + Eq, V> {
    entries: Mutex<LruCache<K, CacheEntry<V>>>,
    ttl: Duration,
    stale_grace: Duration,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    expired_cleanups: AtomicU64,
}

impl<K, V> Cache<K, V>
where
    K: Hash + Eq + Clone,
    V: Clone,
{
    pub fn new(capacity: NonZeroUsize, ttl: Duration, stale_grace: Duration) -> Self {
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
            ttl,
            stale_grace,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            expired_cleanups: AtomicU64::new(0),
        }
    }

    fn entries(&self) -> MutexGuard<'_, LruCache<K, CacheEntry<V>>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Fresh value for `key`, counted as a hit or a miss.
    pub fn get(&self, key: &K) -> Option<V> {
        let now = Instant::now();
        let mut entries = self.entries();
        match entries.get_mut(key) {
            Some(entry) if entry.is_fresh(now) => {
                entry.last_touched = now;
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(entry.value.clone())
            }
            _ => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Last known value regardless of expiry. Does not touch recency or stats.
    pub fn get_stale(&self, key: &K) -> Option<V> {
        self.entries().peek(key).map(|entry| entry.value.clone())
    }

    pub fn insert(&self, key: K, value: V) {
        let now = Instant::now();
        let mut entries = self.entries();
        if !entries.contains(&key) && entries.len() == entries.cap().get() {
            self.evictions.fetch_add(1, Ordering::Relaxed);
        }
        entries.put(
            key,
            CacheEntry {
                value,
                expires_at: now + self.ttl,
                last_touched: now,
            },
        );
    }

    /// Read-modify-write of a fresh entry under one lock. Returns `false` and
    /// leaves the cache alone when there is no fresh entry to update.
    pub fn update_fresh<F>(&self, key: &K, update: F) -> bool
    where
        F: FnOnce(&mut V),
    {
        let now = Instant::now();
        let mut entries = self.entries();
        match entries.get_mut(key) {
            Some(entry) if entry.is_fresh(now) => {
                update(&mut entry.value);
                entry.last_touched = now;
                true
            }
            _ => false,
        }
    }

    pub fn invalidate(&self, key: &K) -> bool {
        self.entries().pop(key).is_some()
    }

    pub fn invalidate_where<P>(&self, predicate: P) -> usize
    where
        P: Fn(&K) -> bool,
    {
        let mut entries = self.entries();
        let doomed: Vec<K> = entries
            .iter()
            .filter_map(|(key, _)| predicate(key).then(|| key.clone()))
            .collect();
        for key in &doomed {
            entries.pop(key);
        }
        doomed.len()
    }

    pub fn clear(&self) -> usize {
        let mut entries = self.entries();
        let cleared = entries.len();
        entries.clear();
        cleared
    }

    /// Drops entries that expired more than `stale_grace` ago.
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries();
        let expired: Vec<K> = entries
            .iter()
            .filter(|(_, entry)| entry.expires_at + self.stale_grace <= now)
            .map(|(key, _)| key.clone())
            .collect();
        for key in &expired {
            entries.pop(key);
        }
        if !expired.is_empty() {
            self.expired_cleanups
                .fetch_add(expired.len() as u64, Ordering::Relaxed);
            debug!("Swept {} expired cache entries", expired.len());
        }
        expired.len()
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn stats(&self) -> CacheStats {
        let (size, capacity) = {
            let entries = self.entries();
            (entries.len(), entries.cap().get())
        };
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;
        CacheStats {
            size,
            capacity,
            hits,
            misses,
            evictions: self.evictions.load(Ordering::Relaxed),
            expired_cleanups: self.expired_cleanups.load(Ordering::Relaxed),
            hit_rate: if total > 0 {
                hits as f64 / total as f64 * 100.0
            } else {
                0.0
            },
        }
    }
}

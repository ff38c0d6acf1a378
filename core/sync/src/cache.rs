//! Bounded TTL cache with LRU eviction.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// A cached read result.
#[derive(Debug, Clone)]
pub struct CacheEntry<V> {
    pub key: String,
    pub value: V,
    pub expires_at: Instant,
    /// Logical access time; strictly increasing across the store.
    last_access: u64,
}

impl<V> CacheEntry<V> {
    fn is_expired(&self, now: Instant) -> bool {
        now > self.expires_at
    }
}

/// Snapshot of cache counters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CacheStats {
    pub size: usize,
    pub capacity: usize,
    /// Entries past their expiry that no read or sweep has purged yet.
    pub expired: usize,
    pub hits: u64,
    pub misses: u64,
    /// `hits / (hits + misses)`, or 0 when nothing was read yet.
    pub hit_rate: f64,
}

struct CacheInner<V> {
    entries: HashMap<String, CacheEntry<V>>,
    /// Access tick -> key, oldest first.
    lru: BTreeMap<u64, String>,
    tick: u64,
    hits: u64,
    misses: u64,
}

impl<V> CacheInner<V> {
    fn next_tick(&mut self) -> u64 {
        self.tick += 1;
        self.tick
    }

    fn purge(&mut self, key: &str) -> Option<CacheEntry<V>> {
        let entry = self.entries.remove(key)?;
        self.lru.remove(&entry.last_access);
        Some(entry)
    }

    fn touch(&mut self, key: &str) {
        let tick = self.next_tick();
        if let Some(entry) = self.entries.get_mut(key) {
            self.lru.remove(&entry.last_access);
            entry.last_access = tick;
            self.lru.insert(tick, key.to_string());
        }
    }
}

/// Bounded key/value cache with per-entry TTL and LRU eviction.
///
/// Recency is tracked with a logical clock bumped on every access, so no two
/// entries ever share an access time and eviction order is deterministic
/// (a never-read entry keeps its insertion tick). Expiry uses the tokio
/// monotonic clock for every operation.
pub struct CacheStore<V> {
    capacity: usize,
    inner: Mutex<CacheInner<V>>,
}

impl<V: Clone> CacheStore<V> {
    /// Create a cache holding at most `capacity` entries (minimum 1).
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            inner: Mutex::new(CacheInner {
                entries: HashMap::new(),
                lru: BTreeMap::new(),
                tick: 0,
                hits: 0,
                misses: 0,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, CacheInner<V>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Get an unexpired value, refreshing its recency.
    ///
    /// Expired entries are purged and counted as misses.
    pub fn get(&self, key: &str) -> Option<V> {
        let now = Instant::now();
        let mut inner = self.lock();

        let expired = match inner.entries.get(key) {
            None => {
                inner.misses += 1;
                return None;
            }
            Some(entry) => entry.is_expired(now),
        };

        if expired {
            inner.purge(key);
            inner.misses += 1;
            return None;
        }

        inner.hits += 1;
        inner.touch(key);
        inner.entries.get(key).map(|e| e.value.clone())
    }

    /// Insert or replace an entry expiring `ttl_secs` seconds from now.
    ///
    /// Evicts least-recently-used entries until the store is within capacity.
    pub fn put(&self, key: impl Into<String>, value: V, ttl_secs: u64) {
        let key = key.into();
        let expires_at = Instant::now() + Duration::from_secs(ttl_secs);
        let mut inner = self.lock();

        inner.purge(&key);
        let tick = inner.next_tick();
        inner.lru.insert(tick, key.clone());
        inner.entries.insert(
            key.clone(),
            CacheEntry {
                key,
                value,
                expires_at,
                last_access: tick,
            },
        );

        while inner.entries.len() > self.capacity {
            let Some((_, victim)) = inner.lru.pop_first() else {
                break;
            };
            inner.entries.remove(&victim);
            debug!("Evicted cache entry {}", victim);
        }
    }

    /// Remove an entry, returning whether it was present.
    pub fn remove(&self, key: &str) -> bool {
        self.lock().purge(key).is_some()
    }

    /// Drop every entry. Counters are kept.
    pub fn clear(&self) {
        let mut inner = self.lock();
        inner.entries.clear();
        inner.lru.clear();
    }

    /// Check for an unexpired entry without touching recency or counters.
    pub fn contains(&self, key: &str) -> bool {
        let now = Instant::now();
        let mut inner = self.lock();
        match inner.entries.get(key) {
            Some(entry) if entry.is_expired(now) => {
                inner.purge(key);
                false
            }
            Some(_) => true,
            None => false,
        }
    }

    /// Current number of stored entries, expired or not.
    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    /// Check whether the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.lock().entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Snapshot of size and counters.
    pub fn stats(&self) -> CacheStats {
        let now = Instant::now();
        let inner = self.lock();
        let lookups = inner.hits + inner.misses;
        CacheStats {
            size: inner.entries.len(),
            capacity: self.capacity,
            expired: inner.entries.values().filter(|e| e.is_expired(now)).count(),
            hits: inner.hits,
            misses: inner.misses,
            hit_rate: if lookups == 0 {
                0.0
            } else {
                inner.hits as f64 / lookups as f64
            },
        }
    }

    /// Purge every expired entry, returning how many were removed.
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let mut inner = self.lock();
        let expired: Vec<String> = inner
            .entries
            .values()
            .filter(|e| e.is_expired(now))
            .map(|e| e.key.clone())
            .collect();

        for key in &expired {
            inner.purge(key);
        }
        expired.len()
    }
}

impl<V: Clone + Send + 'static> CacheStore<V> {
    /// Run `sweep` every `every` until `cancel` fires.
    pub fn spawn_sweeper(self: &Arc<Self>, every: Duration, cancel: CancellationToken) -> JoinHandle<()> {
        let cache = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = interval(every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let purged = cache.sweep();
                        if purged > 0 {
                            debug!("Cache sweep purged {} entries", purged);
                        }
                    }
                }
            }
        })
    }
}

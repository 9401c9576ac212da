use std::{
    collections::{BTreeMap, HashMap},
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use tracing::debug;

use crate::{clients::clock::Clock, models::health::CacheStats};

#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub ttl_seconds: u64,
    pub capacity: usize,
}

struct CacheEntry<V> {
    data: V,
    timestamp: DateTime<Utc>,
    seq: u64,
}

struct CacheInner<V> {
    entries: HashMap<String, CacheEntry<V>>,
    /// Insertion sequence -> key; the first entry is the oldest.
    order: BTreeMap<u64, String>,
    next_seq: u64,
}

impl<V> CacheInner<V> {
    fn remove(&mut self, key: &str) -> bool {
        match self.entries.remove(key) {
            Some(entry) => {
                self.order.remove(&entry.seq);
                true
            }
            None => false,
        }
    }
}

/// Bounded TTL memo.
///
/// Expired entries are dropped lazily on lookup (or by [`TtlCache::sweep_expired`]).
/// At capacity the oldest insertion is evicted, regardless of how recently it
/// was read.
pub struct TtlCache<V> {
    name: String,
    config: CacheConfig,
    clock: Arc<dyn Clock>,
    inner: Mutex<CacheInner<V>>,
    hits: AtomicU64,
    misses: AtomicU64,
    sets: AtomicU64,
    evictions: AtomicU64,
    expirations: AtomicU64,
}

impl<V: Clone> TtlCache<V> {
    pub fn new(name: impl Into<String>, config: CacheConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            name: name.into(),
            config,
            clock,
            inner: Mutex::new(CacheInner {
                entries: HashMap::new(),
                order: BTreeMap::new(),
                next_seq: 0,
            }),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            sets: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            expirations: AtomicU64::new(0),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn ttl(&self) -> Duration {
        i64::try_from(self.config.ttl_seconds)
            .ok()
            .and_then(Duration::try_seconds)
            .unwrap_or(Duration::MAX)
    }

    fn is_expired(&self, timestamp: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        now - timestamp >= self.ttl()
    }

    pub fn get(&self, key: &str) -> Option<V> {
        let now = self.clock.now();
        let mut inner = self.inner.lock();

        let expired = match inner.entries.get(key) {
            Some(entry) if !self.is_expired(entry.timestamp, now) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                return Some(entry.data.clone());
            }
            Some(_) => true,
            None => false,
        };

        if expired {
            inner.remove(key);
            self.expirations.fetch_add(1, Ordering::Relaxed);
        }
        self.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    pub fn set(&self, key: impl Into<String>, value: V) {
        if self.config.capacity == 0 {
            return;
        }

        let key = key.into();
        let now = self.clock.now();
        let mut inner = self.inner.lock();

        if !inner.remove(&key) && inner.entries.len() >= self.config.capacity {
            if let Some((_, oldest)) = inner.order.pop_first() {
                inner.entries.remove(&oldest);
                self.evictions.fetch_add(1, Ordering::Relaxed);
                debug!(cache = %self.name, key = %oldest, "Evicted oldest cache entry");
            }
        }

        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.order.insert(seq, key.clone());
        inner.entries.insert(
            key,
            CacheEntry {
                data: value,
                timestamp: now,
                seq,
            },
        );
        self.sets.fetch_add(1, Ordering::Relaxed);
    }

    pub fn invalidate(&self, key: &str) -> bool {
        self.inner.lock().remove(key)
    }

    /// Drops every entry. Returns how many there were.
    pub fn clear(&self) -> usize {
        let mut inner = self.inner.lock();
        let cleared = inner.entries.len();
        inner.entries.clear();
        inner.order.clear();
        cleared
    }

    pub fn sweep_expired(&self) -> usize {
        let now = self.clock.now();
        let mut inner = self.inner.lock();

        let expired: Vec<String> = inner
            .entries
            .iter()
            .filter(|(_, entry)| self.is_expired(entry.timestamp, now))
            .map(|(key, _)| key.clone())
            .collect();

        for key in &expired {
            inner.remove(key);
        }

        self.expirations
            .fetch_add(expired.len() as u64, Ordering::Relaxed);
        expired.len()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            sets: self.sets.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            expirations: self.expirations.load(Ordering::Relaxed),
            size: self.len(),
            capacity: self.config.capacity,
            ttl_seconds: self.config.ttl_seconds,
        }
    }
}

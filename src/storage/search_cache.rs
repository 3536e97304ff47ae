use crate::config::QueryCacheConfig;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::debug;

/// Cache hit/miss counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub entries: usize,
    pub evictions: u64,
}

struct CacheEntry<V> {
    value: V,
    inserted_at: Instant,
}

/// TTL result cache with a soft size cap.
///
/// On every insert past the cap, entries older than the TTL are swept.
/// Safe against concurrent readers and a single sweeper.
pub struct SearchCache<V> {
    entries: Mutex<HashMap<String, CacheEntry<V>>>,
    ttl: Duration,
    max_size: usize,
    enabled: bool,
    hits: std::sync::atomic::AtomicU64,
    misses: std::sync::atomic::AtomicU64,
    evictions: std::sync::atomic::AtomicU64,
}

impl<V: Clone> SearchCache<V> {
    pub fn new(config: &QueryCacheConfig) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            ttl: Duration::from_millis(config.ttl_ms),
            max_size: config.max_size,
            enabled: config.enabled,
            hits: std::sync::atomic::AtomicU64::new(0),
            misses: std::sync::atomic::AtomicU64::new(0),
            evictions: std::sync::atomic::AtomicU64::new(0),
        }
    }

    pub fn get(&self, key: &str) -> Option<V> {
        use std::sync::atomic::Ordering;
        if !self.enabled {
            return None;
        }
        let entries = self.entries.lock().expect("search cache lock poisoned");
        match entries.get(key) {
            Some(entry) if entry.inserted_at.elapsed() <= self.ttl => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(entry.value.clone())
            }
            _ => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    pub fn insert(&self, key: String, value: V) {
        use std::sync::atomic::Ordering;
        if !self.enabled {
            return;
        }
        let mut entries = self.entries.lock().expect("search cache lock poisoned");
        entries.insert(
            key,
            CacheEntry {
                value,
                inserted_at: Instant::now(),
            },
        );
        if entries.len() > self.max_size {
            let before = entries.len();
            let ttl = self.ttl;
            entries.retain(|_, entry| entry.inserted_at.elapsed() <= ttl);
            let swept = before - entries.len();
            if swept > 0 {
                self.evictions.fetch_add(swept as u64, Ordering::Relaxed);
                debug!(swept, "cache sweep dropped expired entries");
            }
        }
    }

    pub fn clear(&self) {
        self.entries
            .lock()
            .expect("search cache lock poisoned")
            .clear();
    }

    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .expect("search cache lock poisoned")
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        use std::sync::atomic::Ordering;
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            entries: self.len(),
            evictions: self.evictions.load(Ordering::Relaxed),
        }
    }
}

use std::{
    collections::HashMap,
    time::{Duration, Instant},
};

use core_model::{normalize_path, rolling_checksum};
use tracing::debug;

pub const DEFAULT_CAPACITY: usize = 50;
pub const DEFAULT_TTL: Duration = Duration::from_secs(5 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheConfig {
    pub capacity: usize,
    pub ttl: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_CAPACITY,
            ttl: DEFAULT_TTL,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub expired: u64,
    pub checksum_mismatches: u64,
    pub evictions: u64,
}

#[derive(Debug, Clone)]
struct Entry<V> {
    value: V,
    cached_at: Instant,
    last_accessed_at: Instant,
    access_count: u64,
    source_len: usize,
    source_checksum: u64,
}

impl<V> Entry<V> {
    fn matches(&self, bytes: &[u8]) -> bool {
        self.source_len == bytes.len() && self.source_checksum == rolling_checksum(bytes)
    }
}

/// Bounded, TTL-limited cache of parsed records keyed by normalized path.
/// Entries remember a cheap checksum of the bytes they were parsed from so a
/// changed file is detected on lookup. Never authoritative.
#[derive(Debug, Clone)]
pub struct ReadCache<V> {
    config: CacheConfig,
    entries: HashMap<String, Entry<V>>,
    stats: CacheStats,
}

impl<V: Clone> Default for ReadCache<V> {
    fn default() -> Self {
        Self::new(CacheConfig::default())
    }
}

impl<V: Clone> ReadCache<V> {
    pub fn new(config: CacheConfig) -> Self {
        Self {
            config,
            entries: HashMap::new(),
            stats: CacheStats::default(),
        }
    }

    pub fn config(&self) -> CacheConfig {
        self.config
    }

    /// Looks up `path`. When `current` is given, a cached value parsed from
    /// different bytes is evicted and reported as a miss.
    pub fn get(&mut self, path: &str, current: Option<&[u8]>) -> Option<V> {
        let key = normalize_path(path);
        let now = Instant::now();
        let Some(entry) = self.entries.get_mut(&key) else {
            self.stats.misses += 1;
            return None;
        };
        if now.duration_since(entry.cached_at) >= self.config.ttl {
            self.entries.remove(&key);
            self.stats.misses += 1;
            self.stats.expired += 1;
            debug!(path = %key, "cache entry expired");
            return None;
        }
        if let Some(bytes) = current
            && !entry.matches(bytes)
        {
            self.entries.remove(&key);
            self.stats.misses += 1;
            self.stats.checksum_mismatches += 1;
            debug!(path = %key, "cache entry stale against source");
            return None;
        }
        entry.last_accessed_at = now;
        entry.access_count += 1;
        self.stats.hits += 1;
        Some(entry.value.clone())
    }

    /// Caches `value` parsed from `source`, then drops expired entries and
    /// evicts least-recently-accessed ones down to capacity.
    pub fn set(&mut self, path: &str, value: V, source: &[u8]) {
        let key = normalize_path(path);
        let now = Instant::now();
        self.entries.insert(
            key,
            Entry {
                value,
                cached_at: now,
                last_accessed_at: now,
                access_count: 0,
                source_len: source.len(),
                source_checksum: rolling_checksum(source),
            },
        );
        self.purge_expired(now);
        while self.entries.len() > self.config.capacity {
            let oldest = self
                .entries
                .iter()
                .min_by(|(ka, a), (kb, b)| {
                    a.last_accessed_at
                        .cmp(&b.last_accessed_at)
                        .then_with(|| a.access_count.cmp(&b.access_count))
                        .then_with(|| ka.cmp(kb))
                })
                .map(|(k, _)| k.clone());
            let Some(oldest) = oldest else {
                break;
            };
            self.entries.remove(&oldest);
            self.stats.evictions += 1;
        }
    }

    fn purge_expired(&mut self, now: Instant) {
        let ttl = self.config.ttl;
        let before = self.entries.len();
        self.entries
            .retain(|_, e| now.duration_since(e.cached_at) < ttl);
        self.stats.expired += (before - self.entries.len()) as u64;
    }

    pub fn invalidate(&mut self, path: &str) -> bool {
        self.entries.remove(&normalize_path(path)).is_some()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, path: &str) -> bool {
        self.entries.contains_key(&normalize_path(path))
    }

    /// How often `path` has been served from the cache since it was set.
    pub fn access_count(&self, path: &str) -> Option<u64> {
        self.entries
            .get(&normalize_path(path))
            .map(|e| e.access_count)
    }

    pub fn stats(&self) -> CacheStats {
        self.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread::sleep;

    fn small(capacity: usize, ttl: Duration) -> ReadCache<String> {
        ReadCache::new(CacheConfig { capacity, ttl })
    }

    #[test]
    fn hit_after_set() {
        let mut cache = ReadCache::default();
        cache.set("/h/1.json", "one".to_string(), b"bytes");
        assert_eq!(cache.get("/h/1.json", None).as_deref(), Some("one"));
        assert_eq!(cache.get("/h/1.json", Some(b"bytes")).as_deref(), Some("one"));
        assert_eq!(cache.access_count("/h/1.json"), Some(2));
        assert_eq!(cache.stats().hits, 2);
    }

    #[test]
    fn miss_when_absent() {
        let mut cache: ReadCache<String> = ReadCache::default();
        assert!(cache.get("/h/1.json", None).is_none());
        assert_eq!(cache.stats().misses, 1);
    }

    #[test]
    fn different_bytes_is_a_miss_and_evicts() {
        let mut cache = ReadCache::default();
        cache.set("/h/1.json", "one".to_string(), b"bytes");
        assert!(cache.get("/h/1.json", Some(b"bytez")).is_none());
        assert!(!cache.contains("/h/1.json"));
        assert_eq!(cache.stats().checksum_mismatches, 1);

        cache.set("/h/1.json", "one".to_string(), b"bytes");
        assert!(cache.get("/h/1.json", Some(b"bytes!")).is_none());
    }

    #[test]
    fn keys_are_normalized() {
        let mut cache = ReadCache::default();
        cache.set("/h/./x/../1.json", "one".to_string(), b"b");
        assert_eq!(cache.get("/h/1.json", None).as_deref(), Some("one"));
        assert!(cache.invalidate("\\h\\1.json"));
        assert!(cache.is_empty());
    }

    #[test]
    fn expired_entry_is_a_miss() {
        let mut cache = small(10, Duration::from_millis(20));
        cache.set("a", "a".to_string(), b"a");
        sleep(Duration::from_millis(40));
        assert!(cache.get("a", None).is_none());
        assert_eq!(cache.stats().expired, 1);
        assert!(cache.is_empty());
    }

    #[test]
    fn set_purges_expired_entries() {
        let mut cache = small(10, Duration::from_millis(20));
        cache.set("a", "a".to_string(), b"a");
        sleep(Duration::from_millis(40));
        cache.set("b", "b".to_string(), b"b");
        assert_eq!(cache.len(), 1);
        assert!(cache.contains("b"));
    }

    #[test]
    fn evicts_least_recently_accessed() {
        let mut cache = small(2, DEFAULT_TTL);
        cache.set("a", "a".to_string(), b"a");
        sleep(Duration::from_millis(2));
        cache.set("b", "b".to_string(), b"b");
        sleep(Duration::from_millis(2));
        assert!(cache.get("a", None).is_some());
        sleep(Duration::from_millis(2));
        cache.set("c", "c".to_string(), b"c");
        assert_eq!(cache.len(), 2);
        assert!(cache.contains("a"));
        assert!(!cache.contains("b"));
        assert!(cache.contains("c"));
        assert_eq!(cache.stats().evictions, 1);
    }

    #[test]
    fn clear_empties() {
        let mut cache = ReadCache::default();
        cache.set("a", 1u32, b"a");
        cache.set("b", 2u32, b"b");
        cache.clear();
        assert_eq!(cache.len(), 0);
    }
}

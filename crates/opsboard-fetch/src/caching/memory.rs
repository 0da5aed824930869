use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use super::CacheKey;

/// A cached value and its expiry bookkeeping.
#[derive(Clone, Debug)]
struct Slot<T> {
    value: T,
    stored_at: Instant,
    ttl: Duration,
}

impl<T> Slot<T> {
    fn is_expired(&self, now: Instant) -> bool {
        now.duration_since(self.stored_at) >= self.ttl
    }
}

#[derive(Debug)]
struct Inner<T> {
    entries: HashMap<CacheKey, Slot<T>>,
    /// Live keys ordered least- to most-recently touched.
    ///
    /// Invariant: holds exactly the keys of `entries`, each once.
    order: VecDeque<CacheKey>,
}

/// A bounded in-memory cache with per-entry TTL and LRU eviction.
///
/// Both reads and writes count as a "touch" for eviction order. Expired
/// entries are treated as absent by [`get`](Self::get) but are only removed
/// by [`purge_expired`](Self::purge_expired) (the sweeper), by a later
/// [`set`](Self::set) on the same key, or by invalidation; a read never
/// mutates the entry map.
///
/// Touching is a linear scan of the order queue, which is fine for the
/// capacities this engine runs with (around 100 entries).
#[derive(Debug)]
pub struct MemoryCache<T> {
    inner: Arc<Mutex<Inner<T>>>,
    capacity: usize,
}

impl<T> Clone for MemoryCache<T> {
    fn clone(&self) -> Self {
        // https://github.com/rust-lang/rust/issues/26925
        MemoryCache {
            inner: Arc::clone(&self.inner),
            capacity: self.capacity,
        }
    }
}

impl<T: Clone> MemoryCache<T> {
    pub fn new(capacity: usize) -> Self {
        MemoryCache {
            inner: Arc::new(Mutex::new(Inner {
                entries: HashMap::with_capacity(capacity),
                order: VecDeque::with_capacity(capacity),
            })),
            capacity,
        }
    }

    /// Looks up a fresh value, refreshing its position in the LRU order.
    ///
    /// Returns `None` for unknown keys and for entries whose TTL has
    /// elapsed. A stale entry is left in place and does not have its order
    /// refreshed.
    pub fn get(&self, key: &CacheKey) -> Option<T> {
        let mut inner = self.inner.lock().unwrap();
        let slot = inner.entries.get(key)?;
        if slot.is_expired(Instant::now()) {
            return None;
        }

        let value = slot.value.clone();
        touch(&mut inner.order, key);
        Some(value)
    }

    /// Stores a value under the given key with the given TTL.
    ///
    /// An existing entry is overwritten and its order refreshed. Otherwise,
    /// at capacity, the least-recently-touched entry is evicted first.
    pub fn set(&self, key: CacheKey, value: T, ttl: Duration) {
        let mut inner = self.inner.lock().unwrap();
        let slot = Slot {
            value,
            stored_at: Instant::now(),
            ttl,
        };

        if inner.entries.insert(key.clone(), slot).is_some() {
            touch(&mut inner.order, &key);
            return;
        }

        if inner.entries.len() > self.capacity {
            if let Some(oldest) = inner.order.pop_front() {
                tracing::trace!("Evicting cache entry {oldest}");
                inner.entries.remove(&oldest);
                metric!(counter("cache.evicted") += 1);
            }
        }
        inner.order.push_back(key);
    }

    /// Removes entries, returning how many were dropped.
    ///
    /// With no prefix the whole cache is cleared. With a prefix, every key
    /// starting with it is removed by a linear scan and all other entries
    /// are untouched.
    pub fn invalidate(&self, prefix: Option<&str>) -> usize {
        let mut inner = self.inner.lock().unwrap();
        match prefix {
            None => {
                let removed = inner.entries.len();
                inner.entries.clear();
                inner.order.clear();
                removed
            }
            Some(prefix) => {
                let before = inner.entries.len();
                inner.entries.retain(|key, _| !key.as_str().starts_with(prefix));
                let entries = std::mem::take(&mut inner.entries);
                inner.order.retain(|key| entries.contains_key(key));
                inner.entries = entries;
                before - inner.entries.len()
            }
        }
    }

    /// Removes all expired entries, returning how many were dropped.
    pub fn purge_expired(&self) -> usize {
        let mut inner = self.inner.lock().unwrap();
        let now = Instant::now();
        let before = inner.entries.len();
        inner.entries.retain(|_, slot| !slot.is_expired(now));
        let entries = std::mem::take(&mut inner.entries);
        inner.order.retain(|key| entries.contains_key(key));
        inner.entries = entries;
        before - inner.entries.len()
    }

    /// The number of entries currently held, expired ones included.
    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Moves `key` to the most-recently-touched end of the order queue.
fn touch(order: &mut VecDeque<CacheKey>, key: &CacheKey) {
    if let Some(pos) = order.iter().position(|k| k == key) {
        if let Some(key) = order.remove(pos) {
            order.push_back(key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(raw: &str) -> CacheKey {
        CacheKey::custom(raw)
    }

    const TTL: Duration = Duration::from_secs(60);

    #[test]
    fn test_lru_eviction_order() {
        let cache = MemoryCache::new(3);
        cache.set(key("a"), 1, TTL);
        cache.set(key("b"), 2, TTL);
        cache.set(key("c"), 3, TTL);

        // Touching "a" makes "b" the least recently used entry.
        assert_eq!(cache.get(&key("a")), Some(1));
        cache.set(key("d"), 4, TTL);

        assert_eq!(cache.len(), 3);
        assert_eq!(cache.get(&key("b")), None);
        assert_eq!(cache.get(&key("a")), Some(1));
        assert_eq!(cache.get(&key("c")), Some(3));
        assert_eq!(cache.get(&key("d")), Some(4));
    }

    #[test]
    fn test_set_refreshes_existing_key() {
        let cache = MemoryCache::new(2);
        cache.set(key("a"), 1, TTL);
        cache.set(key("b"), 2, TTL);
        cache.set(key("a"), 10, TTL);

        // "b" is now the oldest entry and gets evicted.
        cache.set(key("c"), 3, TTL);

        assert_eq!(cache.get(&key("a")), Some(10));
        assert_eq!(cache.get(&key("b")), None);
        assert_eq!(cache.get(&key("c")), Some(3));
    }

    #[test]
    fn test_expired_entry_is_absent_but_not_removed() {
        let cache = MemoryCache::new(3);
        cache.set(key("a"), 1, Duration::from_millis(5));
        std::thread::sleep(Duration::from_millis(20));

        assert_eq!(cache.get(&key("a")), None);
        // Removal is deferred to the sweeper or the next set.
        assert_eq!(cache.len(), 1);

        cache.set(key("a"), 2, TTL);
        assert_eq!(cache.get(&key("a")), Some(2));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_invalidate_prefix() {
        let cache = MemoryCache::new(10);
        cache.set(key("users:1"), 1, TTL);
        cache.set(key("users:2"), 2, TTL);
        cache.set(key("projects:1"), 3, TTL);

        assert_eq!(cache.invalidate(Some("users:")), 2);
        assert_eq!(cache.get(&key("users:1")), None);
        assert_eq!(cache.get(&key("users:2")), None);
        assert_eq!(cache.get(&key("projects:1")), Some(3));
    }

    #[test]
    fn test_invalidate_all() {
        let cache = MemoryCache::new(10);
        cache.set(key("users:1"), 1, TTL);
        cache.set(key("projects:1"), 2, TTL);

        assert_eq!(cache.invalidate(None), 2);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_purge_expired() {
        let cache = MemoryCache::new(10);
        cache.set(key("short"), 1, Duration::from_millis(5));
        cache.set(key("long"), 2, TTL);
        std::thread::sleep(Duration::from_millis(20));

        assert_eq!(cache.purge_expired(), 1);
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get(&key("long")), Some(2));
    }
}

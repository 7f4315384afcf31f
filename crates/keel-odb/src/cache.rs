//! Bounded object cache with LRU eviction.
//!
//! Reads take the shared lock only: recency is tracked through per-entry
//! atomics fed by a global clock, so concurrent readers never serialize on
//! each other. Insertion takes the exclusive lock and evicts the stalest
//! entry when at capacity.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

struct Slot<V> {
    value: Arc<V>,
    last_used: AtomicU64,
}

/// A capacity-bounded LRU map.
pub struct LruCache<K, V> {
    slots: RwLock<HashMap<K, Slot<V>>>,
    clock: AtomicU64,
    capacity: usize,
}

impl<K: Eq + Hash + Clone, V> LruCache<K, V> {
    /// Create a cache holding at most `capacity` entries. A zero capacity
    /// disables caching entirely.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: RwLock::new(HashMap::new()),
            clock: AtomicU64::new(0),
            capacity,
        }
    }

    /// Fetch a value, refreshing its recency.
    #[must_use]
    pub fn get(&self, key: &K) -> Option<Arc<V>> {
        let slots = self.slots.read().unwrap_or_else(std::sync::PoisonError::into_inner);
        let slot = slots.get(key)?;
        slot.last_used
            .store(self.clock.fetch_add(1, Ordering::Relaxed), Ordering::Relaxed);
        Some(Arc::clone(&slot.value))
    }

    /// Insert a value, evicting the least-recently-used entry if full.
    pub fn insert(&self, key: K, value: Arc<V>) {
        if self.capacity == 0 {
            return;
        }
        let mut slots = self.slots.write().unwrap_or_else(std::sync::PoisonError::into_inner);
        if slots.len() >= self.capacity && !slots.contains_key(&key) {
            let stalest = slots
                .iter()
                .min_by_key(|(_, slot)| slot.last_used.load(Ordering::Relaxed))
                .map(|(k, _)| k.clone());
            if let Some(stale_key) = stalest {
                slots.remove(&stale_key);
            }
        }
        let slot = Slot {
            value,
            last_used: AtomicU64::new(self.clock.fetch_add(1, Ordering::Relaxed)),
        };
        slots.insert(key, slot);
    }

    /// Drop every entry.
    pub fn clear(&self) {
        self.slots
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clear();
    }

    /// Current entry count.
    #[must_use]
    pub fn len(&self) -> usize {
        self.slots
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .len()
    }

    /// `true` if nothing is cached.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<K, V> std::fmt::Debug for LruCache<K, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LruCache").field("capacity", &self.capacity).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn get_returns_inserted_value() {
        let cache = LruCache::new(4);
        cache.insert("a", Arc::new(1));
        assert_eq!(cache.get(&"a").as_deref(), Some(&1));
        assert_eq!(cache.get(&"b"), None);
    }

    #[test]
    fn eviction_prefers_the_stalest_entry() {
        let cache = LruCache::new(2);
        cache.insert("a", Arc::new(1));
        cache.insert("b", Arc::new(2));
        // Touch "a" so "b" is the eviction candidate.
        let _ = cache.get(&"a");
        cache.insert("c", Arc::new(3));
        assert!(cache.get(&"a").is_some());
        assert!(cache.get(&"b").is_none());
        assert!(cache.get(&"c").is_some());
    }

    #[test]
    fn zero_capacity_disables_caching() {
        let cache = LruCache::new(0);
        cache.insert("a", Arc::new(1));
        assert!(cache.get(&"a").is_none());
    }

    #[test]
    fn reinserting_existing_key_does_not_evict() {
        let cache = LruCache::new(2);
        cache.insert("a", Arc::new(1));
        cache.insert("b", Arc::new(2));
        cache.insert("a", Arc::new(10));
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.get(&"a").as_deref(), Some(&10));
        assert_eq!(cache.get(&"b").as_deref(), Some(&2));
    }
}

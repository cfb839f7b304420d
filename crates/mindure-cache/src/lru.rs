use crate::traits::{CacheStats, VerdictEntry, VerdictPolicy};
use ahash::AHashMap;
use std::collections::BTreeMap;
use std::time::{Duration, Instant};

/// LRU (Least Recently Used) bounded verdict store.
///
/// Each access stamps the entry with a monotonically increasing tick; the
/// `order` index maps ticks back to keys so the least recently used entry is
/// always the first one in the tree.
pub struct LruStore {
    map: AHashMap<String, (VerdictEntry, u64)>,
    order: BTreeMap<u64, String>,
    tick: u64,
    capacity: usize,
    hits: u64,
    misses: u64,
    evictions: u64,
}

impl LruStore {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "cache capacity must be > 0");
        Self {
            map: AHashMap::with_capacity(capacity),
            order: BTreeMap::new(),
            tick: 0,
            capacity,
            hits: 0,
            misses: 0,
            evictions: 0,
        }
    }

    fn next_tick(&mut self) -> u64 {
        self.tick += 1;
        self.tick
    }

    fn evict_lru(&mut self) {
        if let Some((_, key)) = self.order.pop_first() {
            self.map.remove(&key);
            self.evictions += 1;
        }
    }
}

impl VerdictPolicy for LruStore {
    fn get(&mut self, key: &str, now: Instant, ttl: Duration) -> Option<VerdictEntry> {
        let Some(&(entry, stamp)) = self.map.get(key) else {
            self.misses += 1;
            return None;
        };

        if entry.is_expired(now, ttl) {
            self.misses += 1;
            self.map.remove(key);
            self.order.remove(&stamp);
            return None;
        }

        self.hits += 1;
        // Promote to most recently used
        let tick = self.next_tick();
        self.order.remove(&stamp);
        self.order.insert(tick, key.to_string());
        if let Some(slot) = self.map.get_mut(key) {
            slot.1 = tick;
        }
        Some(entry)
    }

    fn peek(&self, key: &str) -> Option<VerdictEntry> {
        self.map.get(key).map(|(entry, _)| *entry)
    }

    fn insert(&mut self, key: String, entry: VerdictEntry) {
        if let Some((_, stamp)) = self.map.remove(&key) {
            self.order.remove(&stamp);
        }

        while self.map.len() >= self.capacity {
            self.evict_lru();
        }

        let tick = self.next_tick();
        self.order.insert(tick, key.clone());
        self.map.insert(key, (entry, tick));
    }

    fn remove(&mut self, key: &str) -> bool {
        match self.map.remove(key) {
            Some((_, stamp)) => {
                self.order.remove(&stamp);
                true
            }
            None => false,
        }
    }

    fn clear(&mut self) {
        self.map.clear();
        self.order.clear();
    }

    fn len(&self) -> usize {
        self.map.len()
    }

    fn capacity(&self) -> Option<usize> {
        Some(self.capacity)
    }

    fn name(&self) -> &'static str {
        "LRU"
    }

    fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits,
            misses: self.misses,
            evictions: self.evictions,
            invalidations: 0,
            current_size: self.map.len(),
        }
    }
}

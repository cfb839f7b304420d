use crate::traits::{CacheStats, VerdictEntry, VerdictPolicy};
use ahash::AHashMap;
use std::time::{Duration, Instant};

/// Plain map with no size bound. Growth is limited only by how many distinct
/// pages one browsing session visits.
#[derive(Default)]
pub struct UnboundedStore {
    map: AHashMap<String, VerdictEntry>,
    hits: u64,
    misses: u64,
}

impl UnboundedStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl VerdictPolicy for UnboundedStore {
    fn get(&mut self, key: &str, now: Instant, ttl: Duration) -> Option<VerdictEntry> {
        match self.map.get(key) {
            Some(entry) if entry.is_expired(now, ttl) => {
                self.misses += 1;
                self.map.remove(key);
                None
            }
            Some(entry) => {
                self.hits += 1;
                Some(*entry)
            }
            None => {
                self.misses += 1;
                None
            }
        }
    }

    fn peek(&self, key: &str) -> Option<VerdictEntry> {
        self.map.get(key).copied()
    }

    fn insert(&mut self, key: String, entry: VerdictEntry) {
        self.map.insert(key, entry);
    }

    fn remove(&mut self, key: &str) -> bool {
        self.map.remove(key).is_some()
    }

    fn clear(&mut self) {
        self.map.clear();
    }

    fn len(&self) -> usize {
        self.map.len()
    }

    fn capacity(&self) -> Option<usize> {
        None
    }

    fn name(&self) -> &'static str {
        "unbounded"
    }

    fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits,
            misses: self.misses,
            evictions: 0,
            invalidations: 0,
            current_size: self.map.len(),
        }
    }
}

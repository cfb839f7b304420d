use std::time::{Duration, Instant};

/// A memoized classification. `verdict == true` means the page was judged
/// educational and is allowed.
///
/// Entries are never mutated after insertion, only replaced or removed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct VerdictEntry {
    pub verdict: bool,
    pub computed_at: Instant,
}

impl VerdictEntry {
    pub fn new(verdict: bool, computed_at: Instant) -> Self {
        Self {
            verdict,
            computed_at,
        }
    }

    /// An entry is live while `now - computed_at < ttl`.
    #[inline]
    pub fn is_expired(&self, now: Instant, ttl: Duration) -> bool {
        now.saturating_duration_since(self.computed_at) >= ttl
    }
}

/// Snapshot of cache statistics.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub invalidations: u64,
    pub current_size: usize,
}

/// Storage behind the decision cache.
///
/// Implementations: unbounded map, LRU.
/// All methods take `&mut self`; locking is done by [`crate::DecisionCache`].
pub trait VerdictPolicy: Send {
    /// Look up a key. Expired entries are purged and reported as a miss.
    fn get(&mut self, key: &str, now: Instant, ttl: Duration) -> Option<VerdictEntry>;

    /// Read an entry without touching recency or hit statistics.
    fn peek(&self, key: &str) -> Option<VerdictEntry>;

    /// Insert an entry, replacing any existing one for the key.
    fn insert(&mut self, key: String, entry: VerdictEntry);

    /// Remove a key explicitly.
    fn remove(&mut self, key: &str) -> bool;

    /// Drop every entry. Statistics are kept.
    fn clear(&mut self);

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Maximum number of entries, if bounded.
    fn capacity(&self) -> Option<usize>;

    /// Human-readable name of the storage policy.
    fn name(&self) -> &'static str;

    fn stats(&self) -> CacheStats;
}

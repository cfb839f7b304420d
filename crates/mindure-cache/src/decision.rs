use crate::clock::{Clock, SystemClock};
use crate::lru::LruStore;
use crate::traits::{CacheStats, VerdictEntry, VerdictPolicy};
use crate::unbounded::UnboundedStore;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Verdicts older than this are treated as absent.
pub const DEFAULT_TTL: Duration = Duration::from_secs(60 * 60);

#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("unknown cache policy: {0} (expected 'unbounded' or 'lru')")]
    UnknownPolicy(String),
    #[error("cache policy 'lru' requires a capacity > 0")]
    ZeroCapacity,
}

/// Type-erased storage policy.
enum PolicyInner {
    Unbounded(UnboundedStore),
    Lru(LruStore),
}

impl PolicyInner {
    fn as_policy(&self) -> &dyn VerdictPolicy {
        match self {
            PolicyInner::Unbounded(p) => p,
            PolicyInner::Lru(p) => p,
        }
    }

    fn as_policy_mut(&mut self) -> &mut dyn VerdictPolicy {
        match self {
            PolicyInner::Unbounded(p) => p,
            PolicyInner::Lru(p) => p,
        }
    }
}

fn build_policy(policy: &str, capacity: usize) -> Result<PolicyInner, CacheError> {
    match policy {
        "unbounded" => Ok(PolicyInner::Unbounded(UnboundedStore::new())),
        "lru" if capacity == 0 => Err(CacheError::ZeroCapacity),
        "lru" => Ok(PolicyInner::Lru(LruStore::new(capacity))),
        other => Err(CacheError::UnknownPolicy(other.to_string())),
    }
}

/// Thread-safe map from page identity to a previously computed verdict.
///
/// `get` never returns an entry whose age has reached the TTL. Entries are
/// only ever replaced wholesale by `put` or dropped by one of the
/// invalidation calls.
pub struct DecisionCache {
    inner: Mutex<PolicyInner>,
    clock: Arc<dyn Clock>,
    ttl_ms: AtomicU64,
    invalidations: AtomicU64,
}

impl DecisionCache {
    /// Build a cache with the named storage policy (`"unbounded"` or `"lru"`).
    /// `capacity` is ignored by the unbounded policy.
    pub fn new(
        policy: &str,
        capacity: usize,
        ttl: Duration,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, CacheError> {
        let inner = build_policy(policy, capacity)?;

        tracing::info!(
            policy = inner.as_policy().name(),
            capacity = ?inner.as_policy().capacity(),
            ttl_secs = ttl.as_secs(),
            "decision cache initialized"
        );

        Ok(Self {
            inner: Mutex::new(inner),
            clock,
            ttl_ms: AtomicU64::new(ttl.as_millis() as u64),
            invalidations: AtomicU64::new(0),
        })
    }

    /// Unbounded cache with the one hour TTL on the system clock.
    pub fn with_defaults() -> Self {
        Self {
            inner: Mutex::new(PolicyInner::Unbounded(UnboundedStore::new())),
            clock: Arc::new(SystemClock),
            ttl_ms: AtomicU64::new(DEFAULT_TTL.as_millis() as u64),
            invalidations: AtomicU64::new(0),
        }
    }

    pub fn ttl(&self) -> Duration {
        Duration::from_millis(self.ttl_ms.load(Ordering::Relaxed))
    }

    /// Change the TTL in place. Existing entries are judged against the new
    /// value from the next lookup on.
    pub fn set_ttl(&self, ttl: Duration) {
        self.ttl_ms.store(ttl.as_millis() as u64, Ordering::Relaxed);
    }

    /// Returns the entry only if it is younger than the TTL.
    pub fn get(&self, key: &str) -> Option<VerdictEntry> {
        let now = self.clock.now();
        let ttl = self.ttl();
        self.inner.lock().as_policy_mut().get(key, now, ttl)
    }

    /// Store `verdict` computed now, overwriting any existing entry.
    pub fn put(&self, key: &str, verdict: bool) {
        let entry = VerdictEntry::new(verdict, self.clock.now());
        self.inner
            .lock()
            .as_policy_mut()
            .insert(key.to_string(), entry);
    }

    /// Remove the entry unconditionally.
    pub fn invalidate(&self, key: &str) -> bool {
        let removed = self.inner.lock().as_policy_mut().remove(key);
        if removed {
            self.invalidations.fetch_add(1, Ordering::Relaxed);
        }
        removed
    }

    /// Remove the entry only if it is live and says "block". Returns whether
    /// a blocked entry was dropped.
    pub fn invalidate_if_blocked(&self, key: &str) -> bool {
        let now = self.clock.now();
        let ttl = self.ttl();
        let mut inner = self.inner.lock();
        let policy = inner.as_policy_mut();

        match policy.peek(key) {
            Some(entry) if entry.is_expired(now, ttl) => {
                // Dead either way; purge without counting it as an invalidation.
                policy.remove(key);
                false
            }
            Some(entry) if !entry.verdict => {
                policy.remove(key);
                self.invalidations.fetch_add(1, Ordering::Relaxed);
                true
            }
            _ => false,
        }
    }

    pub fn clear(&self) {
        self.inner.lock().as_policy_mut().clear();
    }

    pub fn len(&self) -> usize {
        self.inner.lock().as_policy().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Name of the underlying storage policy.
    pub fn name(&self) -> &'static str {
        self.inner.lock().as_policy().name()
    }

    pub fn capacity(&self) -> Option<usize> {
        self.inner.lock().as_policy().capacity()
    }

    pub fn stats(&self) -> CacheStats {
        let mut stats = self.inner.lock().as_policy().stats();
        stats.invalidations = self.invalidations.load(Ordering::Relaxed);
        stats
    }
}

impl Default for DecisionCache {
    fn default() -> Self {
        Self::with_defaults()
    }
}

//! Verdict cache for page classifications.
//!
//! Entries are keyed by an opaque page identity string and expire after a
//! configurable TTL measured against an injectable [`Clock`]. Storage is
//! pluggable: an unbounded map for a single browsing session, or an LRU
//! bound when memory needs a ceiling.

pub mod clock;
pub mod decision;
pub mod lru;
pub mod traits;
pub mod unbounded;

pub use clock::{Clock, ManualClock, SystemClock};
pub use decision::{CacheError, DecisionCache, DEFAULT_TTL};
pub use traits::{CacheStats, VerdictEntry, VerdictPolicy};

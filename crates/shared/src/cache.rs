//! In-process TTL cache.
//!
//! One instance per query kind, each with its own fixed TTL. Entries expire
//! individually and are dropped lazily by the read that discovers them; there
//! is no background sweep. The store is unbounded: the key space is small and
//! enumerable in practice (one key per distinct market/coin/chart query), so
//! growth is bounded by the set of queries callers actually make.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use tokio::time::Instant;

/// Outcome of [`TtlCache::lookup`], distinguishing expired entries from
/// absent ones.
#[derive(Debug, Clone, PartialEq)]
pub enum Lookup<V> {
    /// Entry present and within its TTL.
    Hit(V),
    /// Entry was present but past its TTL. The entry has been evicted; the
    /// value is handed back exactly once as a fallback candidate.
    Stale(V),
    /// No entry for the key.
    Miss,
}

struct Entry<V> {
    value: V,
    expires_at: Instant,
}

/// Expiring key-value store held in process memory.
///
/// Values must be `Clone` since reads hand out copies while the entry stays
/// in the map. The handlers run on a multi-threaded runtime, so the map is
/// guarded by a `Mutex`; all operations are synchronous and hold the lock
/// only for the map access itself.
pub struct TtlCache<V> {
    ttl: Duration,
    entries: Mutex<HashMap<String, Entry<V>>>,
}

impl<V: Clone> TtlCache<V> {
    /// Creates an empty cache whose entries all expire `ttl` after insertion.
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Returns the live value for `key`, or `None` when the key is absent or
    /// expired. An expired entry is evicted during the call.
    pub fn get(&self, key: &str) -> Option<V> {
        match self.lookup(key) {
            Lookup::Hit(value) => Some(value),
            Lookup::Stale(_) | Lookup::Miss => None,
        }
    }

    /// Reads `key`, distinguishing live, expired, and absent entries.
    ///
    /// An expired entry is removed by this call and its value returned as
    /// [`Lookup::Stale`] so the caller can offer it to the fetcher as a
    /// fallback. The eviction makes the candidate one-shot: looking the key
    /// up again yields [`Lookup::Miss`].
    pub fn lookup(&self, key: &str) -> Lookup<V> {
        let mut entries = self.entries.lock().unwrap();
        match entries.get(key) {
            Some(entry) if Instant::now() < entry.expires_at => {
                Lookup::Hit(entry.value.clone())
            }
            Some(_) => match entries.remove(key) {
                Some(entry) => Lookup::Stale(entry.value),
                None => Lookup::Miss,
            },
            None => Lookup::Miss,
        }
    }

    /// Stores `value` under `key`, replacing any existing entry and stamping
    /// a fresh expiry of now + TTL.
    pub fn set(&self, key: impl Into<String>, value: V) {
        let entry = Entry {
            value,
            expires_at: Instant::now() + self.ttl,
        };
        self.entries.lock().unwrap().insert(key.into(), entry);
    }

    /// Number of entries currently held, including any not yet evicted.
    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    /// True when the cache holds no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.lock().unwrap().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use tokio::time::{self, Duration};

    use super::*;

    #[tokio::test(start_paused = true)]
    async fn get_returns_value_before_ttl_elapses() {
        let cache = TtlCache::new(Duration::from_secs(10));
        cache.set("markets:usd:1:50", 42u64);

        assert_eq!(cache.get("markets:usd:1:50"), Some(42));

        time::advance(Duration::from_secs(9)).await;
        assert_eq!(cache.get("markets:usd:1:50"), Some(42));
    }

    #[tokio::test(start_paused = true)]
    async fn get_returns_none_after_ttl_elapses() {
        let cache = TtlCache::new(Duration::from_secs(10));
        cache.set("coin:bitcoin", "payload".to_string());

        time::advance(Duration::from_secs(10)).await;
        assert_eq!(cache.get("coin:bitcoin"), None);
    }

    #[tokio::test(start_paused = true)]
    async fn expired_entry_is_evicted_on_read() {
        let cache = TtlCache::new(Duration::from_secs(5));
        cache.set("k", 1u64);
        assert_eq!(cache.len(), 1);

        time::advance(Duration::from_secs(6)).await;
        assert_eq!(cache.get("k"), None);
        assert!(cache.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn lookup_yields_stale_value_exactly_once() {
        let cache = TtlCache::new(Duration::from_secs(10));
        cache.set("chart:bitcoin:usd:7", 7u64);

        time::advance(Duration::from_secs(11)).await;
        assert_eq!(cache.lookup("chart:bitcoin:usd:7"), Lookup::Stale(7));
        assert_eq!(cache.lookup("chart:bitcoin:usd:7"), Lookup::Miss);
    }

    #[tokio::test(start_paused = true)]
    async fn lookup_distinguishes_hit_from_miss() {
        let cache = TtlCache::new(Duration::from_secs(10));
        cache.set("present", 1u64);

        assert_eq!(cache.lookup("present"), Lookup::Hit(1));
        assert_eq!(cache.lookup("never-set"), Lookup::Miss);
    }

    #[tokio::test(start_paused = true)]
    async fn set_overwrites_and_refreshes_expiry() {
        let cache = TtlCache::new(Duration::from_secs(10));
        cache.set("k", 1u64);

        time::advance(Duration::from_secs(8)).await;
        cache.set("k", 2u64);

        // the original stamp would have expired here; the rewrite reset it
        time::advance(Duration::from_secs(8)).await;
        assert_eq!(cache.get("k"), Some(2));

        time::advance(Duration::from_secs(2)).await;
        assert_eq!(cache.get("k"), None);
    }
}

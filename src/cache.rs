//! Time-bounded LRU containers.
//!
//! [`TimedLru`] is the one container behind both the duplicate filter
//! (fingerprints of messages already forwarded) and the opportunistic
//! content cache (payloads observed transiting this node). Entries are
//! bounded two ways: capacity evicts in insertion order through the
//! underlying LRU, and a TTL drops entries lazily whenever they are
//! touched. Re-inserting a key refreshes its freshness.

use std::hash::Hash;
use std::num::NonZeroUsize;

use lru::LruCache;
use tokio::time::{Duration, Instant};

/// Capacity-and-time bounded map. Expiry is lazy: expired entries are
/// removed when probed or when they reach the LRU tail, never by a
/// background task.
pub struct TimedLru<K: Hash + Eq + Clone, V> {
    entries: LruCache<K, (Instant, V)>,
    ttl: Duration,
}

impl<K: Hash + Eq + Clone, V> TimedLru<K, V> {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        Self {
            entries: LruCache::new(
                NonZeroUsize::new(capacity).expect("cache capacity must be non-zero"),
            ),
            ttl,
        }
    }

    /// True if `key` is present and fresh.
    pub fn check(&mut self, key: &K) -> bool {
        self.purge_tail();
        match self.entries.peek(key) {
            Some((inserted, _)) if inserted.elapsed() <= self.ttl => true,
            Some(_) => {
                self.entries.pop(key);
                false
            }
            None => false,
        }
    }

    /// Insert or refresh an entry.
    pub fn add(&mut self, key: K, value: V) {
        self.purge_tail();
        self.entries.put(key, (Instant::now(), value));
    }

    /// Fetch a fresh entry, promoting it in the LRU order.
    pub fn get(&mut self, key: &K) -> Option<&V> {
        self.purge_tail();
        match self.entries.peek(key) {
            Some((inserted, _)) if inserted.elapsed() <= self.ttl => {}
            Some(_) => {
                self.entries.pop(key);
                return None;
            }
            None => return None,
        }
        self.entries.get(key).map(|(_, value)| value)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop expired entries from the cold end of the LRU order.
    fn purge_tail(&mut self) {
        while let Some((_, (inserted, _))) = self.entries.peek_lru() {
            if inserted.elapsed() > self.ttl {
                self.entries.pop_lru();
            } else {
                break;
            }
        }
    }
}

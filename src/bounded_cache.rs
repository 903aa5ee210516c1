//! Bounded key cache with TTL and max-size eviction.
//!
//! The pipeline remembers recently confirmed jobs so a job that is enqueued
//! twice (resumed after restart and replayed, or re-detected after an offset
//! rewind) is not submitted again. The store's status check remains the
//! source of truth; this cache only saves the round trip.
//!
//! Each entry is the key plus an `Instant`; 10k job keys stay well under 1 MB.

use std::collections::HashMap;
use std::hash::Hash;
use std::time::Duration;

use tokio::time::Instant;

pub const DEFAULT_CONFIRMED_CACHE_SIZE: usize = 10_000;
pub const DEFAULT_CONFIRMED_CACHE_TTL_SECS: u64 = 86_400; // 24 hours

/// Set of keys with TTL and capacity limits.
///
/// - **Max capacity:** when full, the oldest entry is evicted on insert.
/// - **TTL:** expired entries are dropped on insert and ignored on lookup.
pub struct BoundedKeyCache<K> {
    map: HashMap<K, Instant>,
    max_size: usize,
    ttl: Duration,
}

impl<K: Hash + Eq + Clone> BoundedKeyCache<K> {
    pub fn new(max_size: usize, ttl_secs: u64) -> Self {
        Self {
            map: HashMap::new(),
            max_size: max_size.max(1),
            ttl: Duration::from_secs(ttl_secs),
        }
    }

    pub fn contains(&self, key: &K) -> bool {
        self.map.get(key).is_some_and(|&t| t.elapsed() < self.ttl)
    }

    pub fn insert(&mut self, key: K) {
        let now = Instant::now();
        self.map.retain(|_, &mut t| now.duration_since(t) < self.ttl);
        while self.map.len() >= self.max_size {
            let oldest = self
                .map
                .iter()
                .min_by_key(|(_, t)| **t)
                .map(|(k, _)| k.clone());
            match oldest {
                Some(k) => {
                    self.map.remove(&k);
                }
                None => break,
            }
        }
        self.map.insert(key, now);
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

impl<K: Hash + Eq + Clone> Default for BoundedKeyCache<K> {
    fn default() -> Self {
        Self::new(DEFAULT_CONFIRMED_CACHE_SIZE, DEFAULT_CONFIRMED_CACHE_TTL_SECS)
    }
}

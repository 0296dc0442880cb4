//! Generic bounded TTL cache
//!
//! A capacity-limited map with per-entry absolute expiry behind a single
//! internal lock. Used for retaining scoring breakdowns for the explain
//! endpoint and for coalescing duplicate `log` envelopes. Deliberately
//! independent of the suggestion cascade.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Mutex;
use std::time::{Duration, Instant};

struct Entry<V> {
    value: V,
    expires_at: Instant,
    inserted_at: Instant,
}

/// Bounded map with TTL eviction. Capacity overflow evicts the oldest
/// entry by insertion time; expired entries are dropped lazily on access
/// and during insert.
pub struct TtlCache<K, V> {
    inner: Mutex<HashMap<K, Entry<V>>>,
    capacity: usize,
    ttl: Duration,
}

impl<K: Eq + Hash + Clone, V: Clone> TtlCache<K, V> {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
            capacity: capacity.max(1),
            ttl,
        }
    }

    /// Insert a value with the default TTL.
    pub fn insert(&self, key: K, value: V) {
        let now = Instant::now();
        let mut map = self.inner.lock().unwrap_or_else(|e| e.into_inner());

        map.retain(|_, entry| entry.expires_at > now);

        if map.len() >= self.capacity && !map.contains_key(&key) {
            // evict the entry closest to expiry
            if let Some(oldest) = map
                .iter()
                .min_by_key(|(_, entry)| entry.inserted_at)
                .map(|(k, _)| k.clone())
            {
                map.remove(&oldest);
            }
        }

        map.insert(
            key,
            Entry {
                value,
                expires_at: now + self.ttl,
                inserted_at: now,
            },
        );
    }

    /// Fetch a clone of a live entry.
    pub fn get(&self, key: &K) -> Option<V> {
        let now = Instant::now();
        let mut map = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        match map.get(key) {
            Some(entry) if entry.expires_at > now => Some(entry.value.clone()),
            Some(_) => {
                map.remove(key);
                None
            }
            None => None,
        }
    }

    /// Mutate a live entry in place. Returns whether the entry existed.
    pub fn update<F: FnOnce(&mut V)>(&self, key: &K, f: F) -> bool {
        let now = Instant::now();
        let mut map = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        match map.get_mut(key) {
            Some(entry) if entry.expires_at > now => {
                f(&mut entry.value);
                true
            }
            Some(_) => {
                map.remove(key);
                false
            }
            None => false,
        }
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        let now = Instant::now();
        let map = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        map.values().filter(|e| e.expires_at > now).count()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

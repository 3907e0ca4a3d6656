//! Local value store served to STORE and FIND_VALUE requests.
//!
//! Bounded by an [`LruCache`]: once full, the least recently used value is
//! dropped to make room. Every value carries an expiry; expired values are
//! never served and are swept by [`LocalStore::expire`].

use std::num::NonZeroUsize;
use std::time::Duration;

use lru::LruCache;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::config::MAX_VALUE_SIZE;
use crate::identity::Identifier;

#[derive(Debug, Clone)]
struct StoredEntry {
    value: Vec<u8>,
    expires_at: Instant,
    stored_by: Identifier,
}

#[derive(Debug)]
pub struct LocalStore {
    cache: LruCache<Identifier, StoredEntry>,
    ttl: Duration,
}

impl LocalStore {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            cache: LruCache::new(capacity),
            ttl,
        }
    }

    /// Store `value` under `key`, replacing any previous value. Returns false
    /// when the value is rejected for its size.
    pub fn store(&mut self, key: Identifier, value: Vec<u8>, stored_by: Identifier) -> bool {
        if value.len() > MAX_VALUE_SIZE {
            warn!(
                size = value.len(),
                limit = MAX_VALUE_SIZE,
                peer = %stored_by,
                "rejecting oversized value"
            );
            return false;
        }
        let entry = StoredEntry {
            value,
            expires_at: Instant::now() + self.ttl,
            stored_by,
        };
        if let Some((evicted, _)) = self.cache.push(key, entry) {
            if evicted != key {
                debug!(key = %evicted, "store at capacity, evicted least recently used value");
            }
        }
        true
    }

    /// The value stored under `key`, unless it expired.
    pub fn get(&mut self, key: &Identifier) -> Option<Vec<u8>> {
        let now = Instant::now();
        match self.cache.get(key) {
            Some(entry) if now < entry.expires_at => return Some(entry.value.clone()),
            Some(_) => {}
            None => return None,
        }
        self.cache.pop(key);
        None
    }

    /// Drop every expired value. Returns how many were removed.
    pub fn expire(&mut self) -> usize {
        let now = Instant::now();
        let expired: Vec<Identifier> = self
            .cache
            .iter()
            .filter(|(_, entry)| now >= entry.expires_at)
            .map(|(key, _)| *key)
            .collect();
        for key in &expired {
            if let Some(entry) = self.cache.pop(key) {
                debug!(key = %key, stored_by = %entry.stored_by, "value expired");
            }
        }
        expired.len()
    }

    pub fn len(&self) -> usize {
        self.cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(b: u8) -> Identifier {
        Identifier::from_bytes([b; 20])
    }

    #[tokio::test(start_paused = true)]
    async fn store_and_retrieve() {
        let mut store = LocalStore::new(8, Duration::from_secs(60));
        assert!(store.store(key(1), b"value".to_vec(), key(9)));
        assert_eq!(store.get(&key(1)), Some(b"value".to_vec()));
        assert_eq!(store.get(&key(2)), None);
    }

    #[tokio::test(start_paused = true)]
    async fn rejects_oversized_value() {
        let mut store = LocalStore::new(8, Duration::from_secs(60));
        assert!(!store.store(key(1), vec![0; MAX_VALUE_SIZE + 1], key(9)));
        assert!(store.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn newer_value_replaces_older() {
        let mut store = LocalStore::new(8, Duration::from_secs(60));
        store.store(key(1), b"old".to_vec(), key(9));
        store.store(key(1), b"new".to_vec(), key(9));
        assert_eq!(store.len(), 1);
        assert_eq!(store.get(&key(1)), Some(b"new".to_vec()));
    }

    #[tokio::test(start_paused = true)]
    async fn capacity_evicts_least_recently_used() {
        let mut store = LocalStore::new(2, Duration::from_secs(60));
        store.store(key(1), vec![1], key(9));
        store.store(key(2), vec![2], key(9));
        store.get(&key(1));
        store.store(key(3), vec![3], key(9));
        assert_eq!(store.get(&key(2)), None);
        assert!(store.get(&key(1)).is_some());
        assert!(store.get(&key(3)).is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn expired_values_are_not_served_and_are_swept() {
        let mut store = LocalStore::new(8, Duration::from_secs(10));
        store.store(key(1), vec![1], key(9));
        tokio::time::advance(Duration::from_secs(5)).await;
        store.store(key(2), vec![2], key(9));
        tokio::time::advance(Duration::from_secs(6)).await;

        assert_eq!(store.get(&key(1)), None);
        assert_eq!(store.expire(), 0);
        assert_eq!(store.len(), 1);

        tokio::time::advance(Duration::from_secs(5)).await;
        assert_eq!(store.expire(), 1);
        assert!(store.is_empty());
    }
}

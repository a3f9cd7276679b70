//! Response cache for coalescing equivalent RPC calls.
//!
//! Keyed by a structural fingerprint of (message, routing key). A call
//! opts into caching by supplying a TTL; without one, neither reads nor
//! writes happen for that call.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::message::Response;

/// Bounded cache of RPC responses with per-read TTL checks and
/// least-recent-write eviction.
#[derive(Debug)]
pub struct ResponseCache {
    /// `std::sync::Mutex` (not tokio) — never held across an `.await`.
    inner: Mutex<Inner>,
}

#[derive(Debug)]
struct Inner {
    map: HashMap<u64, CacheEntry>,
    capacity: usize,
    write_seq: u64,
}

#[derive(Debug)]
struct CacheEntry {
    response: Response,
    stored_at: Instant,
    write_seq: u64,
}

impl ResponseCache {
    /// Creates a cache holding at most `capacity` entries.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                map: HashMap::new(),
                capacity,
                write_seq: 0,
            }),
        }
    }

    /// Returns the cached response for `key` when it is younger than
    /// `ttl`. A stale entry is evicted on the spot.
    #[must_use]
    pub fn get(&self, key: u64, ttl: Duration) -> Option<Response> {
        let mut inner = self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        match inner.map.get(&key) {
            Some(entry) if entry.stored_at.elapsed() < ttl => Some(entry.response.clone()),
            Some(_) => {
                inner.map.remove(&key);
                None
            }
            None => None,
        }
    }

    /// Stores a response. A `None` key means the caller did not opt into
    /// caching and the write is skipped.
    pub fn set(&self, key: Option<u64>, response: Response) {
        let Some(key) = key else { return };
        let mut inner = self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        if inner.capacity == 0 {
            return;
        }
        while inner.map.len() >= inner.capacity && !inner.map.contains_key(&key) {
            let oldest = inner
                .map
                .iter()
                .min_by_key(|(_, entry)| entry.write_seq)
                .map(|(k, _)| *k);
            match oldest {
                Some(k) => inner.map.remove(&k),
                None => break,
            };
        }
        inner.write_seq += 1;
        let write_seq = inner.write_seq;
        inner.map.insert(
            key,
            CacheEntry {
                response,
                stored_at: Instant::now(),
                write_seq,
            },
        );
    }

    /// Number of live entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .map
            .len()
    }

    /// Whether the cache holds no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Computes the cache fingerprint of a call.
///
/// The message hash is structural: `serde_json` maps are key-sorted, so
/// two objects with the same fields in different insertion order hash
/// identically. The routing key hash is folded in with XOR so the same
/// message sent to two routes occupies two slots.
#[must_use]
pub fn fingerprint(message: &Value, routing_key: &str) -> u64 {
    hash64(&serde_json::to_vec(message).unwrap_or_default()) ^ hash64(routing_key.as_bytes())
}

/// First eight bytes of a SHA-256 digest as a big-endian integer.
fn hash64(bytes: &[u8]) -> u64 {
    let digest = Sha256::digest(bytes);
    let mut prefix = [0_u8; 8];
    prefix.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(prefix)
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn response(data: Value) -> Response {
        Response {
            headers: std::collections::BTreeMap::new(),
            data,
        }
    }

    #[test]
    fn fingerprint_is_stable_and_key_order_independent() {
        let a: Value = serde_json::from_str(r#"{"x": 1, "y": 2}"#).unwrap();
        let b: Value = serde_json::from_str(r#"{"y": 2, "x": 1}"#).unwrap();
        assert_eq!(fingerprint(&a, "sum"), fingerprint(&b, "sum"));
    }

    #[test]
    fn fingerprint_differs_per_routing_key_and_message() {
        let message = json!({"x": 1});
        assert_ne!(fingerprint(&message, "sum"), fingerprint(&message, "mul"));
        assert_ne!(
            fingerprint(&json!({"x": 1}), "sum"),
            fingerprint(&json!({"x": 2}), "sum")
        );
    }

    #[test]
    fn live_entries_are_served_within_ttl() {
        let cache = ResponseCache::new(8);
        let key = fingerprint(&json!({"x": 1}), "sum");
        cache.set(Some(key), response(json!(3)));
        let hit = cache.get(key, Duration::from_secs(5)).unwrap();
        assert_eq!(hit.data, json!(3));
    }

    #[test]
    fn stale_entries_are_evicted_on_read() {
        let cache = ResponseCache::new(8);
        let key = fingerprint(&json!({"x": 1}), "sum");
        cache.set(Some(key), response(json!(3)));
        std::thread::sleep(Duration::from_millis(5));
        assert!(cache.get(key, Duration::from_millis(1)).is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn absent_key_skips_the_write() {
        let cache = ResponseCache::new(8);
        cache.set(None, response(json!(1)));
        assert!(cache.is_empty());
    }

    #[test]
    fn eviction_drops_the_least_recent_write() {
        let cache = ResponseCache::new(2);
        cache.set(Some(1), response(json!("first")));
        cache.set(Some(2), response(json!("second")));
        cache.set(Some(3), response(json!("third")));
        assert_eq!(cache.len(), 2);
        assert!(cache.get(1, Duration::from_secs(60)).is_none());
        assert!(cache.get(3, Duration::from_secs(60)).is_some());
    }

    #[test]
    fn rewriting_a_key_refreshes_its_write_slot() {
        let cache = ResponseCache::new(2);
        cache.set(Some(1), response(json!("first")));
        cache.set(Some(2), response(json!("second")));
        cache.set(Some(1), response(json!("updated")));
        cache.set(Some(3), response(json!("third")));
        assert!(cache.get(2, Duration::from_secs(60)).is_none());
        assert_eq!(
            cache.get(1, Duration::from_secs(60)).unwrap().data,
            json!("updated")
        );
    }
}

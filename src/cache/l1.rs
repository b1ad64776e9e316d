//! The bounded, process-local first tier of the cache.

use std::time::Instant;

use bytes::Bytes;
use lru::LruCache;
use parking_lot::Mutex;

/// A single L1 entry: the cached body, its content type, and the absolute
/// instant at which it stops being fresh.
#[derive(Debug, Clone)]
pub struct L1Entry {
    /// The cached response body.
    pub body: Bytes,
    /// The response's `Content-Type`, if any.
    pub content_type: Option<String>,
    /// The instant after which this entry is expired and should be treated
    /// as a miss rather than served.
    pub absolute_expiry: Instant,
}

/// An in-process, size-bounded cache fronting the shared L2 store.
///
/// Capacity eviction is least-recently-used, matching the `cacheout`
/// maxsize behavior this tier stands in for. All access goes through a
/// single [`parking_lot::Mutex`]; callers must never hold the guard across
/// an `.await` point, since L1 operations are synchronous and cheap.
pub struct L1Cache {
    inner: Mutex<LruCache<String, L1Entry>>,
}

impl L1Cache {
    /// Creates an L1 cache bounded to `maxsize` entries.
    pub fn new(maxsize: usize) -> Self {
        let cap = std::num::NonZeroUsize::new(maxsize.max(1)).expect("maxsize.max(1) is nonzero");
        Self {
            inner: Mutex::new(LruCache::new(cap)),
        }
    }

    /// Returns a fresh entry for `key`, or `None` if absent or expired.
    ///
    /// An expired entry found during the lookup is evicted immediately
    /// rather than left to be overwritten later.
    pub fn get(&self, key: &str) -> Option<L1Entry> {
        let mut guard = self.inner.lock();
        match guard.peek(key) {
            Some(entry) if entry.absolute_expiry > Instant::now() => guard.get(key).cloned(),
            Some(_) => {
                guard.pop(key);
                None
            }
            None => None,
        }
    }

    /// Inserts or replaces the entry for `key`.
    pub fn set(&self, key: String, entry: L1Entry) {
        self.inner.lock().put(key, entry);
    }

    /// Removes the entry for `key`, if present.
    pub fn remove(&self, key: &str) {
        self.inner.lock().pop(key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn entry(expiry: Instant) -> L1Entry {
        L1Entry {
            body: Bytes::from_static(b"hello"),
            content_type: Some("text/plain".to_string()),
            absolute_expiry: expiry,
        }
    }

    #[test]
    fn fresh_entry_is_returned() {
        let cache = L1Cache::new(10);
        cache.set("a".to_string(), entry(Instant::now() + Duration::from_secs(60)));
        assert!(cache.get("a").is_some());
    }

    #[test]
    fn expired_entry_is_evicted_on_read() {
        let cache = L1Cache::new(10);
        cache.set("a".to_string(), entry(Instant::now() - Duration::from_secs(1)));
        assert!(cache.get("a").is_none());
        assert!(cache.get("a").is_none());
    }

    #[test]
    fn capacity_evicts_least_recently_used() {
        let cache = L1Cache::new(2);
        let fresh = Instant::now() + Duration::from_secs(60);
        cache.set("a".to_string(), entry(fresh));
        cache.set("b".to_string(), entry(fresh));
        cache.set("c".to_string(), entry(fresh));
        assert!(cache.get("a").is_none());
        assert!(cache.get("b").is_some());
        assert!(cache.get("c").is_some());
    }
}

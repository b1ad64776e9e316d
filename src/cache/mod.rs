//! The two-tier cache: a bounded process-local L1 in front of a shared
//! Redis L2, plus the singleflight locks the pipeline uses to prevent
//! cache stampedes.
//!
//! [`TwoTierCache::get`] checks L1 first, then L2; an L2 hit repopulates L1
//! with whatever TTL remains so subsequent requests on the same process
//! avoid the network round trip entirely. [`TwoTierCache::set`] writes
//! through both tiers. Locking is L2-only: a singleflight lock only needs
//! to be visible across processes, not within one.

mod l1;
mod l2;

use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;

use crate::error::CacheError;

pub use l1::L1Entry;
pub use l2::{L2Cache, L2Store, L2Value};

impl From<HitLayer> for crate::metrics::CacheLayer {
    fn from(layer: HitLayer) -> Self {
        match layer {
            HitLayer::L1 => crate::metrics::CacheLayer::L1,
            HitLayer::L2 => crate::metrics::CacheLayer::L2,
        }
    }
}

/// Which tier served a [`CacheHit`], so callers can attribute hit metrics
/// to the tier that actually answered the lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HitLayer {
    /// Served from the in-process L1 cache.
    L1,
    /// Served from the shared L2 cache (fresh or stale slot).
    L2,
}

/// The result of a cache lookup.
pub struct CacheHit {
    /// The cached body.
    pub body: Bytes,
    /// The cached `Content-Type`, if any.
    pub content_type: Option<String>,
    /// Whether this value is past its fresh TTL and should be treated as
    /// stale (served while a refresh runs in the background, per
    /// stale-while-revalidate).
    pub is_stale: bool,
    /// Which tier answered the lookup.
    pub layer: HitLayer,
}

/// A guard representing ownership of a singleflight lock.
///
/// Dropping this without calling [`TwoTierCache::release_lock`] leaves the
/// lock to expire on its own timeout; callers should always release
/// explicitly on every exit path of the critical section, since the
/// release itself is async and cannot happen in a `Drop` impl.
pub struct LockToken {
    /// The Redis key the lock was acquired under.
    pub key: String,
    /// The unique token that must match for release to succeed.
    pub token: String,
}

/// The two-tier cache shared across all request tasks.
///
/// `l2` is an `Arc<dyn L2Store>` rather than the concrete Redis type so
/// tests can swap in an in-memory double and exercise the exact same
/// `TwoTierCache`/pipeline code the production Redis path runs.
pub struct TwoTierCache {
    l1: l1::L1Cache,
    l2: Arc<dyn L2Store>,
    stale_ttl_offset: i64,
}

impl TwoTierCache {
    /// Builds the cache from its two tiers.
    pub fn new(l1_maxsize: usize, l2: Arc<dyn L2Store>, stale_ttl_offset: i64) -> Self {
        Self {
            l1: l1::L1Cache::new(l1_maxsize),
            l2,
            stale_ttl_offset,
        }
    }

    /// Connects to Redis and builds the cache around it.
    pub async fn connect(
        redis_url: &str,
        l1_maxsize: usize,
        stale_ttl_offset: i64,
    ) -> Result<Self, CacheError> {
        let l2 = L2Cache::connect(redis_url).await?;
        Ok(Self::new(l1_maxsize, Arc::new(l2), stale_ttl_offset))
    }

    /// Looks up `key`, checking L1 before L2.
    ///
    /// An L2 hit that is still fresh repopulates L1 with the remaining TTL
    /// (or one second, if the remainder rounds down to zero) so the next
    /// lookup on this process avoids Redis entirely.
    pub async fn get(&self, key: &str) -> Result<Option<CacheHit>, CacheError> {
        if let Some(entry) = self.l1.get(key) {
            return Ok(Some(CacheHit {
                body: entry.body,
                content_type: entry.content_type,
                is_stale: false,
                layer: HitLayer::L1,
            }));
        }

        let Some(value) = self.l2.get(key).await? else {
            return Ok(None);
        };

        if !value.is_stale {
            if let Some(remaining) = value.fresh_ttl_remaining.filter(|r| *r >= 1) {
                self.l1.set(
                    key.to_string(),
                    L1Entry {
                        body: value.body.clone(),
                        content_type: value.content_type.clone(),
                        absolute_expiry: Instant::now() + Duration::from_secs(remaining as u64),
                    },
                );
            }
        }

        Ok(Some(CacheHit {
            body: value.body,
            content_type: value.content_type,
            is_stale: value.is_stale,
            layer: HitLayer::L2,
        }))
    }

    /// Writes `body` under `key` to both tiers. A non-positive `ttl` skips
    /// the write entirely, matching the TTL calculator's "do not cache"
    /// convention.
    pub async fn set(
        &self,
        key: &str,
        body: Bytes,
        content_type: Option<&str>,
        ttl: i64,
    ) -> Result<(), CacheError> {
        if ttl <= 0 {
            return Ok(());
        }

        self.l1.set(
            key.to_string(),
            L1Entry {
                body: body.clone(),
                content_type: content_type.map(str::to_string),
                absolute_expiry: Instant::now() + Duration::from_secs(ttl as u64),
            },
        );

        self.l2
            .set(key, &body, content_type, ttl, self.stale_ttl_offset)
            .await
    }

    /// Attempts to acquire a singleflight lock for `key`.
    pub async fn acquire_lock(
        &self,
        key: &str,
        timeout: Duration,
    ) -> Result<Option<LockToken>, CacheError> {
        let lock_key = format!("lock:{key}");
        let token = self.l2.acquire_lock(&lock_key, timeout).await?;
        Ok(token.map(|token| LockToken { key: lock_key, token }))
    }

    /// Releases a lock previously returned by [`Self::acquire_lock`].
    pub async fn release_lock(&self, lock: &LockToken) -> Result<bool, CacheError> {
        self.l2.release_lock(&lock.key, &lock.token).await
    }

    /// Checks whether the L2 backend is reachable, for the `/health`
    /// endpoint.
    pub async fn ping(&self) -> bool {
        self.l2.get("__health_check_probe__").await.is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::Mutex;

    /// A minimal in-memory `L2Store`, enough to exercise
    /// `TwoTierCache`'s own orchestration logic without a real Redis
    /// server. Freshness here is driven by an explicit `stale` flag rather
    /// than wall-clock TTL bookkeeping, since that bookkeeping is
    /// `l2::L2Cache`'s job and already covered there.
    #[derive(Default)]
    struct MemoryL2 {
        fresh: Mutex<HashMap<String, (Bytes, Option<String>, bool, Option<i64>)>>,
        stale: Mutex<HashMap<String, (Bytes, Option<String>)>>,
        locks: Mutex<HashMap<String, String>>,
    }

    #[async_trait]
    impl L2Store for MemoryL2 {
        async fn get(&self, key: &str) -> Result<Option<L2Value>, CacheError> {
            if let Some((body, ct, is_stale, remaining)) = self.fresh.lock().unwrap().get(key).cloned() {
                return Ok(Some(L2Value {
                    body,
                    content_type: ct,
                    is_stale,
                    fresh_ttl_remaining: remaining,
                }));
            }
            if let Some((body, ct)) = self.stale.lock().unwrap().get(key).cloned() {
                return Ok(Some(L2Value {
                    body,
                    content_type: ct,
                    is_stale: true,
                    fresh_ttl_remaining: None,
                }));
            }
            Ok(None)
        }

        async fn set(
            &self,
            key: &str,
            body: &Bytes,
            content_type: Option<&str>,
            ttl: i64,
            stale_ttl_offset: i64,
        ) -> Result<(), CacheError> {
            if ttl <= 0 {
                return Ok(());
            }
            let ct = content_type.map(str::to_string);
            self.fresh
                .lock()
                .unwrap()
                .insert(key.to_string(), (body.clone(), ct.clone(), false, Some(ttl)));
            let _ = stale_ttl_offset;
            self.stale
                .lock()
                .unwrap()
                .insert(key.to_string(), (body.clone(), ct));
            Ok(())
        }

        async fn acquire_lock(
            &self,
            lock_key: &str,
            _timeout: Duration,
        ) -> Result<Option<String>, CacheError> {
            let mut locks = self.locks.lock().unwrap();
            if locks.contains_key(lock_key) {
                return Ok(None);
            }
            let token = format!("token-{}", locks.len());
            locks.insert(lock_key.to_string(), token.clone());
            Ok(Some(token))
        }

        async fn release_lock(&self, lock_key: &str, token: &str) -> Result<bool, CacheError> {
            let mut locks = self.locks.lock().unwrap();
            if locks.get(lock_key).map(String::as_str) == Some(token) {
                locks.remove(lock_key);
                Ok(true)
            } else {
                Ok(false)
            }
        }
    }

    fn cache() -> TwoTierCache {
        TwoTierCache::new(10, Arc::new(MemoryL2::default()), 30)
    }

    #[tokio::test]
    async fn set_then_get_is_a_fresh_l1_hit() {
        let cache = cache();
        cache
            .set("cache:/x", Bytes::from_static(b"hello"), Some("text/plain"), 30)
            .await
            .unwrap();
        let hit = cache.get("cache:/x").await.unwrap().unwrap();
        assert_eq!(hit.body, Bytes::from_static(b"hello"));
        assert!(!hit.is_stale);
        assert_eq!(hit.layer, HitLayer::L1);
    }

    #[tokio::test]
    async fn non_positive_ttl_skips_the_write() {
        let cache = cache();
        cache
            .set("cache:/x", Bytes::from_static(b"hello"), None, 0)
            .await
            .unwrap();
        assert!(cache.get("cache:/x").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn lock_round_trips_through_both_tiers() {
        let cache = cache();
        let lock = cache
            .acquire_lock("cache:/x", Duration::from_secs(10))
            .await
            .unwrap()
            .expect("lock should be free");
        assert!(cache
            .acquire_lock("cache:/x", Duration::from_secs(10))
            .await
            .unwrap()
            .is_none());
        assert!(cache.release_lock(&lock).await.unwrap());
        assert!(cache
            .acquire_lock("cache:/x", Duration::from_secs(10))
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn release_with_wrong_token_is_a_no_op() {
        let cache = cache();
        let lock = cache
            .acquire_lock("cache:/x", Duration::from_secs(10))
            .await
            .unwrap()
            .unwrap();
        let forged = LockToken {
            key: lock.key.clone(),
            token: "not-the-real-token".to_string(),
        };
        assert!(!cache.release_lock(&forged).await.unwrap());
        // The genuine holder can still release it afterward.
        assert!(cache.release_lock(&lock).await.unwrap());
    }
}

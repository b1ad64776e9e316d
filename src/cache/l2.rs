//! The shared, Redis-backed second tier of the cache.
//!
//! Every fresh write also writes a parallel `stale:<key>` entry with a
//! longer TTL, so a request arriving after the fresh entry has expired (but
//! before the stale copy has) can still be served something while a
//! revalidation runs in the background.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use deadpool_redis::{Config as PoolConfig, Pool, Runtime};
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};

use crate::error::CacheError;

const STALE_KEY_PREFIX: &str = "stale:";

/// Releases a lock only if the caller's token still matches what's stored,
/// so one holder can never release a lock it no longer owns.
const SAFE_RELEASE_LOCK_SCRIPT: &str = r#"
if redis.call("get", KEYS[1]) == ARGV[1] then
    return redis.call("del", KEYS[1])
else
    return 0
end
"#;

/// The envelope stored under the fresh key, carrying enough metadata to
/// tell whether the entry has gone stale without a separate TTL round trip.
///
/// The body travels as a plain byte array rather than base64 text; Redis
/// values are already opaque strings here, so there is no wire-format
/// reason to add an encoding step.
#[derive(Debug, Serialize, Deserialize)]
struct FreshEnvelope {
    body: Vec<u8>,
    content_type: Option<String>,
    set_time: f64,
    ttl: i64,
}

#[derive(Debug, Serialize, Deserialize)]
struct StaleEnvelope {
    body: Vec<u8>,
    content_type: Option<String>,
}

/// A fresh-or-stale value read back from L2.
pub struct L2Value {
    /// The cached body.
    pub body: Bytes,
    /// The cached `Content-Type`, if any.
    pub content_type: Option<String>,
    /// Whether this value came from the stale slot or a fresh entry past
    /// its own TTL.
    pub is_stale: bool,
    /// Seconds remaining before the fresh copy expires, when known. Used to
    /// size the L1 entry that gets populated on an L2 hit.
    pub fresh_ttl_remaining: Option<i64>,
}

/// The contract the two-tier cache needs from its shared second tier.
///
/// [`L2Cache`] is the production, Redis-backed implementation; tests
/// implement this trait directly over an in-memory map so the pipeline and
/// `TwoTierCache` logic can be exercised without a real Redis server.
#[async_trait]
pub trait L2Store: Send + Sync {
    /// Reads `key`, preferring a fresh entry and falling back to the
    /// parallel stale entry.
    async fn get(&self, key: &str) -> Result<Option<L2Value>, CacheError>;

    /// Writes `body` under `key` with `ttl` seconds of freshness, plus a
    /// parallel stale copy good for `ttl + stale_ttl_offset` seconds.
    async fn set(
        &self,
        key: &str,
        body: &Bytes,
        content_type: Option<&str>,
        ttl: i64,
        stale_ttl_offset: i64,
    ) -> Result<(), CacheError>;

    /// Attempts to acquire a singleflight lock, returning a token on
    /// success or `None` on contention.
    async fn acquire_lock(
        &self,
        lock_key: &str,
        timeout: Duration,
    ) -> Result<Option<String>, CacheError>;

    /// Atomically releases a lock iff `token` still matches the stored
    /// value.
    async fn release_lock(&self, lock_key: &str, token: &str) -> Result<bool, CacheError>;
}

/// The Redis-backed shared tier.
pub struct L2Cache {
    pool: Pool,
    release_script: redis::Script,
}

impl L2Cache {
    /// Opens a connection pool to `redis_url`, capped at 20 connections to
    /// match the proxy's historical sizing.
    pub async fn connect(redis_url: &str) -> Result<Self, CacheError> {
        let mut pool_cfg = PoolConfig::from_url(redis_url);
        pool_cfg.pool = Some(deadpool_redis::PoolConfig::new(20));
        let pool = pool_cfg
            .create_pool(Some(Runtime::Tokio1))
            .map_err(|e| CacheError::Unavailable(e.to_string()))?;

        let mut conn = pool
            .get()
            .await
            .map_err(|e| CacheError::Unavailable(e.to_string()))?;
        let _: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(|e| CacheError::Unavailable(e.to_string()))?;

        Ok(Self {
            pool,
            release_script: redis::Script::new(SAFE_RELEASE_LOCK_SCRIPT),
        })
    }

}

#[async_trait]
impl L2Store for L2Cache {
    /// Mirrors the fail-open posture of the rest of the cache: a malformed
    /// fresh entry is deleted and treated as a miss rather than propagated
    /// as an error.
    async fn get(&self, key: &str) -> Result<Option<L2Value>, CacheError> {
        let mut conn = self
            .pool
            .get()
            .await
            .map_err(|e| CacheError::Unavailable(e.to_string()))?;

        let raw: Option<String> = conn
            .get(key)
            .await
            .map_err(|e| CacheError::Unavailable(e.to_string()))?;

        if let Some(raw) = raw {
            match serde_json::from_str::<FreshEnvelope>(&raw) {
                Ok(env) => {
                    let elapsed = unix_time_now() - env.set_time;
                    let is_stale = elapsed > env.ttl as f64;
                    let remaining = (env.ttl as f64 - elapsed).max(0.0) as i64;
                    return Ok(Some(L2Value {
                        body: Bytes::from(env.body),
                        content_type: env.content_type,
                        is_stale,
                        fresh_ttl_remaining: Some(remaining),
                    }));
                }
                Err(_) => {
                    log::error!("corrupt cache entry for {key}, evicting");
                    let _: Result<(), _> = conn.del(key).await;
                    return Ok(None);
                }
            }
        }

        let stale_key = format!("{STALE_KEY_PREFIX}{key}");
        let raw_stale: Option<String> = conn
            .get(&stale_key)
            .await
            .map_err(|e| CacheError::Unavailable(e.to_string()))?;

        match raw_stale {
            Some(raw) => match serde_json::from_str::<StaleEnvelope>(&raw) {
                Ok(env) => Ok(Some(L2Value {
                    body: Bytes::from(env.body),
                    content_type: env.content_type,
                    is_stale: true,
                    fresh_ttl_remaining: None,
                })),
                Err(_) => {
                    log::error!("corrupt stale entry for {key}, evicting");
                    let _: Result<(), _> = conn.del(&stale_key).await;
                    Ok(None)
                }
            },
            None => Ok(None),
        }
    }

    /// Writes `body` under `key` with `ttl` seconds of freshness, plus a
    /// parallel stale copy that lives `ttl + stale_ttl_offset` seconds. A
    /// non-positive `ttl` is a silent no-op, matching the convention that a
    /// rule can opt a response out of caching by returning TTL `<= 0`.
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
        let mut conn = self
            .pool
            .get()
            .await
            .map_err(|e| CacheError::Unavailable(e.to_string()))?;

        let fresh = FreshEnvelope {
            body: body.to_vec(),
            content_type: content_type.map(str::to_string),
            set_time: unix_time_now(),
            ttl,
        };
        let fresh_json =
            serde_json::to_string(&fresh).map_err(|e| CacheError::Corrupt(e.to_string()))?;
        let _: () = conn
            .set_ex(key, fresh_json, ttl as u64)
            .await
            .map_err(|e| CacheError::Unavailable(e.to_string()))?;

        let stale = StaleEnvelope {
            body: body.to_vec(),
            content_type: content_type.map(str::to_string),
        };
        let stale_json =
            serde_json::to_string(&stale).map_err(|e| CacheError::Corrupt(e.to_string()))?;
        let stale_key = format!("{STALE_KEY_PREFIX}{key}");
        let stale_ttl = (ttl + stale_ttl_offset).max(1) as u64;
        let _: () = conn
            .set_ex(stale_key, stale_json, stale_ttl)
            .await
            .map_err(|e| CacheError::Unavailable(e.to_string()))?;

        Ok(())
    }

    /// Attempts to acquire a singleflight lock, returning a token on
    /// success or `None` if another holder already has it.
    async fn acquire_lock(
        &self,
        lock_key: &str,
        timeout: Duration,
    ) -> Result<Option<String>, CacheError> {
        let mut conn = self
            .pool
            .get()
            .await
            .map_err(|e| CacheError::Unavailable(e.to_string()))?;
        let token = uuid::Uuid::new_v4().to_string();

        let reply: Option<String> = redis::cmd("SET")
            .arg(lock_key)
            .arg(&token)
            .arg("NX")
            .arg("EX")
            .arg(timeout.as_secs().max(1))
            .query_async(&mut conn)
            .await
            .map_err(|e| CacheError::Lock(e.to_string()))?;

        Ok(reply.map(|_| token))
    }

    /// Releases a lock previously returned by [`Self::acquire_lock`],
    /// doing nothing if `token` no longer matches the stored value (it was
    /// already released, or has expired and been re-acquired by another
    /// holder).
    async fn release_lock(&self, lock_key: &str, token: &str) -> Result<bool, CacheError> {
        let mut conn = self
            .pool
            .get()
            .await
            .map_err(|e| CacheError::Unavailable(e.to_string()))?;
        let result: i64 = self
            .release_script
            .key(lock_key)
            .arg(token)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| CacheError::Lock(e.to_string()))?;
        Ok(result == 1)
    }
}

fn unix_time_now() -> f64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

//! Application settings loaded from the environment.
//!
//! Mirrors the distilled system's `pydantic-settings`-based `Settings`: every
//! field has a sensible default, a `.env` file is loaded (if present) before
//! the process environment is read, and structured fields (lists, maps) are
//! accepted as JSON-encoded strings — the same convention `pydantic-settings`
//! uses for complex env-var values.

use std::collections::HashMap;
use std::env;
use std::net::SocketAddr;
use std::time::Duration;

use serde::Deserialize;

use crate::error::StartupError;

/// One entry of the path-pattern TTL rule list.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct PathTtlRule {
    /// The path pattern, e.g. `"/static/*"` or a `fnmatch`-style glob.
    pub pattern: String,
    /// The TTL, in seconds, to use when this rule matches.
    pub ttl: i64,
}

/// All configurable parameters for the proxy.
///
/// Loaded once at startup by [`Config::from_env`] and then shared
/// read-only (wrapped in an `Arc`) for the lifetime of the process — nothing
/// in the pipeline re-reads the environment per request.
#[derive(Debug, Clone)]
pub struct Config {
    /// URL for connecting to the Redis server backing L2.
    pub redis_url: String,
    /// Base URL of the origin service requests are forwarded to.
    pub origin_url: String,
    /// Default TTL, in seconds, used when no more specific rule applies.
    pub cache_default_ttl: i64,
    /// Maximum number of entries kept in the L1 in-process cache.
    pub l1_cache_maxsize: usize,
    /// Paths for which caching is bypassed entirely.
    pub cache_skip_paths: Vec<String>,
    /// TTL overrides keyed by response `Content-Type`.
    pub ttl_by_content_type: HashMap<String, i64>,
    /// Ordered TTL overrides keyed by path pattern.
    pub ttl_by_path_pattern: Vec<PathTtlRule>,
    /// TTL overrides keyed by response status code.
    pub ttl_by_status_code: HashMap<u16, i64>,
    /// Additional seconds a stale copy is kept available after its TTL
    /// expires, to support stale-while-revalidate.
    pub stale_ttl_offset: i64,
    /// Consecutive origin failures before the circuit breaker trips open.
    pub circuit_breaker_failure_threshold: u32,
    /// Seconds the breaker stays open before allowing a trial request.
    pub circuit_breaker_recovery_timeout: u64,
    /// Address the HTTP listener binds to.
    pub bind_addr: SocketAddr,
    /// Per-request deadline applied to the origin fetch.
    pub request_timeout: Duration,
}

/// Helper for decoding JSON-shaped environment variables, matching
/// `pydantic-settings`'s convention for `List`/`Dict`-typed fields.
#[derive(Deserialize)]
struct RawPathTtlRule {
    pattern: String,
    ttl: serde_json::Value,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            redis_url: "redis://localhost:6379".to_string(),
            origin_url: "http://origin:8080".to_string(),
            cache_default_ttl: 30,
            l1_cache_maxsize: 1000,
            cache_skip_paths: vec![
                "/favicon.ico".to_string(),
                "/health".to_string(),
                "/metrics".to_string(),
            ],
            ttl_by_content_type: HashMap::from([
                ("application/json".to_string(), 30),
                ("image/png".to_string(), 300),
                ("text/html".to_string(), 60),
            ]),
            ttl_by_path_pattern: vec![
                PathTtlRule { pattern: "/health".to_string(), ttl: 5 },
                PathTtlRule { pattern: "/static/*".to_string(), ttl: 600 },
            ],
            ttl_by_status_code: HashMap::from([
                (200, 5),
                (404, 10),
                (500, 0),
            ]),
            stale_ttl_offset: 30,
            circuit_breaker_failure_threshold: 3,
            circuit_breaker_recovery_timeout: 30,
            bind_addr: "0.0.0.0:8000".parse().expect("valid default bind_addr"),
            request_timeout: Duration::from_secs(5),
        }
    }
}

impl Config {
    /// Loads settings from `.env` (if present) and the process environment,
    /// falling back to [`Config::default`] for anything unset.
    pub fn from_env() -> Result<Self, StartupError> {
        // Mirrors `pydantic-settings`'s `env_file=".env"`: loaded best-effort,
        // a missing file is not an error.
        let _ = dotenvy::dotenv();

        let mut cfg = Config::default();

        if let Some(v) = env_string("redis_url") {
            cfg.redis_url = v;
        }
        if let Some(v) = env_string("origin_url") {
            cfg.origin_url = v;
        }
        if let Some(v) = env_parsed::<i64>("cache_default_ttl")? {
            cfg.cache_default_ttl = v;
        }
        if let Some(v) = env_parsed::<usize>("l1_cache_maxsize")? {
            cfg.l1_cache_maxsize = v;
        }
        if let Some(v) = env_json::<Vec<String>>("cache_skip_paths")? {
            cfg.cache_skip_paths = v;
        }
        if let Some(v) = env_json::<HashMap<String, i64>>("ttl_by_content_type")? {
            cfg.ttl_by_content_type = v;
        }
        if let Some(raw) = env_json::<Vec<RawPathTtlRule>>("ttl_by_path_pattern")? {
            // A malformed rule's TTL is skipped with a warning rather than
            // aborting startup over one bad entry in an otherwise usable list.
            cfg.ttl_by_path_pattern = raw
                .into_iter()
                .filter_map(|r| {
                    let ttl = r
                        .ttl
                        .as_i64()
                        .or_else(|| r.ttl.as_str().and_then(|s| s.parse().ok()));
                    match ttl {
                        Some(ttl) => Some(PathTtlRule { pattern: r.pattern, ttl }),
                        None => {
                            log::warn!(
                                "skipping malformed ttl for path pattern rule '{}'",
                                r.pattern
                            );
                            None
                        }
                    }
                })
                .collect();
        }
        if let Some(v) = env_json::<HashMap<u16, i64>>("ttl_by_status_code")? {
            cfg.ttl_by_status_code = v;
        }
        if let Some(v) = env_parsed::<i64>("stale_ttl_offset")? {
            cfg.stale_ttl_offset = v;
        }
        if let Some(v) = env_parsed::<u32>("circuit_breaker_failure_threshold")? {
            cfg.circuit_breaker_failure_threshold = v;
        }
        if let Some(v) = env_parsed::<u64>("circuit_breaker_recovery_timeout")? {
            cfg.circuit_breaker_recovery_timeout = v;
        }
        if let Some(v) = env_string("bind_addr") {
            cfg.bind_addr = v
                .parse()
                .map_err(|e| StartupError::Config(format!("bind_addr: {e}")))?;
        }
        if let Some(v) = env_parsed::<u64>("request_timeout_ms")? {
            cfg.request_timeout = Duration::from_millis(v);
        }

        Ok(cfg)
    }
}

fn env_string(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.is_empty())
}

fn env_parsed<T>(key: &str) -> Result<Option<T>, StartupError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match env_string(key) {
        None => Ok(None),
        Some(raw) => raw
            .parse()
            .map(Some)
            .map_err(|e| StartupError::Config(format!("{key}: {e}"))),
    }
}

fn env_json<T>(key: &str) -> Result<Option<T>, StartupError>
where
    T: for<'de> Deserialize<'de>,
{
    match env_string(key) {
        None => Ok(None),
        Some(raw) => serde_json::from_str(&raw)
            .map(Some)
            .map_err(|e| StartupError::Config(format!("{key}: {e}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec() {
        let cfg = Config::default();
        assert_eq!(cfg.cache_default_ttl, 30);
        assert_eq!(cfg.l1_cache_maxsize, 1000);
        assert_eq!(cfg.stale_ttl_offset, 30);
        assert_eq!(cfg.circuit_breaker_failure_threshold, 3);
        assert_eq!(cfg.circuit_breaker_recovery_timeout, 30);
        assert_eq!(
            cfg.cache_skip_paths,
            vec!["/favicon.ico", "/health", "/metrics"]
        );
    }
}

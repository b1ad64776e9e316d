//! End-to-end tests for the caching pipeline, driven through
//! [`CachingService`] as a plain `tower::Service` against a mocked origin
//! and an in-memory `L2Store` double — there is no assumption that a real
//! Redis server is available to run these.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::body::Body;
use bytes::Bytes;
use cachewarp::breaker::CircuitBreaker;
use cachewarp::cache::{L2Store, L2Value, TwoTierCache};
use cachewarp::config::Config;
use cachewarp::error::CacheError;
use cachewarp::metrics::Metrics;
use cachewarp::origin::OriginClient;
use cachewarp::pipeline::{CachingService, PipelineState};
use cachewarp::ttl::TtlCalculator;
use http::{Request, StatusCode};
use tower::{Service, ServiceExt};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

/// An in-memory `L2Store`, standing in for Redis in these tests. Freshness
/// is computed from an `Instant` deadline rather than wall-clock epoch
/// seconds, matching `l2::L2Cache`'s semantics closely enough for these
/// scenarios without re-implementing its JSON envelope.
#[derive(Default)]
struct MemoryL2 {
    fresh: Mutex<HashMap<String, (Bytes, Option<String>, std::time::Instant)>>,
    stale: Mutex<HashMap<String, (Bytes, Option<String>, std::time::Instant)>>,
    locks: Mutex<HashMap<String, String>>,
}

#[async_trait]
impl L2Store for MemoryL2 {
    async fn get(&self, key: &str) -> Result<Option<L2Value>, CacheError> {
        if let Some((body, ct, deadline)) = self.fresh.lock().unwrap().get(key).cloned() {
            let now = std::time::Instant::now();
            if now < deadline {
                return Ok(Some(L2Value {
                    body,
                    content_type: ct,
                    is_stale: false,
                    fresh_ttl_remaining: Some((deadline - now).as_secs() as i64 + 1),
                }));
            }
        }
        if let Some((body, ct, deadline)) = self.stale.lock().unwrap().get(key).cloned() {
            if std::time::Instant::now() < deadline {
                return Ok(Some(L2Value {
                    body,
                    content_type: ct,
                    is_stale: true,
                    fresh_ttl_remaining: None,
                }));
            }
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
        let now = std::time::Instant::now();
        self.fresh.lock().unwrap().insert(
            key.to_string(),
            (body.clone(), ct.clone(), now + Duration::from_secs(ttl as u64)),
        );
        self.stale.lock().unwrap().insert(
            key.to_string(),
            (
                body.clone(),
                ct,
                now + Duration::from_secs((ttl + stale_ttl_offset) as u64),
            ),
        );
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
        let token = uuid_like();
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

fn uuid_like() -> String {
    static COUNTER: AtomicUsize = AtomicUsize::new(0);
    format!("token-{}", COUNTER.fetch_add(1, Ordering::Relaxed))
}

fn build_state(origin_url: String, config: Config) -> Arc<PipelineState> {
    let cache = TwoTierCache::new(1000, Arc::new(MemoryL2::default()), config.stale_ttl_offset);
    let origin = OriginClient::new(origin_url, Duration::from_secs(5)).unwrap();
    let breaker = CircuitBreaker::new(
        config.circuit_breaker_failure_threshold,
        Duration::from_secs(config.circuit_breaker_recovery_timeout),
    );
    let ttl = TtlCalculator::from_config(&config);
    Arc::new(PipelineState::new(
        Arc::new(cache),
        Arc::new(origin),
        Arc::new(breaker),
        Arc::new(ttl),
        Arc::new(Metrics::new()),
        config.cache_skip_paths.clone(),
    ))
}

fn build_service(origin_url: String, config: Config) -> (CachingService, Arc<AtomicUsize>) {
    let state = build_state(origin_url, config);
    (CachingService::new(state), Arc::new(AtomicUsize::new(0)))
}

async fn get(service: &mut CachingService, path: &str) -> (StatusCode, Bytes) {
    get_with_header(service, path, None).await
}

async fn get_with_header(
    service: &mut CachingService,
    path: &str,
    cache_control: Option<&str>,
) -> (StatusCode, Bytes) {
    let mut builder = Request::builder().method("GET").uri(path);
    if let Some(cc) = cache_control {
        builder = builder.header(http::header::CACHE_CONTROL, cc);
    }
    let req = builder.body(Body::empty()).unwrap();
    let response = service.ready().await.unwrap().call(req).await.unwrap();
    let status = response.status();
    let body = axum::body::to_bytes(response.into_body(), 1 << 20)
        .await
        .unwrap();
    (status, body)
}

#[tokio::test]
async fn miss_then_hit_calls_origin_once() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/x"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_string("the body")
                .insert_header("content-type", "application/json"),
        )
        .expect(1)
        .mount(&server)
        .await;

    let (mut service, _) = build_service(server.uri(), Config::default());

    let (status, body) = get(&mut service, "/x").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(&body[..], b"the body");

    let (status, body) = get(&mut service, "/x").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(&body[..], b"the body");

    server.verify().await;
}

#[tokio::test]
async fn stale_hit_triggers_background_refresh() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/y"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_string("v1")
                .insert_header("content-type", "text/plain"),
        )
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/y"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_string("v2")
                .insert_header("content-type", "text/plain"),
        )
        .mount(&server)
        .await;

    let mut config = Config::default();
    config.cache_default_ttl = 1;
    config.stale_ttl_offset = 30;
    config.ttl_by_path_pattern = vec![];
    config.ttl_by_status_code = HashMap::new();
    config.ttl_by_content_type = HashMap::new();
    let (mut service, _) = build_service(server.uri(), config);

    let (_, body) = get(&mut service, "/y").await;
    assert_eq!(&body[..], b"v1");

    tokio::time::sleep(Duration::from_millis(1200)).await;

    // Past its TTL: served stale, and a background refresh is kicked off.
    let (status, body) = get(&mut service, "/y").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(&body[..], b"v1");

    // Give the detached refresh task a moment to complete.
    tokio::time::sleep(Duration::from_millis(200)).await;

    let (_, body) = get(&mut service, "/y").await;
    assert_eq!(&body[..], b"v2");
}

#[tokio::test]
async fn concurrent_misses_singleflight_to_one_origin_call() {
    let server = MockServer::start().await;
    // A waiter that doesn't win the lock gets exactly one retry after one
    // `LOCK_RETRY_BACKOFF` (50ms), not a poll loop, so the holder's fetch has
    // to land within that window for the dedup to hold across all 20.
    Mock::given(method("GET"))
        .and(path("/z"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_string("z-body")
                .insert_header("content-type", "text/plain")
                .set_delay(Duration::from_millis(10)),
        )
        .expect(1)
        .mount(&server)
        .await;

    let (service, _) = build_service(server.uri(), Config::default());

    let mut handles = Vec::new();
    for _ in 0..20 {
        let mut svc = service.clone();
        handles.push(tokio::spawn(async move { get(&mut svc, "/z").await }));
    }

    let mut bodies = Vec::new();
    for h in handles {
        bodies.push(h.await.unwrap());
    }

    for (status, body) in &bodies {
        assert_eq!(*status, StatusCode::OK);
        assert_eq!(&body[..], b"z-body");
    }

    server.verify().await;
}

#[tokio::test]
async fn breaker_trips_on_repeated_connect_failures_and_then_short_circuits() {
    // An address nothing listens on: every fetch is a connection error,
    // the kind the breaker actually counts (a non-2xx response would not).
    let mut config = Config::default();
    config.circuit_breaker_failure_threshold = 1;
    config.circuit_breaker_recovery_timeout = 30;
    let (mut service, _) = build_service("http://127.0.0.1:1".to_string(), config);

    // First failure trips the breaker open (threshold 1); uncached, so
    // there is no stale fallback and the client sees 503.
    let (status, body) = get(&mut service, "/never-cached").await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(&body[..], br#"{"error":"Service Unavailable"}"#);

    // The breaker is now open: a second request is denied without even
    // attempting the (unreachable) origin again.
    let (status, _) = get(&mut service, "/also-never-cached").await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
}

#[tokio::test]
async fn stale_fallback_serves_cached_body_while_origin_is_unreachable() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/a"))
        .respond_with(ResponseTemplate::new(200).set_body_string("a-body"))
        .expect(1)
        .mount(&server)
        .await;

    let mut config = Config::default();
    config.cache_default_ttl = 1;
    config.ttl_by_path_pattern = vec![];
    config.ttl_by_status_code = HashMap::new();
    config.ttl_by_content_type = HashMap::new();
    config.stale_ttl_offset = 30;
    let (mut service, _) = build_service(server.uri(), config);

    // Populate /a, then let its 1s fresh TTL lapse so the next lookup
    // finds only the stale copy.
    let (status, _) = get(&mut service, "/a").await;
    assert_eq!(status, StatusCode::OK);
    tokio::time::sleep(Duration::from_millis(1200)).await;

    // The origin is now gone entirely; the response still comes from the
    // stale slot rather than failing.
    drop(server);
    let (status, body) = get(&mut service, "/a").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(&body[..], b"a-body");
}

#[tokio::test]
async fn status_specific_ttl_caches_a_404() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/missing"))
        .respond_with(ResponseTemplate::new(404).set_body_string("nope"))
        .expect(1)
        .mount(&server)
        .await;

    let mut config = Config::default();
    config.ttl_by_status_code = HashMap::from([(404, 10)]);
    config.ttl_by_path_pattern = vec![];
    let (mut service, _) = build_service(server.uri(), config);

    let envelope = serde_json::json!({ "error": "Not Found" }).to_string();

    // The live request surfaces the origin's error status with a JSON
    // envelope, same as a miss that hits an unreachable origin would.
    let (status, body) = get(&mut service, "/missing").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(&body[..], envelope.as_bytes());

    // The status-code rule gave it a positive TTL, so the envelope itself
    // was cached; a subsequent hit is served from cache at 200, per the
    // fresh-hit rule, not the original error status.
    let (status, body) = get(&mut service, "/missing").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(&body[..], envelope.as_bytes());

    server.verify().await;
}

#[tokio::test]
async fn no_store_bypasses_the_cache_entirely() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/c"))
        .respond_with(ResponseTemplate::new(200).set_body_string("c-body"))
        .expect(2)
        .mount(&server)
        .await;

    let (mut service, _) = build_service(server.uri(), Config::default());

    let (status, _) = get_with_header(&mut service, "/c", Some("no-store")).await;
    assert_eq!(status, StatusCode::OK);
    let (status, _) = get_with_header(&mut service, "/c", Some("no-store")).await;
    assert_eq!(status, StatusCode::OK);

    server.verify().await;
}

#[tokio::test]
async fn max_age_directive_overrides_the_calculated_ttl() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/d"))
        .respond_with(ResponseTemplate::new(200).set_body_string("d-body"))
        .expect(1)
        .mount(&server)
        .await;

    let mut config = Config::default();
    config.ttl_by_path_pattern = vec![];
    config.ttl_by_status_code = HashMap::new();
    let (mut service, _) = build_service(server.uri(), config);

    let (status, _) = get_with_header(&mut service, "/d", Some("max-age=60")).await;
    assert_eq!(status, StatusCode::OK);

    // Second request within the overridden TTL is served from cache.
    let (status, body) = get(&mut service, "/d").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(&body[..], b"d-body");

    server.verify().await;
}

#[tokio::test]
async fn favicon_is_no_content_and_never_reaches_the_origin() {
    let server = MockServer::start().await;
    // No mock registered for /favicon.ico: if the router's dedicated
    // handler were bypassed, wiremock would 404 rather than this request
    // ever reaching a mocked 204.
    let state = build_state(server.uri(), Config::default());
    let mut router = cachewarp::app::router(state);

    let req = Request::builder()
        .method("GET")
        .uri("/favicon.ico")
        .body(Body::empty())
        .unwrap();
    let response = router.ready().await.unwrap().call(req).await.unwrap();
    assert_eq!(response.status(), StatusCode::NO_CONTENT);
}

#[tokio::test]
async fn health_reports_redis_connected_against_the_in_memory_l2() {
    let server = MockServer::start().await;
    let state = build_state(server.uri(), Config::default());
    let mut router = cachewarp::app::router(state);

    let req = Request::builder()
        .method("GET")
        .uri("/health")
        .body(Body::empty())
        .unwrap();
    let response = router.ready().await.unwrap().call(req).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = axum::body::to_bytes(response.into_body(), 1 << 20)
        .await
        .unwrap();
    let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(json["status"], "ok");
    assert_eq!(json["redis"], "connected");
}

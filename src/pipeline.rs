//! The caching `tower::Service`, generalized from `ServerCacheService`: a
//! service-side cache that serves cached responses where it can and
//! fetches from an origin rather than an inner `S` when it can't.
//!
//! The five-step algorithm lives in [`CachingService::call`]: skip list,
//! client cache-control directives, cache lookup, singleflight
//! acquisition, and fetch-and-return. Every suspension point (cache I/O,
//! origin I/O, the singleflight back-off) releases any lock or mutex it
//! might otherwise hold across the await, per the concurrency rules this
//! pipeline has to honor.

use std::convert::Infallible;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use axum::body::Body;
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use http::{Request, StatusCode};
use tower::Service;

use crate::breaker::CircuitBreaker;
use crate::cache::TwoTierCache;
use crate::metrics::{CacheLayer, Metrics};
use crate::origin::{OriginClient, OriginResponse};
use crate::ttl::TtlCalculator;

const LOCK_TIMEOUT: Duration = Duration::from_secs(10);
const LOCK_RETRY_BACKOFF: Duration = Duration::from_millis(50);

/// Everything the pipeline needs to serve one proxied path, shared behind
/// `Arc`s across every clone of the service.
pub struct PipelineState {
    cache: Arc<TwoTierCache>,
    origin: Arc<OriginClient>,
    breaker: Arc<CircuitBreaker>,
    ttl: Arc<TtlCalculator>,
    metrics: Arc<Metrics>,
    skip_paths: Vec<String>,
}

impl PipelineState {
    /// Builds shared pipeline state from its components.
    pub fn new(
        cache: Arc<TwoTierCache>,
        origin: Arc<OriginClient>,
        breaker: Arc<CircuitBreaker>,
        ttl: Arc<TtlCalculator>,
        metrics: Arc<Metrics>,
        skip_paths: Vec<String>,
    ) -> Self {
        Self {
            cache,
            origin,
            breaker,
            ttl,
            metrics,
            skip_paths,
        }
    }

    /// The two-tier cache.
    pub fn cache(&self) -> &Arc<TwoTierCache> {
        &self.cache
    }

    /// The origin HTTP client.
    pub fn origin(&self) -> &Arc<OriginClient> {
        &self.origin
    }

    /// The shared circuit breaker.
    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    /// The TTL rule set.
    pub fn ttl(&self) -> &Arc<TtlCalculator> {
        &self.ttl
    }

    /// Process-wide metrics.
    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }
}

/// The `tower::Service` implementing the caching pipeline.
///
/// Cloning is cheap: everything behind the clone is an `Arc`.
#[derive(Clone)]
pub struct CachingService {
    state: Arc<PipelineState>,
}

impl CachingService {
    /// Wraps shared pipeline state as a service.
    pub fn new(state: Arc<PipelineState>) -> Self {
        Self { state }
    }
}

impl Service<Request<Body>> for CachingService {
    type Response = Response;
    type Error = Infallible;
    type Future =
        Pin<Box<dyn std::future::Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: Request<Body>) -> Self::Future {
        let state = self.state.clone();
        Box::pin(async move { Ok(handle(state, req).await) })
    }
}

async fn handle(state: Arc<PipelineState>, req: Request<Body>) -> Response {
    let start = Instant::now();
    state.metrics.record_request();
    let path = req.uri().path().to_string();

    let response = route(&state, req, &path).await;

    state
        .metrics
        .observe_request_latency(start.elapsed().as_secs_f64());
    response
}

async fn route(state: &Arc<PipelineState>, req: Request<Body>, path: &str) -> Response {
    // Step 1: skip list.
    if state.skip_paths.iter().any(|p| p == path) {
        log::debug!("bypassing cache for skip-listed path: {path}");
        return forward_uncached(state, path).await;
    }

    // Non-GET requests are never cached.
    if req.method() != http::Method::GET {
        log::debug!("bypassing cache for non-GET request: {}", req.method());
        return forward_uncached(state, path).await;
    }

    let cache_control = req
        .headers()
        .get(http::header::CACHE_CONTROL)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_ascii_lowercase();

    // Step 2: client directives.
    if cache_control.contains("no-cache") || cache_control.contains("no-store") {
        log::debug!("bypassing cache due to Cache-Control: {cache_control}");
        return fetch_and_return(state, path, None, None).await;
    }
    let client_ttl = parse_max_age(&cache_control);

    let cache_key = format!("cache:{path}");

    // Step 3: cache lookup.
    match state.cache.get(&cache_key).await {
        Ok(Some(hit)) => {
            state.metrics.record_cache_hit(hit.layer.into());
            log::info!(
                "{}cache hit for {cache_key}",
                if hit.is_stale { "stale " } else { "" }
            );
            if hit.is_stale {
                schedule_refresh(state.clone(), cache_key.clone(), path.to_string());
            }
            return body_response(StatusCode::OK, hit.content_type, hit.body);
        }
        Ok(None) => {
            state.metrics.record_cache_miss(CacheLayer::L1);
            state.metrics.record_cache_miss(CacheLayer::L2);
            log::info!("cache miss for {cache_key}");
        }
        Err(e) => {
            log::error!("error during cache retrieval for {cache_key}: {e}");
            state.metrics.record_redis_error("Unavailable");
            return forward_uncached(state, path).await;
        }
    }

    // Step 4: singleflight.
    match state.cache.acquire_lock(&cache_key, LOCK_TIMEOUT).await {
        Ok(Some(lock)) => {
            let result = singleflight_owner(state, path, &cache_key, client_ttl).await;
            let _ = state.cache.release_lock(&lock).await;
            result
        }
        Ok(None) => {
            log::debug!(
                "lock held for {cache_key}, backing off {LOCK_RETRY_BACKOFF:?} for the holder to populate it"
            );
            tokio::time::sleep(LOCK_RETRY_BACKOFF).await;
            match state.cache.get(&cache_key).await {
                Ok(Some(hit)) => {
                    state.metrics.record_cache_hit(hit.layer.into());
                    body_response(StatusCode::OK, hit.content_type, hit.body)
                }
                _ => {
                    log::warn!(
                        "no cache for {cache_key} after backoff, fetching origin directly"
                    );
                    fetch_and_return(state, path, None, None).await
                }
            }
        }
        Err(e) => {
            log::error!("error acquiring lock for {cache_key}: {e}");
            state.metrics.record_redis_error("Unavailable");
            fetch_and_return(state, path, None, client_ttl).await
        }
    }
}

async fn singleflight_owner(
    state: &Arc<PipelineState>,
    path: &str,
    cache_key: &str,
    client_ttl: Option<i64>,
) -> Response {
    // Re-check in case another holder populated the cache before we won
    // the lock.
    if let Ok(Some(hit)) = state.cache.get(cache_key).await {
        state.metrics.record_cache_hit(hit.layer.into());
        return body_response(StatusCode::OK, hit.content_type, hit.body);
    }
    fetch_and_return(state, path, Some(cache_key), client_ttl).await
}

async fn forward_uncached(state: &Arc<PipelineState>, path: &str) -> Response {
    match state.origin.fetch(path).await {
        Ok(resp) => origin_response(resp),
        Err(e) => {
            log::error!("origin fetch failed for {path}: {e}");
            state.metrics.record_origin_error(error_kind(&e));
            StatusCode::SERVICE_UNAVAILABLE.into_response()
        }
    }
}

/// Step 5 of the pipeline: consult the breaker, fetch from origin, and
/// reconcile the outcome with the cache and the breaker.
///
/// A 2xx origin response is a breaker success and is forwarded verbatim.
/// Any other status the origin actually returned is a breaker failure and
/// comes back to the client as a JSON `{"error": ...}` envelope with the
/// origin's own status preserved; it is still cached under `cache_key` when
/// a status-code rule gives it a positive TTL, since a response that's
/// cacheable by rule shouldn't re-hit the origin on every request just
/// because it happens to be an error.
async fn fetch_and_return(
    state: &Arc<PipelineState>,
    path: &str,
    cache_key: Option<&str>,
    client_ttl: Option<i64>,
) -> Response {
    if !state.breaker.can_attempt() {
        log::warn!("circuit breaker OPEN, attempting stale fallback for {path}");
        if let Some(key) = cache_key {
            if let Ok(Some(hit)) = state.cache.get(key).await {
                state.metrics.record_cache_hit(hit.layer.into());
                log::info!("serving stale data for {key} due to open breaker");
                return body_response(StatusCode::OK, hit.content_type, hit.body);
            }
        }
        return service_unavailable();
    }

    match state.origin.fetch(path).await {
        Ok(resp) if (200..300).contains(&resp.status) => {
            state.breaker.record_success();
            state
                .metrics
                .set_circuit_breaker_state(state.breaker.state());

            let ttl = client_ttl.unwrap_or_else(|| {
                state
                    .ttl
                    .calculate(path, resp.content_type.as_deref(), Some(resp.status))
            });

            if let Some(key) = cache_key {
                if ttl > 0 {
                    if let Err(e) = state
                        .cache
                        .set(key, resp.body.clone(), resp.content_type.as_deref(), ttl)
                        .await
                    {
                        log::error!("failed to write cache entry for {key}: {e}");
                        state.metrics.record_redis_error("Unavailable");
                    } else {
                        log::info!("cache set for {key} with ttl {ttl}");
                    }
                }
            }

            origin_response(resp)
        }
        Ok(resp) => {
            log::warn!("origin error for {path}: status {}", resp.status);
            state.breaker.record_failure();
            state
                .metrics
                .set_circuit_breaker_state(state.breaker.state());

            let ttl = client_ttl.unwrap_or_else(|| {
                state
                    .ttl
                    .calculate(path, resp.content_type.as_deref(), Some(resp.status))
            });
            let (status, message) = classify_origin_error(resp.status);
            let envelope = error_envelope_body(&message);

            if let Some(key) = cache_key {
                if ttl > 0 {
                    if let Err(e) = state
                        .cache
                        .set(key, envelope.clone(), Some("application/json"), ttl)
                        .await
                    {
                        log::error!("failed to write cache entry for {key}: {e}");
                        state.metrics.record_redis_error("Unavailable");
                    } else {
                        log::info!("cache set for {key} with ttl {ttl}");
                    }
                }
            }

            body_response(status, Some("application/json".to_string()), envelope)
        }
        Err(e) => {
            log::error!("origin fetch failed for {path}: {e}");
            state.metrics.record_origin_error(error_kind(&e));
            state.breaker.record_failure();
            state
                .metrics
                .set_circuit_breaker_state(state.breaker.state());

            if let Some(key) = cache_key {
                if let Ok(Some(hit)) = state.cache.get(key).await {
                    state.metrics.record_cache_hit(hit.layer.into());
                    log::info!("serving stale data for {key} due to origin failure");
                    return body_response(StatusCode::OK, hit.content_type, hit.body);
                }
            }
            service_unavailable()
        }
    }
}

/// Maps an origin error status to the status and message returned to the
/// client. 404 is reported as "Not Found"; any other status is preserved
/// verbatim with a generic message, per the origin client's contract that
/// only connection/timeout failures are classified more specifically than
/// this.
fn classify_origin_error(status: u16) -> (StatusCode, String) {
    if status == 404 {
        (StatusCode::NOT_FOUND, "Not Found".to_string())
    } else {
        (
            StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
            "Origin error".to_string(),
        )
    }
}

fn error_envelope_body(message: &str) -> Bytes {
    Bytes::from(serde_json::json!({ "error": message }).to_string())
}

/// Runs the background refresh task for a previously served stale entry.
///
/// Detached with `tokio::spawn` rather than awaited, so it outlives the
/// request that triggered it; the request's own response has already been
/// sent by the time this runs.
fn schedule_refresh(state: Arc<PipelineState>, cache_key: String, path: String) {
    tokio::spawn(crate::refresher::refresh(state, cache_key, path));
}

fn error_kind(e: &crate::error::OriginError) -> &'static str {
    match e {
        crate::error::OriginError::Connect(_) => "ConnectionError",
        crate::error::OriginError::Timeout(_) => "TimeoutError",
        crate::error::OriginError::Unexpected(_) => "UnexpectedError",
    }
}

fn origin_response(resp: OriginResponse) -> Response {
    let status = StatusCode::from_u16(resp.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    body_response(status, resp.content_type, resp.body)
}

fn body_response(status: StatusCode, content_type: Option<String>, body: Bytes) -> Response {
    let mut builder = http::Response::builder().status(status);
    if let Some(ct) = content_type {
        builder = builder.header(http::header::CONTENT_TYPE, ct);
    }
    builder
        .body(Body::from(body))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

fn service_unavailable() -> Response {
    (
        StatusCode::SERVICE_UNAVAILABLE,
        axum::Json(serde_json::json!({ "error": "Service Unavailable" })),
    )
        .into_response()
}

fn parse_max_age(cache_control: &str) -> Option<i64> {
    let idx = cache_control.find("max-age=")?;
    let rest = &cache_control[idx + "max-age=".len()..];
    let digits: String = rest.chars().take_while(|c| c.is_ascii_digit()).collect();
    digits.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_max_age() {
        assert_eq!(parse_max_age("max-age=120"), Some(120));
        assert_eq!(parse_max_age("no-cache"), None);
        assert_eq!(parse_max_age("public, max-age=30"), Some(30));
    }
}

//! Background cache refresh for stale-while-revalidate.
//!
//! [`refresh`] is spawned by the pipeline after a stale hit has already
//! been returned to the client; it runs on its own task and has no effect
//! on the response already sent.

use std::sync::Arc;
use std::time::Duration;

use crate::pipeline::PipelineState;

const LOCK_TIMEOUT: Duration = Duration::from_secs(10);

/// Attempts one refresh of `cache_key`/`path`, guarded by the same
/// singleflight lock the foreground pipeline uses, so a concurrent
/// foreground fetch and a background refresh never race each other.
pub async fn refresh(state: Arc<PipelineState>, cache_key: String, path: String) {
    log::debug!("background refresh started for {path}");

    let lock = match state.cache().acquire_lock(&cache_key, LOCK_TIMEOUT).await {
        Ok(Some(lock)) => lock,
        Ok(None) => {
            log::debug!("lock held for background refresh of {cache_key}, skipping");
            return;
        }
        Err(e) => {
            log::error!("error acquiring lock for background refresh of {cache_key}: {e}");
            return;
        }
    };

    if !state.breaker().can_attempt() {
        log::warn!("circuit breaker OPEN, skipping background refresh for {path}");
        let _ = state.cache().release_lock(&lock).await;
        return;
    }

    match state.origin().fetch(&path).await {
        Ok(resp) => {
            let ttl = state
                .ttl()
                .calculate(&path, resp.content_type.as_deref(), Some(resp.status));
            if let Err(e) = state
                .cache()
                .set(&cache_key, resp.body, resp.content_type.as_deref(), ttl)
                .await
            {
                log::error!("background refresh failed to write cache for {cache_key}: {e}");
            } else {
                log::info!("background cache refresh completed for {cache_key}");
            }
            state.breaker().record_success();
        }
        Err(e) => {
            log::warn!("background refresh failed for {path}: {e}");
            state.breaker().record_failure();
        }
    }
    state
        .metrics()
        .set_circuit_breaker_state(state.breaker().state());

    let _ = state.cache().release_lock(&lock).await;
    log::debug!("background refresh lock released for {cache_key}");
}

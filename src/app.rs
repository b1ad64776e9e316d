//! Router assembly.
//!
//! `/health`, `/metrics`, and `/favicon.ico` get dedicated handlers; every
//! other path falls through to [`CachingService`], which is itself
//! responsible for recognizing skip-listed paths and non-`GET` methods and
//! forwarding them uncached.

use std::sync::Arc;

use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use http::StatusCode;

use crate::pipeline::{CachingService, PipelineState};

/// Shared state for the handful of routes that don't go through the
/// caching pipeline.
#[derive(Clone)]
struct AdminState {
    pipeline: Arc<PipelineState>,
}

/// Builds the application [`Router`].
///
/// `/health` and `/metrics` are also in the pipeline's own skip list, so
/// serving them here rather than letting the fallback reach them is a
/// shortcut, not a behavior difference. `/favicon.ico` is genuinely special:
/// it never reaches the origin at all.
pub fn router(pipeline: Arc<PipelineState>) -> Router {
    let admin_state = AdminState {
        pipeline: pipeline.clone(),
    };

    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .route("/favicon.ico", get(favicon))
        .with_state(admin_state)
        .fallback_service(CachingService::new(pipeline))
}

async fn favicon() -> impl IntoResponse {
    StatusCode::NO_CONTENT
}

async fn health(axum::extract::State(state): axum::extract::State<AdminState>) -> impl IntoResponse {
    let redis_connected = state.pipeline.cache().ping().await;
    Json(serde_json::json!({
        "status": "ok",
        "redis": if redis_connected { "connected" } else { "disconnected" },
    }))
}

async fn metrics(axum::extract::State(state): axum::extract::State<AdminState>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [(http::header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.pipeline.metrics().render(),
    )
}

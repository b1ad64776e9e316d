//! Process entry point.
//!
//! Startup loads configuration and logging, then tries to connect the L2
//! cache. A Redis outage at startup does not abort the process: the proxy
//! comes up in a degraded, pass-through mode (every request reaches the
//! origin directly) rather than refusing to serve traffic at all. Any other
//! startup failure — bad configuration, an unbindable address — is fatal.

use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use axum::response::IntoResponse;
use cachewarp::app;
use cachewarp::breaker::CircuitBreaker;
use cachewarp::cache::TwoTierCache;
use cachewarp::config::Config;
use cachewarp::error::StartupError;
use cachewarp::logging;
use cachewarp::metrics::Metrics;
use cachewarp::origin::OriginClient;
use cachewarp::pipeline::PipelineState;
use cachewarp::ttl::TtlCalculator;

#[tokio::main]
async fn main() -> ExitCode {
    logging::init();

    let config = match Config::from_env() {
        Ok(c) => c,
        Err(e) => {
            log::error!("invalid configuration: {e}");
            return ExitCode::FAILURE;
        }
    };

    match run(config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            log::error!("fatal startup error: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn run(config: Config) -> Result<(), StartupError> {
    let cache = match TwoTierCache::connect(
        &config.redis_url,
        config.l1_cache_maxsize,
        config.stale_ttl_offset,
    )
    .await
    {
        Ok(cache) => cache,
        Err(e) => {
            log::error!("could not connect to Redis at startup, serving pass-through: {e}");
            degraded_serve(config).await?;
            return Ok(());
        }
    };

    let origin = OriginClient::new(config.origin_url.clone(), config.request_timeout)
        .map_err(|e| StartupError::Config(e.to_string()))?;
    let breaker = CircuitBreaker::new(
        config.circuit_breaker_failure_threshold,
        Duration::from_secs(config.circuit_breaker_recovery_timeout),
    );
    let ttl = TtlCalculator::from_config(&config);

    let state = Arc::new(PipelineState::new(
        Arc::new(cache),
        Arc::new(origin),
        Arc::new(breaker),
        Arc::new(ttl),
        Arc::new(Metrics::new()),
        config.cache_skip_paths.clone(),
    ));

    serve(config, app::router(state)).await
}

/// Serves every request by forwarding straight to the origin, bypassing
/// the cache entirely, for use when Redis could not be reached at
/// startup.
async fn degraded_serve(config: Config) -> Result<(), StartupError> {
    let origin = OriginClient::new(config.origin_url.clone(), config.request_timeout)
        .map_err(|e| StartupError::Config(e.to_string()))?;
    let origin = Arc::new(origin);

    let app = axum::Router::new().fallback_service(tower::service_fn(move |req: http::Request<axum::body::Body>| {
        let origin = origin.clone();
        async move {
            let path = req.uri().path().to_string();
            let response = match origin.fetch(&path).await {
                Ok(resp) => {
                    let status = http::StatusCode::from_u16(resp.status)
                        .unwrap_or(http::StatusCode::INTERNAL_SERVER_ERROR);
                    let mut builder = http::Response::builder().status(status);
                    if let Some(ct) = resp.content_type {
                        builder = builder.header(http::header::CONTENT_TYPE, ct);
                    }
                    builder
                        .body(axum::body::Body::from(resp.body))
                        .unwrap_or_else(|_| {
                            http::StatusCode::INTERNAL_SERVER_ERROR.into_response()
                        })
                }
                Err(_) => http::StatusCode::SERVICE_UNAVAILABLE.into_response(),
            };
            Ok::<_, std::convert::Infallible>(response)
        }
    }));

    serve(config, app).await
}

async fn serve(config: Config, app: axum::Router) -> Result<(), StartupError> {
    let listener = tokio::net::TcpListener::bind(config.bind_addr)
        .await
        .map_err(|source| StartupError::Bind {
            addr: config.bind_addr.to_string(),
            source,
        })?;
    log::info!("listening on {}", config.bind_addr);
    axum::serve(listener, app)
        .await
        .map_err(|e| StartupError::Config(e.to_string()))
}

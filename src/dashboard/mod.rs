//! # Dashboard — HTTP and WebSocket Surface
//!
//! Runs an Axum server exposing block campaigns: listing and inspecting
//! blocks, starting and stopping runs, streaming per-block progress over
//! WebSocket, the discoveries feed, and health/metrics endpoints.
//!
//! | Endpoint | Handler |
//! |----------|---------|
//! | `GET /api/blocks` | [`routes_blocks`] list, lazily seeding ids `[0, limit)` |
//! | `GET /api/blocks/{id}` | block metadata and every unit |
//! | `POST /api/blocks/{id}/start` | start or resume a run |
//! | `POST /api/blocks/{id}/stop` | cooperative stop |
//! | `GET /ws/blocks/{id}` | [`websocket`] progress stream |
//! | `POST /api/jobs`, `GET /api/jobs/{id}` | [`routes_jobs`] single-exponent tests |
//! | `GET /ws/jobs/{id}` | [`websocket`] job checkpoint stream |
//! | `GET /api/primes`, `/api/primes/count` | [`routes_primes`] |
//! | `GET /healthz`, `/readyz`, `/metrics` | [`routes_health`] |

mod routes_blocks;
mod routes_health;
mod routes_jobs;
mod routes_primes;
mod websocket;

use crate::db::BlockStore;
use crate::events::{BlockBus, JobBus};
use crate::prom_metrics;
use crate::scheduler::{BlockScheduler, SchedulerError};
use anyhow::Result;
use axum::extract::Request;
use axum::http::StatusCode;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::cors::{Any, CorsLayer};
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::services::ServeDir;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, Instrument};

pub struct AppState {
    pub scheduler: Arc<BlockScheduler>,
    pub store: Arc<dyn BlockStore>,
    pub bus: Arc<BlockBus>,
    pub job_bus: Arc<JobBus>,
    pub prom_metrics: Arc<prom_metrics::Metrics>,
}

impl AppState {
    pub fn new(
        scheduler: Arc<BlockScheduler>,
        prom_metrics: Arc<prom_metrics::Metrics>,
    ) -> Arc<Self> {
        Arc::new(AppState {
            store: Arc::clone(scheduler.store()),
            bus: Arc::clone(scheduler.bus()),
            job_bus: Arc::clone(scheduler.job_bus()),
            scheduler,
            prom_metrics,
        })
    }
}

impl IntoResponse for SchedulerError {
    fn into_response(self) -> Response {
        let status = match &self {
            SchedulerError::Validation(_) => StatusCode::BAD_REQUEST,
            SchedulerError::Conflict(_) => StatusCode::CONFLICT,
            SchedulerError::NotFound(_) => StatusCode::NOT_FOUND,
            SchedulerError::Store(e) => {
                tracing::error!(error = %e, "store failure");
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        (status, Json(serde_json::json!({"error": self.to_string()}))).into_response()
    }
}

/// Middleware that records HTTP request duration into the Prometheus histogram,
/// generates (or propagates) a request ID for correlation, and wraps the
/// request in a tracing span using `.instrument()` for proper async propagation.
async fn metrics_middleware(
    axum::extract::State(state): axum::extract::State<Arc<AppState>>,
    req: Request,
    next: Next,
) -> Response {
    let request_id = req
        .headers()
        .get("x-request-id")
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    let method = req.method().to_string();
    let raw_path = req.uri().path().to_string();
    let norm_path = normalize_path(&raw_path);
    let start = std::time::Instant::now();

    let span = tracing::info_span!(
        "request",
        request_id = %request_id,
        method = %method,
        path = %raw_path,
    );
    let mut response = next.run(req).instrument(span).await;

    state
        .prom_metrics
        .http_request_duration
        .get_or_create(&prom_metrics::HttpLabel {
            method,
            path: norm_path,
        })
        .observe(start.elapsed().as_secs_f64());

    if let Ok(value) = request_id.parse() {
        response.headers_mut().insert("x-request-id", value);
    }
    response
}

/// Collapse numeric path segments into `:id` so histogram labels stay bounded.
fn normalize_path(path: &str) -> String {
    path.split('/')
        .map(|seg| {
            let numeric = seg.chars().all(|c| c.is_ascii_digit() || c == '-');
            let job_id = seg.len() >= 32 && seg.chars().all(|c| c.is_ascii_hexdigit() || c == '-');
            if !seg.is_empty() && (numeric || job_id) {
                ":id"
            } else {
                seg
            }
        })
        .collect::<Vec<_>>()
        .join("/")
}

pub fn build_router(state: Arc<AppState>, static_dir: Option<&Path>) -> Router {
    let mut app = Router::new()
        .route("/healthz", get(routes_health::handler_healthz))
        .route("/readyz", get(routes_health::handler_readyz))
        .route("/metrics", get(routes_health::handler_metrics))
        .route("/api/blocks", get(routes_blocks::handler_api_blocks))
        .route("/api/blocks/{id}", get(routes_blocks::handler_api_block))
        .route(
            "/api/blocks/{id}/start",
            post(routes_blocks::handler_api_block_start),
        )
        .route(
            "/api/blocks/{id}/stop",
            post(routes_blocks::handler_api_block_stop),
        )
        .route("/api/primes", get(routes_primes::handler_api_primes))
        .route(
            "/api/primes/count",
            get(routes_primes::handler_api_primes_count),
        )
        .route("/api/jobs", post(routes_jobs::handler_api_job_create))
        .route("/api/jobs/{id}", get(routes_jobs::handler_api_job))
        .route("/ws/blocks/{id}", get(websocket::handler_ws_block))
        .route("/ws/jobs/{id}", get(websocket::handler_ws_job));

    if let Some(dir) = static_dir {
        app = app.fallback_service(ServeDir::new(dir).append_index_html_on_directories(true));
    }

    app.layer(
        CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any),
    )
    .layer(CatchPanicLayer::new())
    .layer(axum::middleware::from_fn_with_state(
        state.clone(),
        metrics_middleware,
    ))
    .layer(TraceLayer::new_for_http())
    .layer(RequestBodyLimitLayer::new(1024 * 1024))
    .layer(TimeoutLayer::with_status_code(
        StatusCode::REQUEST_TIMEOUT,
        Duration::from_secs(30),
    ))
    .with_state(state)
}

pub async fn run(state: Arc<AppState>, port: u16, static_dir: Option<&Path>) -> Result<()> {
    let app = build_router(Arc::clone(&state), static_dir);

    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], port));
    info!(port, "dashboard running");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(Arc::clone(&state)))
        .await?;
    info!("dashboard shut down gracefully");
    Ok(())
}

/// Wait for SIGINT/SIGTERM, then ask every active run to stop so units are
/// returned to `queued` at their next checkpoint.
async fn shutdown_signal(state: Arc<AppState>) {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => info!("received SIGINT, shutting down"),
                    _ = sigterm.recv() => info!("received SIGTERM, shutting down"),
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "failed to install SIGTERM handler");
                let _ = ctrl_c.await;
                info!("received SIGINT, shutting down");
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = ctrl_c.await;
        info!("received SIGINT, shutting down");
    }

    let active = state.scheduler.active_runs();
    for block_id in &active {
        state.scheduler.stop(*block_id);
    }
    for block_id in active {
        state.scheduler.wait(block_id).await;
    }
}

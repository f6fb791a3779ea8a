//! # Health & Observability Endpoints
//!
//! | Endpoint | Purpose |
//! |----------|---------|
//! | `GET /healthz` | Liveness: process is serving HTTP |
//! | `GET /readyz` | Readiness: block store reachable within 2 s |
//! | `GET /metrics` | Prometheus scrape |

use super::AppState;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use std::sync::Arc;

/// Liveness check: no dependencies consulted.
pub async fn handler_healthz() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

/// Readiness check: store health check with a 2-second timeout; 503 otherwise.
pub async fn handler_readyz(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let check =
        tokio::time::timeout(std::time::Duration::from_secs(2), state.store.health_check()).await;

    match check {
        Ok(Ok(())) => (StatusCode::OK, "ok"),
        Ok(Err(_)) => (StatusCode::SERVICE_UNAVAILABLE, "database unreachable"),
        Err(_) => (StatusCode::SERVICE_UNAVAILABLE, "database timeout"),
    }
}

/// Prometheus metrics in text exposition format. Bus gauges are sampled here.
pub async fn handler_metrics(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let m = &state.prom_metrics;
    let subscribers = state.bus.total_subscribers() + state.job_bus.total_subscribers();
    m.bus_subscribers.set(subscribers as i64);
    m.bus_messages_dropped.set((state.bus.dropped() + state.job_bus.dropped()) as i64);
    (
        StatusCode::OK,
        [(
            "content-type",
            "application/openmetrics-text; version=1.0.0; charset=utf-8",
        )],
        m.encode(),
    )
}

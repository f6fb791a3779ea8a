//! # Discoveries API
//!
//! | Endpoint | Response |
//! |----------|----------|
//! | `GET /api/primes?limit=N` | recent Mersenne primes, newest first (default 12) |
//! | `GET /api/primes/count` | `{count}` |

use super::AppState;
use crate::scheduler::SchedulerError;
use axum::extract::{Query, State};
use axum::Json;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

const DEFAULT_LIMIT: i64 = 12;
const MAX_LIMIT: i64 = 500;

#[derive(Deserialize)]
pub(super) struct PrimesQuery {
    limit: Option<i64>,
}

#[derive(Serialize)]
pub(super) struct PrimeView {
    p: i64,
    block_id: i64,
    /// Decimal digits of 2^p - 1.
    digits: u64,
    finished_at: Option<chrono::DateTime<chrono::Utc>>,
    engine_info: Option<String>,
    ns_elapsed: Option<i64>,
}

/// `GET /api/primes?limit=N`
pub(super) async fn handler_api_primes(
    State(state): State<Arc<AppState>>,
    Query(params): Query<PrimesQuery>,
) -> Result<Json<Vec<PrimeView>>, SchedulerError> {
    let limit = params.limit.unwrap_or(DEFAULT_LIMIT);
    if !(1..=MAX_LIMIT).contains(&limit) {
        return Err(SchedulerError::Validation(format!(
            "limit must be in 1..={}, got {}",
            MAX_LIMIT, limit
        )));
    }
    let hits = state.store.primes_recent(limit).await?;
    Ok(Json(
        hits.into_iter()
            .map(|h| PrimeView {
                digits: crate::mersenne_digits(h.p as u64),
                p: h.p,
                block_id: h.block_id,
                finished_at: h.finished_at,
                engine_info: h.engine_info,
                ns_elapsed: h.ns_elapsed,
            })
            .collect(),
    ))
}

/// `GET /api/primes/count`
pub(super) async fn handler_api_primes_count(
    State(state): State<Arc<AppState>>,
) -> Result<Json<serde_json::Value>, SchedulerError> {
    let count = state.store.prime_count().await?;
    Ok(Json(serde_json::json!({ "count": count })))
}

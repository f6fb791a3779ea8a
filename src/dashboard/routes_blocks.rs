//! # Block Campaign REST API
//!
//! | Endpoint | Response |
//! |----------|----------|
//! | `GET /api/blocks?limit=N` | first N blocks (default 6) with a `label` |
//! | `GET /api/blocks/{id}` | `{block, exponents}` |
//! | `POST /api/blocks/{id}/start?concurrency=N` | `{scheduled, block_id, concurrency}` |
//! | `POST /api/blocks/{id}/stop` | `{ok, block_id}` |
//!
//! Unknown blocks are sieved and seeded on first reference, so any id in
//! range can be inspected or started without a prior setup step.

use super::AppState;
use crate::db::{BlockRow, UnitRow};
use crate::scheduler::SchedulerError;
use axum::extract::{Path, Query, State};
use axum::response::IntoResponse;
use axum::Json;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

const DEFAULT_LIST_LIMIT: i64 = 6;

#[derive(Deserialize)]
pub(super) struct ListQuery {
    limit: Option<i64>,
}

#[derive(Deserialize)]
pub(super) struct StartQuery {
    concurrency: Option<i64>,
}

/// Block row as presented to clients.
#[derive(Serialize)]
pub(super) struct BlockView {
    id: i64,
    start: i64,
    end_excl: i64,
    label: String,
    candidate_count: i64,
    tested_count: i64,
    verified_count: i64,
    status: crate::db::BlockStatus,
    created_at: chrono::DateTime<chrono::Utc>,
    started_at: Option<chrono::DateTime<chrono::Utc>>,
    finished_at: Option<chrono::DateTime<chrono::Utc>>,
}

impl From<BlockRow> for BlockView {
    fn from(b: BlockRow) -> Self {
        BlockView {
            label: block_label(b.id),
            id: b.id,
            start: b.start_p,
            end_excl: b.end_p_excl,
            candidate_count: b.candidate_count,
            tested_count: b.tested_count,
            verified_count: b.verified_count,
            status: b.status,
            created_at: b.created_at,
            started_at: b.started_at,
            finished_at: b.finished_at,
        }
    }
}

/// Human range label in millions, e.g. `"2–3M"` for block 2.
fn block_label(id: i64) -> String {
    format!("{}\u{2013}{}M", id, id + 1)
}

#[derive(Serialize)]
pub(super) struct BlockDetail {
    block: BlockView,
    exponents: Vec<UnitRow>,
}

/// `GET /api/blocks?limit=N`
pub(super) async fn handler_api_blocks(
    State(state): State<Arc<AppState>>,
    Query(params): Query<ListQuery>,
) -> Result<Json<Vec<BlockView>>, SchedulerError> {
    let limit = params.limit.unwrap_or(DEFAULT_LIST_LIMIT);
    let rows = state.scheduler.list_blocks(limit).await?;
    Ok(Json(rows.into_iter().map(BlockView::from).collect()))
}

/// `GET /api/blocks/{id}`
pub(super) async fn handler_api_block(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Result<Json<BlockDetail>, SchedulerError> {
    let (block, exponents) = state.scheduler.block_detail(id).await?;
    Ok(Json(BlockDetail {
        block: block.into(),
        exponents,
    }))
}

/// `POST /api/blocks/{id}/start?concurrency=N`
pub(super) async fn handler_api_block_start(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    Query(params): Query<StartQuery>,
) -> Result<impl IntoResponse, SchedulerError> {
    let requested = params.concurrency.unwrap_or(1);
    let concurrency = usize::try_from(requested)
        .ok()
        .filter(|c| *c >= 1)
        .ok_or_else(|| {
            SchedulerError::Validation(format!("concurrency must be >= 1, got {}", requested))
        })?;
    let outcome = state.scheduler.start(id, concurrency).await?;
    Ok(Json(outcome))
}

/// `POST /api/blocks/{id}/stop`
pub(super) async fn handler_api_block_stop(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> impl IntoResponse {
    Json(state.scheduler.stop(id))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn label_uses_en_dash_millions() {
        assert_eq!(block_label(0), "0–1M");
        assert_eq!(block_label(41), "41–42M");
    }
}

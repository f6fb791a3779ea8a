//! # Single-Exponent Jobs API
//!
//! | Endpoint | Response |
//! |----------|----------|
//! | `POST /api/jobs` `{p, progress_stride?}` | `{id}`; 400 when p < 2 |
//! | `GET /api/jobs/{id}` | `{id, p, status, result, error}`; 404 if unknown |
//!
//! Progress for a job streams on `GET /ws/jobs/{id}`.

use super::AppState;
use crate::jobs::JobRecord;
use crate::scheduler::SchedulerError;
use axum::extract::{Path, State};
use axum::Json;
use serde::Deserialize;
use std::sync::Arc;
use uuid::Uuid;

#[derive(Deserialize)]
pub(super) struct CreateJob {
    p: i64,
    /// Iterations between checkpoints; absent or 0 means ~1%.
    progress_stride: Option<i64>,
}

/// Job ids are accepted in simple (32 hex) or hyphenated form.
pub(super) fn parse_job_id(raw: &str) -> Result<Uuid, SchedulerError> {
    Uuid::parse_str(raw).map_err(|_| SchedulerError::NotFound("job".to_string()))
}

/// `POST /api/jobs`
pub(super) async fn handler_api_job_create(
    State(state): State<Arc<AppState>>,
    Json(body): Json<CreateJob>,
) -> Result<Json<serde_json::Value>, SchedulerError> {
    let id = state.scheduler.submit_job(body.p, body.progress_stride)?;
    Ok(Json(serde_json::json!({ "id": id.simple().to_string() })))
}

/// `GET /api/jobs/{id}`
pub(super) async fn handler_api_job(
    State(state): State<Arc<AppState>>,
    Path(raw): Path<String>,
) -> Result<Json<JobRecord>, SchedulerError> {
    let id = parse_job_id(&raw)?;
    state
        .scheduler
        .job(&id)
        .map(Json)
        .ok_or_else(|| SchedulerError::NotFound("job".to_string()))
}

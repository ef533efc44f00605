//! API route definitions.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{Html, IntoResponse, Response};
use axum::{routing::get, Json, Router};
use chrono::Utc;
use serde::Deserialize;
use serde_json::{json, Value};
use uuid::Uuid;

use super::state::AppState;
use crate::dashboard::DashboardView;
use crate::history::HistoryError;
use crate::pipeline::summary;

pub fn api_routes() -> Router<AppState> {
    Router::new()
        .route("/health", get(health))
        .route("/summary", get(get_summary))
        .route("/runs", get(list_runs))
        .route("/runs/{run_id}", get(get_run))
        .route("/releases", get(list_releases))
        .route("/schedules", get(list_schedules))
        .route("/schedules/dry-run", get(schedule_dry_run))
}

/// Error body in the same envelope as successful responses.
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn not_found(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: message.into(),
        }
    }
}

impl From<HistoryError> for ApiError {
    fn from(error: HistoryError) -> Self {
        tracing::error!(error = %error, "History read failed");
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: error.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(json!({ "data": null, "error": { "message": self.message } })),
        )
            .into_response()
    }
}

fn envelope(data: Value, meta: Value) -> Json<Value> {
    Json(json!({ "data": data, "meta": meta }))
}

async fn health() -> Json<Value> {
    envelope(
        json!({ "status": "ok", "version": env!("CARGO_PKG_VERSION") }),
        json!({ "timestamp": Utc::now().to_rfc3339() }),
    )
}

async fn get_summary(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let view = summary(&state.load_history().await?);
    Ok(envelope(json!(view), json!({})))
}

#[derive(Debug, Deserialize)]
struct ListParams {
    limit: Option<usize>,
}

async fn list_runs(
    State(state): State<AppState>,
    Query(params): Query<ListParams>,
) -> Result<Json<Value>, ApiError> {
    let history = state.load_history().await?;
    let total = history.runs.len();
    let runs: Vec<_> = history
        .runs
        .into_iter()
        .rev()
        .take(params.limit.unwrap_or(usize::MAX))
        .collect();
    Ok(envelope(json!(runs), json!({ "total": total })))
}

async fn get_run(
    State(state): State<AppState>,
    Path(run_id): Path<Uuid>,
) -> Result<Json<Value>, ApiError> {
    let history = state.load_history().await?;
    let run = history
        .runs
        .into_iter()
        .find(|r| r.run_id == run_id)
        .ok_or_else(|| ApiError::not_found(format!("run {} not in history", run_id)))?;
    Ok(envelope(json!(run), json!({})))
}

async fn list_releases(
    State(state): State<AppState>,
    Query(params): Query<ListParams>,
) -> Result<Json<Value>, ApiError> {
    let history = state.load_history().await?;
    let total = history.releases.len();
    let releases: Vec<_> = history
        .releases
        .into_iter()
        .rev()
        .take(params.limit.unwrap_or(usize::MAX))
        .collect();
    Ok(envelope(json!(releases), json!({ "total": total })))
}

async fn list_schedules(State(state): State<AppState>) -> Json<Value> {
    let exprs: Vec<&str> = state.scheduler.expressions().collect();
    envelope(json!(exprs), json!({ "total": exprs.len() }))
}

#[derive(Debug, Deserialize)]
struct DryRunParams {
    hours: Option<u64>,
}

async fn schedule_dry_run(
    State(state): State<AppState>,
    Query(params): Query<DryRunParams>,
) -> Json<Value> {
    let hours = params.hours.unwrap_or(24);
    let upcoming: Vec<Value> = state
        .scheduler
        .preview_next_runs(Utc::now(), hours)
        .into_iter()
        .map(|(at, expr)| json!({ "at": at.to_rfc3339(), "cron": expr }))
        .collect();
    envelope(json!({ "upcoming": upcoming }), json!({ "hours": hours }))
}

/// The HTML dashboard, rendered on each request.
pub async fn dashboard(State(state): State<AppState>) -> Result<Html<String>, ApiError> {
    let view = DashboardView::build(&summary(&state.load_history().await?), Utc::now());
    let html = view.to_html().map_err(|e| ApiError {
        status: StatusCode::INTERNAL_SERVER_ERROR,
        message: format!("{:#}", e),
    })?;
    Ok(Html(html))
}

//! API layer -- read-only axum routes over run history.

mod routes;
pub mod state;

use axum::routing::get;
use axum::Router;
use tower_http::trace::TraceLayer;

use self::state::AppState;

/// Build the application router with all API routes.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(routes::dashboard))
        .route("/dashboard", get(routes::dashboard))
        .nest("/api/v1", routes::api_routes())
        .fallback(fallback)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn fallback() -> (axum::http::StatusCode, &'static str) {
    (axum::http::StatusCode::NOT_FOUND, "not found")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ScheduleConfig;
    use crate::history::testing::{release_record, run_record};
    use crate::history::{HistoryStore, MemoryHistory};
    use crate::scheduler::Scheduler;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use serde_json::Value;
    use std::sync::Arc;
    use tower::ServiceExt;

    fn app(store: Arc<MemoryHistory>) -> Router {
        let scheduler = Scheduler::from_config(&ScheduleConfig::default()).unwrap();
        router(AppState::new(store, scheduler))
    }

    async fn get_json(app: Router, uri: &str) -> (StatusCode, Value) {
        let response = app
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap_or(Value::Null))
    }

    #[tokio::test]
    async fn test_health() {
        let (status, body) = get_json(app(Arc::new(MemoryHistory::new())), "/api/v1/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["status"], "ok");
    }

    #[tokio::test]
    async fn test_summary_on_empty_history() {
        let (status, body) = get_json(app(Arc::new(MemoryHistory::new())), "/api/v1/summary").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["total_runs"], 0);
        assert!(body["data"]["success_rate"].is_null());
    }

    #[tokio::test]
    async fn test_runs_newest_first_with_limit() {
        let store = Arc::new(MemoryHistory::new());
        let runs: Vec<_> = (0..3).map(|_| run_record()).collect();
        for r in &runs {
            store.append_run(r).unwrap();
        }

        let (_, body) = get_json(app(store.clone()), "/api/v1/runs?limit=2").await;
        assert_eq!(body["meta"]["total"], 3);
        let data = body["data"].as_array().unwrap();
        assert_eq!(data.len(), 2);
        assert_eq!(data[0]["run_id"], runs[2].run_id.to_string());

        let uri = format!("/api/v1/runs/{}", runs[0].run_id);
        let (status, body) = get_json(app(store), &uri).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["run_id"], runs[0].run_id.to_string());
    }

    #[tokio::test]
    async fn test_unknown_run_is_404() {
        let uri = format!("/api/v1/runs/{}", uuid::Uuid::new_v4());
        let (status, body) = get_json(app(Arc::new(MemoryHistory::new())), &uri).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert!(body["error"]["message"].as_str().unwrap().contains("not in history"));
    }

    #[tokio::test]
    async fn test_releases_and_dry_run() {
        let store = Arc::new(MemoryHistory::new());
        store.append_release(&release_record("patched-2026-01-01")).unwrap();

        let (_, body) = get_json(app(store.clone()), "/api/v1/releases").await;
        assert_eq!(body["data"][0]["release_id"], "patched-2026-01-01");

        let (_, body) = get_json(app(store), "/api/v1/schedules/dry-run?hours=48").await;
        assert_eq!(body["data"]["upcoming"].as_array().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_dashboard_is_html() {
        let response = app(Arc::new(MemoryHistory::new()))
            .oneshot(Request::builder().uri("/dashboard").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let content_type = response.headers()["content-type"].to_str().unwrap().to_string();
        assert!(content_type.starts_with("text/html"));
    }

    #[tokio::test]
    async fn test_fallback_404() {
        let response = app(Arc::new(MemoryHistory::new()))
            .oneshot(Request::builder().uri("/nope").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}

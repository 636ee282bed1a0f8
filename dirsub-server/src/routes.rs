use axum::{
    Json, Router,
    routing::{get, post},
};
use dirsub_core::api::API_PREFIX;
use serde_json::{Value, json};
use tower_http::trace::TraceLayer;

use crate::handlers::{feed, staff, worker};
use crate::state::AppState;

/// Create all v1 API routes
pub fn create_v1_router() -> Router<AppState> {
    Router::new()
        // Worker protocol
        .route("/worker/jobs/request", post(worker::request_job))
        .route("/worker/jobs/{job_id}/progress", post(worker::report_progress))
        .route("/worker/jobs/{job_id}/complete", post(worker::complete_job))
        .route("/worker/jobs/{job_id}/heartbeat", post(worker::heartbeat))
        .route("/worker/jobs/{job_id}/release", post(worker::release))
        // Provisioning and staff operations
        .route("/jobs", post(staff::create_job))
        .route("/jobs/{job_id}", get(staff::get_job))
        .route("/jobs/{job_id}/pause", post(staff::pause_job))
        .route("/jobs/{job_id}/resume", post(staff::resume_job))
        .route(
            "/jobs/{job_id}/submissions/{submission_id}/retry",
            post(staff::retry_submission),
        )
        // Dashboards
        .route("/feed", get(feed::feed_page))
        .route("/feed/stream", get(feed::feed_stream))
}

pub fn create_app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .nest(API_PREFIX, create_v1_router())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

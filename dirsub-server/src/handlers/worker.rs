//! Worker protocol endpoints. Every call names the worker; lease ownership
//! is checked by the store, never here.

use axum::{
    Json,
    extract::{Path, State},
};
use dirsub_core::api::{CompleteRequest, HeartbeatRequest, ProgressRequest, WorkerRequest};
use dirsub_core::{Job, JobAssignment, JobId, Lease, OrchestratorApi, ProgressReport};
use tracing::debug;
use uuid::Uuid;

use crate::errors::AppResult;
use crate::state::AppState;

pub async fn request_job(
    State(state): State<AppState>,
    Json(request): Json<WorkerRequest>,
) -> AppResult<Json<JobAssignment>> {
    let assignment = state.service.request_job(&request.worker_id).await?;
    if let JobAssignment::Assigned(grant) = &assignment {
        debug!(
            worker_id = %request.worker_id,
            job_id = %grant.job.id,
            pending = grant.submissions.len(),
            "job assigned"
        );
    }
    Ok(Json(assignment))
}

pub async fn report_progress(
    State(state): State<AppState>,
    Path(job_id): Path<Uuid>,
    Json(request): Json<ProgressRequest>,
) -> AppResult<Json<Job>> {
    let report = ProgressReport {
        job_id: JobId(job_id),
        submission_id: request.submission_id,
        sequence: request.sequence,
        outcome: request.outcome,
        attempts: request.attempts,
    };
    let job = state
        .service
        .report_progress(&request.worker_id, report)
        .await?;
    Ok(Json(job))
}

pub async fn complete_job(
    State(state): State<AppState>,
    Path(job_id): Path<Uuid>,
    Json(request): Json<CompleteRequest>,
) -> AppResult<Json<Job>> {
    let job = state
        .service
        .complete_job(&request.worker_id, JobId(job_id), request.summary)
        .await?;
    Ok(Json(job))
}

pub async fn heartbeat(
    State(state): State<AppState>,
    Path(job_id): Path<Uuid>,
    Json(request): Json<HeartbeatRequest>,
) -> AppResult<Json<Lease>> {
    let lease = state
        .service
        .heartbeat(&request.worker_id, JobId(job_id), request.current_target)
        .await?;
    Ok(Json(lease))
}

pub async fn release(
    State(state): State<AppState>,
    Path(job_id): Path<Uuid>,
    Json(request): Json<WorkerRequest>,
) -> AppResult<Json<Job>> {
    let job = state
        .service
        .release(&request.worker_id, JobId(job_id))
        .await?;
    Ok(Json(job))
}

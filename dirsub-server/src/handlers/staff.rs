use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
};
use dirsub_core::{JobDetail, JobId, JobView, NewJob, SubmissionId, SubmissionUpdate};
use uuid::Uuid;

use crate::errors::AppResult;
use crate::state::AppState;

/// Provisioning: create a queued job with one pending submission per target.
pub async fn create_job(
    State(state): State<AppState>,
    Json(new_job): Json<NewJob>,
) -> AppResult<(StatusCode, Json<JobDetail>)> {
    let (job, submissions) = state.service.create_job(new_job).await?;
    Ok((
        StatusCode::CREATED,
        Json(JobDetail {
            job: job.into(),
            submissions,
        }),
    ))
}

pub async fn get_job(
    State(state): State<AppState>,
    Path(job_id): Path<Uuid>,
) -> AppResult<Json<JobDetail>> {
    Ok(Json(state.feed.job_detail(JobId(job_id)).await?))
}

pub async fn pause_job(
    State(state): State<AppState>,
    Path(job_id): Path<Uuid>,
) -> AppResult<Json<JobView>> {
    let job = state.service.pause_job(JobId(job_id)).await?;
    Ok(Json(job.into()))
}

pub async fn resume_job(
    State(state): State<AppState>,
    Path(job_id): Path<Uuid>,
) -> AppResult<Json<JobView>> {
    let job = state.service.resume_job(JobId(job_id)).await?;
    Ok(Json(job.into()))
}

pub async fn retry_submission(
    State(state): State<AppState>,
    Path((job_id, submission_id)): Path<(Uuid, Uuid)>,
) -> AppResult<Json<SubmissionUpdate>> {
    let update = state
        .service
        .retry_submission(JobId(job_id), SubmissionId(submission_id))
        .await?;
    Ok(Json(update))
}

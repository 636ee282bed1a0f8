use thiserror::Error;

use crate::job::{JobId, JobStatus, SubmissionId, SubmissionStatus};

#[derive(Error, Debug)]
pub enum DirsubError {
    /// The caller does not hold a live lease on the job. The worker must stop
    /// processing it immediately.
    #[error("lease mismatch on job {job_id}: {reason}")]
    LeaseMismatch { job_id: JobId, reason: String },

    #[error("job {job_id} still has {pending} pending submission(s)")]
    IncompleteSubmissions { job_id: JobId, pending: u32 },

    /// Progress update carried a sequence number at or below the last applied one.
    #[error(
        "sequence conflict on job {job_id}: received {received}, last applied {last_applied}"
    )]
    SequenceConflict {
        job_id: JobId,
        last_applied: i64,
        received: i64,
    },

    #[error("submission {submission_id} cannot move from {from} to {to}")]
    InvalidTransition {
        submission_id: SubmissionId,
        from: SubmissionStatus,
        to: SubmissionStatus,
    },

    #[error("job {job_id} is {status}: {reason}")]
    InvalidState {
        job_id: JobId,
        status: JobStatus,
        reason: String,
    },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[cfg(feature = "database")]
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Network or protocol failure talking to a remote orchestrator.
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl DirsubError {
    /// Stable snake_case code used on the wire.
    pub fn code(&self) -> &'static str {
        match self {
            DirsubError::LeaseMismatch { .. } => "lease_mismatch",
            DirsubError::IncompleteSubmissions { .. } => "incomplete_submissions",
            DirsubError::SequenceConflict { .. } => "sequence_conflict",
            DirsubError::InvalidTransition { .. } => "invalid_transition",
            DirsubError::InvalidState { .. } => "invalid_state",
            DirsubError::NotFound(_) => "not_found",
            DirsubError::Validation(_) => "validation",
            #[cfg(feature = "database")]
            DirsubError::Database(_) => "database",
            DirsubError::Serialization(_) => "serialization",
            DirsubError::Transport(_) => "transport",
            DirsubError::Internal(_) => "internal",
        }
    }

    pub fn lease_mismatch(job_id: JobId, reason: impl Into<String>) -> Self {
        DirsubError::LeaseMismatch {
            job_id,
            reason: reason.into(),
        }
    }

    pub fn job_not_found(job_id: JobId) -> Self {
        DirsubError::NotFound(format!("job {job_id}"))
    }

    pub fn submission_not_found(submission_id: SubmissionId) -> Self {
        DirsubError::NotFound(format!("submission {submission_id}"))
    }
}

pub type Result<T> = std::result::Result<T, DirsubError>;

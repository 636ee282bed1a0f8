use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use dirsub_core::DirsubError;
use dirsub_core::api::{WireError, WireErrorBody};
use serde_json::Value;
use std::fmt;
use tracing::error;

pub type AppResult<T> = Result<T, AppError>;

#[derive(Debug)]
pub struct AppError {
    pub status: StatusCode,
    pub code: String,
    pub message: String,
    pub details: Option<Value>,
}

impl AppError {
    pub fn new(status: StatusCode, code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            status,
            code: code.into(),
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: Option<Value>) -> Self {
        self.details = details;
        self
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for AppError {}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = Json(WireError {
            error: WireErrorBody {
                code: self.code,
                message: self.message,
                status: self.status.as_u16(),
                details: self.details,
            },
        });

        (self.status, body).into_response()
    }
}

impl From<DirsubError> for AppError {
    fn from(err: DirsubError) -> Self {
        let status = match &err {
            DirsubError::LeaseMismatch { .. }
            | DirsubError::IncompleteSubmissions { .. }
            | DirsubError::SequenceConflict { .. }
            | DirsubError::InvalidTransition { .. }
            | DirsubError::InvalidState { .. } => StatusCode::CONFLICT,
            DirsubError::NotFound(_) => StatusCode::NOT_FOUND,
            DirsubError::Validation(_) | DirsubError::Serialization(_) => StatusCode::BAD_REQUEST,
            DirsubError::Transport(_) => StatusCode::BAD_GATEWAY,
            DirsubError::Database(_) | DirsubError::Internal(_) => {
                error!(error = %err, "request failed");
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };

        Self::new(status, err.code(), err.to_string()).with_details(err.wire_details())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dirsub_core::JobId;

    #[test]
    fn conflicts_map_to_409_with_details() {
        let err = AppError::from(DirsubError::SequenceConflict {
            job_id: JobId::new(),
            last_applied: 7,
            received: 7,
        });
        assert_eq!(err.status, StatusCode::CONFLICT);
        assert_eq!(err.code, "sequence_conflict");
        assert_eq!(err.details.as_ref().map(|d| d["last_applied"].clone()), Some(7.into()));
    }

    #[test]
    fn not_found_and_validation_statuses() {
        assert_eq!(
            AppError::from(DirsubError::job_not_found(JobId::new())).status,
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            AppError::from(DirsubError::Validation("empty".into())).status,
            StatusCode::BAD_REQUEST
        );
    }
}

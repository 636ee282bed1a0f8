//! Request/response bodies shared by the HTTP server and the worker client.

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::error::DirsubError;
use crate::job::{JobId, JobStatus, SubmissionId, SubmissionStatus, WorkerId};
use crate::progress::{CompletionSummary, ProgressOutcome};

pub const API_PREFIX: &str = "/api/v1";

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WorkerRequest {
    pub worker_id: WorkerId,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ProgressRequest {
    pub worker_id: WorkerId,
    pub submission_id: SubmissionId,
    pub sequence: i64,
    pub outcome: ProgressOutcome,
    pub attempts: u32,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CompleteRequest {
    pub worker_id: WorkerId,
    #[serde(default)]
    pub summary: CompletionSummary,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct HeartbeatRequest {
    pub worker_id: WorkerId,
    #[serde(default)]
    pub current_target: Option<String>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedQuery {
    #[serde(default)]
    pub since: Option<i64>,
    #[serde(default)]
    pub limit: Option<usize>,
}

/// Body of every error response: `{"error": {...}}`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WireError {
    pub error: WireErrorBody,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WireErrorBody {
    pub code: String,
    pub message: String,
    pub status: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

#[derive(Deserialize)]
struct JobDetails {
    job_id: JobId,
}

#[derive(Deserialize)]
struct LeaseDetails {
    job_id: JobId,
    reason: String,
}

#[derive(Deserialize)]
struct SequenceDetails {
    job_id: JobId,
    last_applied: i64,
    received: i64,
}

#[derive(Deserialize)]
struct IncompleteDetails {
    job_id: JobId,
    pending: u32,
}

#[derive(Deserialize)]
struct TransitionDetails {
    submission_id: SubmissionId,
    from: SubmissionStatus,
    to: SubmissionStatus,
}

#[derive(Deserialize)]
struct StateDetails {
    job_id: JobId,
    status: JobStatus,
    reason: String,
}

fn details<T: for<'de> Deserialize<'de>>(body: &WireErrorBody) -> Option<T> {
    body.details
        .clone()
        .and_then(|value| serde_json::from_value(value).ok())
}

impl DirsubError {
    /// Structured fields that let a client rebuild the error.
    pub fn wire_details(&self) -> Option<Value> {
        match self {
            DirsubError::LeaseMismatch { job_id, reason } => {
                Some(json!({ "job_id": job_id, "reason": reason }))
            }
            DirsubError::IncompleteSubmissions { job_id, pending } => {
                Some(json!({ "job_id": job_id, "pending": pending }))
            }
            DirsubError::SequenceConflict {
                job_id,
                last_applied,
                received,
            } => Some(json!({
                "job_id": job_id,
                "last_applied": last_applied,
                "received": received,
            })),
            DirsubError::InvalidTransition {
                submission_id,
                from,
                to,
            } => Some(json!({ "submission_id": submission_id, "from": from, "to": to })),
            DirsubError::InvalidState {
                job_id,
                status,
                reason,
            } => Some(json!({ "job_id": job_id, "status": status, "reason": reason })),
            _ => None,
        }
    }

    /// Map an error response back onto the domain error. Unknown codes, or
    /// known codes with unreadable details, come back as `Internal`.
    pub fn from_wire(body: &WireErrorBody) -> Self {
        let rebuilt = match body.code.as_str() {
            "lease_mismatch" => details::<LeaseDetails>(body)
                .map(|d| DirsubError::LeaseMismatch {
                    job_id: d.job_id,
                    reason: d.reason,
                })
                .or_else(|| {
                    details::<JobDetails>(body)
                        .map(|d| DirsubError::lease_mismatch(d.job_id, body.message.clone()))
                }),
            "incomplete_submissions" => {
                details::<IncompleteDetails>(body).map(|d| DirsubError::IncompleteSubmissions {
                    job_id: d.job_id,
                    pending: d.pending,
                })
            }
            "sequence_conflict" => {
                details::<SequenceDetails>(body).map(|d| DirsubError::SequenceConflict {
                    job_id: d.job_id,
                    last_applied: d.last_applied,
                    received: d.received,
                })
            }
            "invalid_transition" => {
                details::<TransitionDetails>(body).map(|d| DirsubError::InvalidTransition {
                    submission_id: d.submission_id,
                    from: d.from,
                    to: d.to,
                })
            }
            "invalid_state" => details::<StateDetails>(body).map(|d| DirsubError::InvalidState {
                job_id: d.job_id,
                status: d.status,
                reason: d.reason,
            }),
            "not_found" => Some(DirsubError::NotFound(body.message.clone())),
            "validation" => Some(DirsubError::Validation(body.message.clone())),
            _ => None,
        };

        rebuilt.unwrap_or_else(|| {
            DirsubError::Internal(format!(
                "{} ({}): {}",
                body.code, body.status, body.message
            ))
        })
    }
}

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::Result;
use crate::job::{FailureReason, Job, JobStatus, JobView, SubmissionId, SubmissionStatus, WorkerId};

/// Metadata envelope attached to every job event.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EventMeta {
    pub version: u16,
    pub event_id: Uuid,
    pub occurred_at: DateTime<Utc>,
}

impl EventMeta {
    pub fn new() -> Self {
        Self {
            version: 1,
            event_id: Uuid::now_v7(),
            occurred_at: Utc::now(),
        }
    }
}

impl Default for EventMeta {
    fn default() -> Self {
        Self::new()
    }
}

/// What happened to the job.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JobEventPayload {
    Created,
    Assigned {
        worker_id: WorkerId,
    },
    Progress {
        submission_id: SubmissionId,
        target_name: String,
        status: SubmissionStatus,
        sequence: i64,
    },
    Released {
        worker_id: WorkerId,
    },
    Finished {
        status: JobStatus,
        failure_reason: Option<FailureReason>,
    },
    Paused,
    Resumed,
    SubmissionRetried {
        submission_id: SubmissionId,
    },
    /// Lease lapsed and the job went back to the queue.
    LeaseExpired,
    /// Lease lapsed too many times in a row; the job failed.
    WorkerUnavailable,
}

/// Job event with the post-mutation snapshot, as pushed to dashboards.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct JobEvent {
    pub meta: EventMeta,
    pub job: JobView,
    pub payload: JobEventPayload,
}

impl JobEvent {
    pub fn new(job: &Job, payload: JobEventPayload) -> Self {
        Self {
            meta: EventMeta::new(),
            job: job.view(),
            payload,
        }
    }

    pub fn revision(&self) -> i64 {
        self.job.job.revision
    }
}

#[async_trait]
pub trait JobEventPublisher: Send + Sync + std::fmt::Debug {
    async fn publish(&self, event: JobEvent) -> Result<()>;
}

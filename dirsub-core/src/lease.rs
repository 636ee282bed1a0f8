use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::job::{Job, JobId, Submission, WorkerId};

/// Exclusive, time-bounded claim on a job.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    pub worker_id: WorkerId,
    pub job_id: JobId,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    /// Sequence numbers for this job must continue above this value.
    pub last_sequence: i64,
}

impl Lease {
    /// Lease currently recorded on the job row, if any.
    pub fn from_job(job: &Job) -> Option<Self> {
        Some(Self {
            worker_id: job.lease_owner.clone()?,
            job_id: job.id,
            acquired_at: job.lease_acquired_at?,
            expires_at: job.lease_expires_at?,
            last_sequence: job.last_sequence,
        })
    }
}

/// Everything a worker receives on assignment.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LeaseGrant {
    pub lease: Lease,
    pub job: Job,
    /// Pending submissions only, in position order.
    pub submissions: Vec<Submission>,
}

/// Result of one `acquire_next` pass.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct AcquireOutcome {
    pub grant: Option<LeaseGrant>,
    /// Jobs found with an expired lease that exhausted their expiry budget on the way.
    pub failed_out: Vec<Job>,
}

/// Jobs touched by one housekeeping sweep.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SweepReport {
    pub requeued: Vec<Job>,
    pub worker_unavailable: Vec<Job>,
}

impl SweepReport {
    pub fn is_empty(&self) -> bool {
        self.requeued.is_empty() && self.worker_unavailable.is_empty()
    }
}

/// Answer to `request_job`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum JobAssignment {
    Assigned(LeaseGrant),
    NoWorkAvailable,
}

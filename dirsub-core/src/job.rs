use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::{DirsubError, Result};
use crate::progress::CompletionSummary;

/// Unique identifier for submission jobs.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub Uuid);

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique identifier for a single directory target inside a job.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SubmissionId(pub Uuid);

impl Default for SubmissionId {
    fn default() -> Self {
        Self::new()
    }
}

impl SubmissionId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl fmt::Display for SubmissionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Opaque worker identity. Workers pick their own ids; uniqueness is their concern.
#[derive(Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkerId(pub String);

impl WorkerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for WorkerId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    InProgress,
    Paused,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::InProgress => "in_progress",
            JobStatus::Paused => "paused",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = DirsubError;

    fn from_str(value: &str) -> Result<Self> {
        match value {
            "queued" => Ok(JobStatus::Queued),
            "in_progress" => Ok(JobStatus::InProgress),
            "paused" => Ok(JobStatus::Paused),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            other => Err(DirsubError::Internal(format!("unknown job status: {other}"))),
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubmissionStatus {
    Pending,
    Submitted,
    Approved,
    Failed,
}

impl SubmissionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubmissionStatus::Pending => "pending",
            SubmissionStatus::Submitted => "submitted",
            SubmissionStatus::Approved => "approved",
            SubmissionStatus::Failed => "failed",
        }
    }

    /// Progress transitions a worker may report.
    pub fn can_transition_to(&self, next: SubmissionStatus) -> bool {
        matches!(
            (self, next),
            (
                SubmissionStatus::Pending,
                SubmissionStatus::Submitted | SubmissionStatus::Approved | SubmissionStatus::Failed
            ) | (SubmissionStatus::Submitted, SubmissionStatus::Approved)
        )
    }

    /// Counted towards `completed_count`.
    pub fn is_success(&self) -> bool {
        matches!(self, SubmissionStatus::Submitted | SubmissionStatus::Approved)
    }
}

impl fmt::Display for SubmissionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SubmissionStatus {
    type Err = DirsubError;

    fn from_str(value: &str) -> Result<Self> {
        match value {
            "pending" => Ok(SubmissionStatus::Pending),
            "submitted" => Ok(SubmissionStatus::Submitted),
            "approved" => Ok(SubmissionStatus::Approved),
            "failed" => Ok(SubmissionStatus::Failed),
            other => Err(DirsubError::Internal(format!(
                "unknown submission status: {other}"
            ))),
        }
    }
}

/// Why a submission ended up `failed`.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubmissionErrorKind {
    /// Retried locally until the attempt budget ran out.
    TransientExhausted,
    Permanent,
}

impl SubmissionErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubmissionErrorKind::TransientExhausted => "transient_exhausted",
            SubmissionErrorKind::Permanent => "permanent",
        }
    }
}

impl FromStr for SubmissionErrorKind {
    type Err = DirsubError;

    fn from_str(value: &str) -> Result<Self> {
        match value {
            "transient_exhausted" => Ok(SubmissionErrorKind::TransientExhausted),
            "permanent" => Ok(SubmissionErrorKind::Permanent),
            other => Err(DirsubError::Internal(format!(
                "unknown submission error kind: {other}"
            ))),
        }
    }
}

/// Reason recorded on a job that ended `failed`.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    /// At least one submission failed.
    SubmissionFailures,
    /// The lease expired too many times in a row.
    WorkerUnavailable,
}

impl FailureReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureReason::SubmissionFailures => "submission_failures",
            FailureReason::WorkerUnavailable => "worker_unavailable",
        }
    }
}

impl FromStr for FailureReason {
    type Err = DirsubError;

    fn from_str(value: &str) -> Result<Self> {
        match value {
            "submission_failures" => Ok(FailureReason::SubmissionFailures),
            "worker_unavailable" => Ok(FailureReason::WorkerUnavailable),
            other => Err(DirsubError::Internal(format!(
                "unknown failure reason: {other}"
            ))),
        }
    }
}

/// Business listing that gets entered into every directory of a job.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BusinessProfile {
    pub name: String,
    pub address: String,
    pub city: String,
    pub state: String,
    pub zip: String,
    pub phone: String,
    pub website: String,
    pub email: String,
    pub description: String,
    /// Directory specific fields (categories, hours, social links...).
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// One customer's batch of directory submissions.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub customer_id: String,
    /// Higher is more urgent.
    pub priority_level: i32,
    pub target_count: u32,
    pub completed_count: u32,
    pub failed_count: u32,
    pub status: JobStatus,
    pub failure_reason: Option<FailureReason>,
    pub payload: BusinessProfile,
    pub current_target_hint: Option<String>,
    pub lease_owner: Option<WorkerId>,
    pub lease_acquired_at: Option<DateTime<Utc>>,
    pub lease_expires_at: Option<DateTime<Utc>>,
    /// Consecutive lease expiries since the last accepted progress report.
    pub lease_expiries: u32,
    /// Highest progress sequence number applied so far.
    pub last_sequence: i64,
    pub summary: Option<CompletionSummary>,
    /// Change feed cursor. Strictly increases on every mutation.
    pub revision: i64,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    pub fn progress_percent(&self) -> f64 {
        if self.target_count == 0 {
            return 0.0;
        }
        let ratio = f64::from(self.completed_count) / f64::from(self.target_count);
        (ratio * 100.0).clamp(0.0, 100.0)
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn has_live_lease(&self, now: DateTime<Utc>) -> bool {
        self.lease_owner.is_some() && self.lease_expires_at.is_some_and(|expires| expires > now)
    }

    /// Whether `acquire_next` may hand this job out at `now`.
    pub fn is_eligible(&self, now: DateTime<Utc>) -> bool {
        match self.status {
            JobStatus::Queued => true,
            JobStatus::InProgress => !self.has_live_lease(now),
            _ => false,
        }
    }

    /// Ensure `worker` holds a non-expired lease on this job.
    pub fn check_lease(&self, worker: &WorkerId, now: DateTime<Utc>) -> Result<()> {
        match &self.lease_owner {
            None => Err(DirsubError::lease_mismatch(self.id, "job holds no lease")),
            Some(owner) if owner != worker => Err(DirsubError::lease_mismatch(
                self.id,
                format!("job is leased by {owner}"),
            )),
            Some(_) => match self.lease_expires_at {
                Some(expires) if expires > now => Ok(()),
                Some(expires) => Err(DirsubError::lease_mismatch(
                    self.id,
                    format!("lease expired at {}", expires.to_rfc3339()),
                )),
                None => Err(DirsubError::lease_mismatch(self.id, "lease has no expiry")),
            },
        }
    }

    pub fn clear_lease(&mut self) {
        self.lease_owner = None;
        self.lease_acquired_at = None;
        self.lease_expires_at = None;
    }

    pub fn view(&self) -> JobView {
        JobView::from(self.clone())
    }
}

/// One directory target within a job.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Submission {
    pub id: SubmissionId,
    pub job_id: JobId,
    /// Processing order inside the job, starting at 0.
    pub position: u32,
    pub target_name: String,
    pub target_url: Option<String>,
    pub status: SubmissionStatus,
    pub attempt_count: u32,
    pub last_error_kind: Option<SubmissionErrorKind>,
    pub last_error_message: Option<String>,
    pub submitted_at: Option<DateTime<Utc>>,
    pub approved_at: Option<DateTime<Utc>>,
    pub failed_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

/// Target supplied by provisioning.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NewTarget {
    pub target_name: String,
    #[serde(default)]
    pub target_url: Option<String>,
}

impl NewTarget {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            target_name: name.into(),
            target_url: None,
        }
    }
}

/// Provisioning request creating a queued job with pending submissions.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NewJob {
    pub customer_id: String,
    #[serde(default)]
    pub priority_level: i32,
    #[serde(default)]
    pub payload: BusinessProfile,
    pub targets: Vec<NewTarget>,
}

impl NewJob {
    pub fn validate(&self) -> Result<()> {
        if self.customer_id.trim().is_empty() {
            return Err(DirsubError::Validation(
                "customer_id must not be empty".into(),
            ));
        }
        if self.targets.is_empty() {
            return Err(DirsubError::Validation(
                "a job needs at least one target".into(),
            ));
        }
        if let Some(index) = self
            .targets
            .iter()
            .position(|target| target.target_name.trim().is_empty())
        {
            return Err(DirsubError::Validation(format!(
                "target {index} has an empty name"
            )));
        }
        if u32::try_from(self.targets.len()).is_err() {
            return Err(DirsubError::Validation("too many targets".into()));
        }
        Ok(())
    }

    /// Build the job row and its pending submissions. The store assigns the revision.
    pub fn materialize(self, now: DateTime<Utc>) -> Result<(Job, Vec<Submission>)> {
        self.validate()?;
        let job_id = JobId::new();
        let submissions: Vec<Submission> = self
            .targets
            .into_iter()
            .enumerate()
            .map(|(position, target)| Submission {
                id: SubmissionId::new(),
                job_id,
                position: position as u32,
                target_name: target.target_name,
                target_url: target.target_url,
                status: SubmissionStatus::Pending,
                attempt_count: 0,
                last_error_kind: None,
                last_error_message: None,
                submitted_at: None,
                approved_at: None,
                failed_at: None,
                updated_at: now,
            })
            .collect();

        let job = Job {
            id: job_id,
            customer_id: self.customer_id,
            priority_level: self.priority_level,
            target_count: submissions.len() as u32,
            completed_count: 0,
            failed_count: 0,
            status: JobStatus::Queued,
            failure_reason: None,
            payload: self.payload,
            current_target_hint: None,
            lease_owner: None,
            lease_acquired_at: None,
            lease_expires_at: None,
            lease_expiries: 0,
            last_sequence: 0,
            summary: None,
            revision: 0,
            created_at: now,
            started_at: None,
            completed_at: None,
            updated_at: now,
        };

        Ok((job, submissions))
    }
}

/// Job as exposed to dashboards, with the derived progress figure.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct JobView {
    #[serde(flatten)]
    pub job: Job,
    pub progress_percent: f64,
}

impl From<Job> for JobView {
    fn from(job: Job) -> Self {
        let progress_percent = job.progress_percent();
        Self {
            job,
            progress_percent,
        }
    }
}

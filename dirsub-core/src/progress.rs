use serde::{Deserialize, Serialize};

use crate::job::{Job, JobId, Submission, SubmissionErrorKind, SubmissionId, SubmissionStatus};

/// One sequence-numbered progress update from the leasing worker.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ProgressReport {
    pub job_id: JobId,
    pub submission_id: SubmissionId,
    /// Strictly increasing per job across all workers that ever held it.
    pub sequence: i64,
    pub outcome: ProgressOutcome,
    /// Automation attempts spent on this submission, first try included.
    pub attempts: u32,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ProgressOutcome {
    Submitted,
    Approved,
    Failed {
        error_kind: SubmissionErrorKind,
        message: String,
    },
}

impl ProgressOutcome {
    pub fn target_status(&self) -> SubmissionStatus {
        match self {
            ProgressOutcome::Submitted => SubmissionStatus::Submitted,
            ProgressOutcome::Approved => SubmissionStatus::Approved,
            ProgressOutcome::Failed { .. } => SubmissionStatus::Failed,
        }
    }
}

/// Worker-side tally sent with `complete_job`.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletionSummary {
    pub submitted: u32,
    pub approved: u32,
    pub failed: u32,
    pub elapsed_ms: u64,
}

impl CompletionSummary {
    pub fn record(&mut self, outcome: &ProgressOutcome) {
        match outcome {
            ProgressOutcome::Submitted => self.submitted += 1,
            ProgressOutcome::Approved => self.approved += 1,
            ProgressOutcome::Failed { .. } => self.failed += 1,
        }
    }
}

/// Job and submission after a mutation that touched a single row.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SubmissionUpdate {
    pub job: Job,
    pub submission: Submission,
}

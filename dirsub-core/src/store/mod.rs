//! Durable home of jobs and submissions.
//!
//! The store is the only place lease ownership is resolved. Each method is a
//! single atomic unit: either all of its writes land or none do.

use async_trait::async_trait;
use std::fmt;

use crate::error::Result;
use crate::job::{Job, JobId, NewJob, Submission, SubmissionId, WorkerId};
use crate::lease::{AcquireOutcome, Lease, SweepReport};
use crate::progress::{CompletionSummary, ProgressReport, SubmissionUpdate};

pub mod memory;
#[cfg(feature = "database")]
pub mod postgres;

pub use memory::InMemoryJobStore;
#[cfg(feature = "database")]
pub use postgres::PostgresJobStore;

#[async_trait]
pub trait JobStore: Send + Sync + fmt::Debug {
    /// Insert a queued job and its pending submissions.
    async fn create_job(&self, new_job: NewJob) -> Result<(Job, Vec<Submission>)>;

    /// Lease the highest priority eligible job to `worker`.
    async fn acquire_next(&self, worker: &WorkerId) -> Result<AcquireOutcome>;

    async fn heartbeat(
        &self,
        worker: &WorkerId,
        job_id: JobId,
        current_target: Option<String>,
    ) -> Result<Lease>;

    async fn release(&self, worker: &WorkerId, job_id: JobId) -> Result<Job>;

    async fn apply_progress(
        &self,
        worker: &WorkerId,
        report: &ProgressReport,
    ) -> Result<SubmissionUpdate>;

    async fn complete(
        &self,
        worker: &WorkerId,
        job_id: JobId,
        summary: CompletionSummary,
    ) -> Result<Job>;

    async fn retry_submission(
        &self,
        job_id: JobId,
        submission_id: SubmissionId,
    ) -> Result<SubmissionUpdate>;

    async fn pause(&self, job_id: JobId) -> Result<Job>;

    async fn resume(&self, job_id: JobId) -> Result<Job>;

    /// Requeue or fail every in-progress job whose lease has lapsed.
    async fn sweep_expired_leases(&self) -> Result<SweepReport>;

    async fn get_job(&self, job_id: JobId) -> Result<Job>;

    /// All submissions of a job in position order.
    async fn list_submissions(&self, job_id: JobId) -> Result<Vec<Submission>>;

    /// Jobs with `revision > since`, ascending by revision.
    async fn changes_since(&self, since: i64, limit: usize) -> Result<Vec<Job>>;

    /// Highest revision committed so far; 0 for an empty store.
    async fn latest_revision(&self) -> Result<i64>;
}

//! Stateless request handling on top of a [`JobStore`].
//!
//! All exclusivity lives in the store, so any number of service instances can
//! run side by side. After every successful mutation the service publishes a
//! [`JobEvent`]; a failed publish is logged and never undoes the mutation.

use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::events::{JobEvent, JobEventPayload, JobEventPublisher};
use crate::job::{Job, JobId, NewJob, Submission, SubmissionId, WorkerId};
use crate::lease::{JobAssignment, Lease, SweepReport};
use crate::progress::{CompletionSummary, ProgressReport, SubmissionUpdate};
use crate::store::JobStore;

/// Operations a worker performs against the orchestrator. Implemented
/// in-process by [`OrchestratorService`] and over HTTP by the worker binary.
#[async_trait]
pub trait OrchestratorApi: Send + Sync + fmt::Debug {
    async fn request_job(&self, worker: &WorkerId) -> Result<JobAssignment>;

    /// Apply one progress report and return the refreshed job.
    async fn report_progress(&self, worker: &WorkerId, report: ProgressReport) -> Result<Job>;

    async fn complete_job(
        &self,
        worker: &WorkerId,
        job_id: JobId,
        summary: CompletionSummary,
    ) -> Result<Job>;

    async fn heartbeat(
        &self,
        worker: &WorkerId,
        job_id: JobId,
        current_target: Option<String>,
    ) -> Result<Lease>;

    async fn release(&self, worker: &WorkerId, job_id: JobId) -> Result<Job>;
}

#[derive(Clone)]
pub struct OrchestratorService {
    store: Arc<dyn JobStore>,
    events: Arc<dyn JobEventPublisher>,
}

impl fmt::Debug for OrchestratorService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OrchestratorService")
            .field("store", &self.store)
            .field("events", &self.events)
            .finish()
    }
}

impl OrchestratorService {
    pub fn new(store: Arc<dyn JobStore>, events: Arc<dyn JobEventPublisher>) -> Self {
        Self { store, events }
    }

    async fn publish(&self, job: &Job, payload: JobEventPayload) {
        let event = JobEvent::new(job, payload);
        if let Err(err) = self.events.publish(event).await {
            warn!(job_id = %job.id, error = %err, "failed to publish job event");
        }
    }

    /// Provisioning entry point.
    pub async fn create_job(&self, new_job: NewJob) -> Result<(Job, Vec<Submission>)> {
        let (job, submissions) = self.store.create_job(new_job).await?;
        info!(
            job_id = %job.id,
            customer_id = %job.customer_id,
            targets = job.target_count,
            priority = job.priority_level,
            "job created"
        );
        self.publish(&job, JobEventPayload::Created).await;
        Ok((job, submissions))
    }

    pub async fn retry_submission(
        &self,
        job_id: JobId,
        submission_id: SubmissionId,
    ) -> Result<SubmissionUpdate> {
        let update = self.store.retry_submission(job_id, submission_id).await?;
        info!(job_id = %job_id, submission_id = %submission_id, "submission reset for retry");
        self.publish(
            &update.job,
            JobEventPayload::SubmissionRetried { submission_id },
        )
        .await;
        Ok(update)
    }

    pub async fn pause_job(&self, job_id: JobId) -> Result<Job> {
        let job = self.store.pause(job_id).await?;
        info!(job_id = %job_id, "job paused");
        self.publish(&job, JobEventPayload::Paused).await;
        Ok(job)
    }

    pub async fn resume_job(&self, job_id: JobId) -> Result<Job> {
        let job = self.store.resume(job_id).await?;
        info!(job_id = %job_id, "job resumed");
        self.publish(&job, JobEventPayload::Resumed).await;
        Ok(job)
    }

    /// Housekeeping pass over lapsed leases.
    pub async fn sweep_expired_leases(&self) -> Result<SweepReport> {
        let report = self.store.sweep_expired_leases().await?;
        for job in &report.requeued {
            self.publish(job, JobEventPayload::LeaseExpired).await;
        }
        for job in &report.worker_unavailable {
            warn!(job_id = %job.id, expiries = job.lease_expiries, "job failed: worker unavailable");
            self.publish(job, JobEventPayload::WorkerUnavailable).await;
        }
        Ok(report)
    }
}

#[async_trait]
impl OrchestratorApi for OrchestratorService {
    async fn request_job(&self, worker: &WorkerId) -> Result<JobAssignment> {
        let outcome = self.store.acquire_next(worker).await?;
        for job in &outcome.failed_out {
            self.publish(job, JobEventPayload::WorkerUnavailable).await;
        }

        match outcome.grant {
            Some(grant) => {
                info!(
                    worker_id = %worker,
                    job_id = %grant.job.id,
                    pending = grant.submissions.len(),
                    "job assigned"
                );
                self.publish(
                    &grant.job,
                    JobEventPayload::Assigned {
                        worker_id: worker.clone(),
                    },
                )
                .await;
                Ok(JobAssignment::Assigned(grant))
            }
            None => {
                debug!(worker_id = %worker, "no work available");
                Ok(JobAssignment::NoWorkAvailable)
            }
        }
    }

    async fn report_progress(&self, worker: &WorkerId, report: ProgressReport) -> Result<Job> {
        let update = self.store.apply_progress(worker, &report).await?;
        debug!(
            worker_id = %worker,
            job_id = %report.job_id,
            submission_id = %report.submission_id,
            sequence = report.sequence,
            status = %update.submission.status,
            "progress applied"
        );
        self.publish(
            &update.job,
            JobEventPayload::Progress {
                submission_id: update.submission.id,
                target_name: update.submission.target_name.clone(),
                status: update.submission.status,
                sequence: report.sequence,
            },
        )
        .await;
        Ok(update.job)
    }

    async fn complete_job(
        &self,
        worker: &WorkerId,
        job_id: JobId,
        summary: CompletionSummary,
    ) -> Result<Job> {
        let job = self.store.complete(worker, job_id, summary).await?;
        info!(
            worker_id = %worker,
            job_id = %job_id,
            status = %job.status,
            completed = job.completed_count,
            failed = job.failed_count,
            "job finished"
        );
        self.publish(
            &job,
            JobEventPayload::Finished {
                status: job.status,
                failure_reason: job.failure_reason,
            },
        )
        .await;
        Ok(job)
    }

    async fn heartbeat(
        &self,
        worker: &WorkerId,
        job_id: JobId,
        current_target: Option<String>,
    ) -> Result<Lease> {
        self.store.heartbeat(worker, job_id, current_target).await
    }

    async fn release(&self, worker: &WorkerId, job_id: JobId) -> Result<Job> {
        let job = self.store.release(worker, job_id).await?;
        info!(worker_id = %worker, job_id = %job_id, status = %job.status, "lease released");
        self.publish(
            &job,
            JobEventPayload::Released {
                worker_id: worker.clone(),
            },
        )
        .await;
        Ok(job)
    }
}

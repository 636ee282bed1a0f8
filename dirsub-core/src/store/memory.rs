use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::clock::{Clock, SystemClock};
use crate::config::{LeaseConfig, OrchestratorConfig};
use crate::error::{DirsubError, Result};
use crate::job::{
    Job, JobId, JobStatus, NewJob, Submission, SubmissionId, SubmissionStatus, WorkerId,
};
use crate::lease::{AcquireOutcome, Lease, LeaseGrant, SweepReport};
use crate::progress::{CompletionSummary, ProgressReport, SubmissionUpdate};
use crate::transitions::{self, ExpiryOutcome, LeaseDecision};

use super::JobStore;

#[derive(Debug)]
struct JobEntry {
    job: Job,
    submissions: Vec<Submission>,
}

#[derive(Debug, Default)]
struct StoreState {
    jobs: HashMap<JobId, JobEntry>,
    revision: i64,
}

impl StoreState {
    fn next_revision(&mut self) -> i64 {
        self.revision += 1;
        self.revision
    }

    fn entry_mut(&mut self, job_id: JobId) -> Result<&mut JobEntry> {
        self.jobs
            .get_mut(&job_id)
            .ok_or_else(|| DirsubError::job_not_found(job_id))
    }
}

/// Single-process job store. One mutex guards every job so each operation is
/// trivially atomic.
pub struct InMemoryJobStore {
    state: Mutex<StoreState>,
    clock: Arc<dyn Clock>,
    lease: LeaseConfig,
    max_attempts: u32,
}

impl fmt::Debug for InMemoryJobStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InMemoryJobStore")
            .field("clock", &self.clock)
            .field("lease", &self.lease)
            .field("max_attempts", &self.max_attempts)
            .finish_non_exhaustive()
    }
}

impl InMemoryJobStore {
    pub fn new(config: &OrchestratorConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    pub fn with_clock(config: &OrchestratorConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            state: Mutex::new(StoreState::default()),
            clock,
            lease: config.lease,
            max_attempts: config.retry.max_attempts,
        }
    }

    fn now(&self) -> chrono::DateTime<chrono::Utc> {
        self.clock.now()
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn create_job(&self, new_job: NewJob) -> Result<(Job, Vec<Submission>)> {
        let (mut job, submissions) = new_job.materialize(self.now())?;
        let mut state = self.state.lock().await;
        job.revision = state.next_revision();

        debug!(job_id = %job.id, targets = job.target_count, "created job");
        state.jobs.insert(
            job.id,
            JobEntry {
                job: job.clone(),
                submissions: submissions.clone(),
            },
        );
        Ok((job, submissions))
    }

    async fn acquire_next(&self, worker: &WorkerId) -> Result<AcquireOutcome> {
        let now = self.now();
        let mut state = self.state.lock().await;

        let mut candidates: Vec<(i32, chrono::DateTime<chrono::Utc>, JobId)> = state
            .jobs
            .values()
            .filter(|entry| entry.job.is_eligible(now))
            .map(|entry| (entry.job.priority_level, entry.job.created_at, entry.job.id))
            .collect();
        candidates.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)).then(a.2.cmp(&b.2)));

        let mut outcome = AcquireOutcome::default();
        for (_, _, job_id) in candidates {
            let revision = state.next_revision();
            let entry = state.entry_mut(job_id)?;
            let decision = transitions::lease_job(&mut entry.job, worker, now, &self.lease);
            entry.job.revision = revision;

            match decision {
                LeaseDecision::ExpiredOut => {
                    warn!(job_id = %job_id, "job failed after repeated lease expiry");
                    outcome.failed_out.push(entry.job.clone());
                }
                LeaseDecision::Granted => {
                    let lease = Lease::from_job(&entry.job).ok_or_else(|| {
                        DirsubError::Internal(format!("job {job_id} granted without lease"))
                    })?;
                    let submissions = entry
                        .submissions
                        .iter()
                        .filter(|submission| submission.status == SubmissionStatus::Pending)
                        .cloned()
                        .collect();
                    outcome.grant = Some(LeaseGrant {
                        lease,
                        job: entry.job.clone(),
                        submissions,
                    });
                    break;
                }
            }
        }

        Ok(outcome)
    }

    async fn heartbeat(
        &self,
        worker: &WorkerId,
        job_id: JobId,
        current_target: Option<String>,
    ) -> Result<Lease> {
        let now = self.now();
        let mut state = self.state.lock().await;
        let entry = state.entry_mut(job_id)?;
        let (lease, hint_changed) =
            transitions::renew_lease(&mut entry.job, worker, current_target, now, &self.lease)?;
        if hint_changed {
            let revision = state.next_revision();
            state.entry_mut(job_id)?.job.revision = revision;
        }
        Ok(lease)
    }

    async fn release(&self, worker: &WorkerId, job_id: JobId) -> Result<Job> {
        let now = self.now();
        let mut state = self.state.lock().await;
        transitions::release_lease(&mut state.entry_mut(job_id)?.job, worker, now)?;
        let revision = state.next_revision();
        let entry = state.entry_mut(job_id)?;
        entry.job.revision = revision;
        Ok(entry.job.clone())
    }

    async fn apply_progress(
        &self,
        worker: &WorkerId,
        report: &ProgressReport,
    ) -> Result<SubmissionUpdate> {
        let now = self.now();
        let mut state = self.state.lock().await;
        let entry = state.entry_mut(report.job_id)?;
        let index = transitions::apply_report(
            &mut entry.job,
            &mut entry.submissions,
            worker,
            report,
            now,
            &self.lease,
            self.max_attempts,
        )?;
        let submission = entry.submissions[index].clone();

        let revision = state.next_revision();
        let entry = state.entry_mut(report.job_id)?;
        entry.job.revision = revision;
        Ok(SubmissionUpdate {
            job: entry.job.clone(),
            submission,
        })
    }

    async fn complete(
        &self,
        worker: &WorkerId,
        job_id: JobId,
        summary: CompletionSummary,
    ) -> Result<Job> {
        let now = self.now();
        let mut state = self.state.lock().await;
        let entry = state.entry_mut(job_id)?;
        transitions::complete(&mut entry.job, &entry.submissions, worker, summary, now)?;

        let revision = state.next_revision();
        let entry = state.entry_mut(job_id)?;
        entry.job.revision = revision;
        Ok(entry.job.clone())
    }

    async fn retry_submission(
        &self,
        job_id: JobId,
        submission_id: SubmissionId,
    ) -> Result<SubmissionUpdate> {
        let now = self.now();
        let mut state = self.state.lock().await;
        let entry = state.entry_mut(job_id)?;
        let index =
            transitions::retry_submission(&mut entry.job, &mut entry.submissions, submission_id, now)?;
        let submission = entry.submissions[index].clone();

        let revision = state.next_revision();
        let entry = state.entry_mut(job_id)?;
        entry.job.revision = revision;
        Ok(SubmissionUpdate {
            job: entry.job.clone(),
            submission,
        })
    }

    async fn pause(&self, job_id: JobId) -> Result<Job> {
        let now = self.now();
        let mut state = self.state.lock().await;
        transitions::pause(&mut state.entry_mut(job_id)?.job, now)?;
        let revision = state.next_revision();
        let entry = state.entry_mut(job_id)?;
        entry.job.revision = revision;
        Ok(entry.job.clone())
    }

    async fn resume(&self, job_id: JobId) -> Result<Job> {
        let now = self.now();
        let mut state = self.state.lock().await;
        transitions::resume(&mut state.entry_mut(job_id)?.job, now)?;
        let revision = state.next_revision();
        let entry = state.entry_mut(job_id)?;
        entry.job.revision = revision;
        Ok(entry.job.clone())
    }

    async fn sweep_expired_leases(&self) -> Result<SweepReport> {
        let now = self.now();
        let mut state = self.state.lock().await;

        let mut expired: Vec<JobId> = state
            .jobs
            .values()
            .filter(|entry| {
                entry.job.status == JobStatus::InProgress
                    && !entry.job.has_live_lease(now)
            })
            .map(|entry| entry.job.id)
            .collect();
        expired.sort();

        let mut report = SweepReport::default();
        for job_id in expired {
            let revision = state.next_revision();
            let entry = state.entry_mut(job_id)?;
            let outcome = transitions::expire_lease(&mut entry.job, now, &self.lease);
            entry.job.revision = revision;
            match outcome {
                ExpiryOutcome::Requeued => report.requeued.push(entry.job.clone()),
                ExpiryOutcome::WorkerUnavailable => {
                    report.worker_unavailable.push(entry.job.clone())
                }
            }
        }

        if !report.is_empty() {
            info!(
                requeued = report.requeued.len(),
                worker_unavailable = report.worker_unavailable.len(),
                "swept expired leases"
            );
        }
        Ok(report)
    }

    async fn get_job(&self, job_id: JobId) -> Result<Job> {
        let state = self.state.lock().await;
        state
            .jobs
            .get(&job_id)
            .map(|entry| entry.job.clone())
            .ok_or_else(|| DirsubError::job_not_found(job_id))
    }

    async fn list_submissions(&self, job_id: JobId) -> Result<Vec<Submission>> {
        let state = self.state.lock().await;
        let entry = state
            .jobs
            .get(&job_id)
            .ok_or_else(|| DirsubError::job_not_found(job_id))?;
        let mut submissions = entry.submissions.clone();
        submissions.sort_by_key(|submission| submission.position);
        Ok(submissions)
    }

    async fn changes_since(&self, since: i64, limit: usize) -> Result<Vec<Job>> {
        let state = self.state.lock().await;
        let mut jobs: Vec<Job> = state
            .jobs
            .values()
            .filter(|entry| entry.job.revision > since)
            .map(|entry| entry.job.clone())
            .collect();
        jobs.sort_by_key(|job| job.revision);
        jobs.truncate(limit);
        Ok(jobs)
    }

    async fn latest_revision(&self) -> Result<i64> {
        Ok(self.state.lock().await.revision)
    }
}

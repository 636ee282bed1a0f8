use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::OrchestratorConfig;
use crate::error::{DirsubError, Result};
use crate::job::{BusinessProfile, Job, JobId, JobStatus, Submission, SubmissionErrorKind, WorkerId};
use crate::lease::{JobAssignment, LeaseGrant};
use crate::orchestrator::OrchestratorApi;
use crate::progress::{CompletionSummary, ProgressOutcome, ProgressReport};

use super::automation::{AttemptOutcome, AutomationCapability};
use super::backoff::{IdleBackoff, retry_delay};

/// How one leased job ended from this worker's point of view.
#[derive(Clone, Debug, PartialEq)]
pub enum JobRunOutcome {
    /// `complete_job` accepted; carries the terminal job.
    Completed(Job),
    /// Staff paused the job; the lease was handed back.
    Paused,
    /// The orchestrator no longer recognises our lease.
    LeaseLost(String),
    /// A progress report was refused as a replay; the lease was handed back
    /// so a later pass resumes from the remaining pending rows.
    Released(String),
    /// The orchestrator stayed unreachable; the lease will lapse on its own.
    Abandoned(String),
    Shutdown,
}

/// Outcome of a single `request_job` round trip.
#[derive(Clone, Debug, PartialEq)]
pub enum PollOutcome {
    Idle,
    Ran(JobId, JobRunOutcome),
}

/// Long-running poll loop that drives leased jobs through the automation
/// capability, one submission at a time.
pub struct WorkerAgent {
    id: WorkerId,
    orchestrator: Arc<dyn OrchestratorApi>,
    automation: Arc<dyn AutomationCapability>,
    config: OrchestratorConfig,
}

impl fmt::Debug for WorkerAgent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerAgent")
            .field("id", &self.id)
            .field("orchestrator", &self.orchestrator)
            .field("automation", &self.automation)
            .finish_non_exhaustive()
    }
}

impl WorkerAgent {
    pub fn new(
        id: WorkerId,
        orchestrator: Arc<dyn OrchestratorApi>,
        automation: Arc<dyn AutomationCapability>,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            id,
            orchestrator,
            automation,
            config,
        }
    }

    /// Poll until `shutdown` fires.
    pub async fn run(&self, shutdown: CancellationToken) {
        let mut idle = IdleBackoff::new(
            self.config.worker.idle_poll_min(),
            self.config.worker.idle_poll_max(),
        );
        info!(worker_id = %self.id, "worker started");

        while !shutdown.is_cancelled() {
            let delay = match self.poll_once(&shutdown).await {
                Ok(PollOutcome::Ran(job_id, outcome)) => {
                    idle.reset();
                    info!(worker_id = %self.id, job_id = %job_id, outcome = ?outcome, "job pass finished");
                    continue;
                }
                Ok(PollOutcome::Idle) => idle.next_delay(),
                Err(err) => {
                    warn!(worker_id = %self.id, error = %err, "request_job failed");
                    idle.next_delay()
                }
            };

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown.cancelled() => break,
            }
        }

        info!(worker_id = %self.id, "worker shutting down");
    }

    /// Request one job and, if one is granted, process it to the end.
    pub async fn poll_once(&self, shutdown: &CancellationToken) -> Result<PollOutcome> {
        match self.orchestrator.request_job(&self.id).await? {
            JobAssignment::NoWorkAvailable => Ok(PollOutcome::Idle),
            JobAssignment::Assigned(grant) => {
                let job_id = grant.job.id;
                let outcome = self.process(grant, shutdown).await;
                Ok(PollOutcome::Ran(job_id, outcome))
            }
        }
    }

    async fn process(&self, grant: LeaseGrant, shutdown: &CancellationToken) -> JobRunOutcome {
        let job_id = grant.job.id;
        let ttl = (grant.lease.expires_at - grant.lease.acquired_at)
            .to_std()
            .unwrap_or_else(|_| Duration::from_secs(self.config.lease.lease_ttl_secs.max(1) as u64));

        let lease_lost = CancellationToken::new();
        let stop_heartbeat = CancellationToken::new();
        let (hint_tx, hint_rx) = watch::channel(None::<String>);
        let heartbeat = self.spawn_heartbeat(
            job_id,
            self.config.worker.heartbeat_interval(ttl),
            hint_rx,
            lease_lost.clone(),
            stop_heartbeat.clone(),
        );

        let outcome = self
            .drive_submissions(&grant, shutdown, &lease_lost, &hint_tx)
            .await;

        stop_heartbeat.cancel();
        if let Err(err) = heartbeat.await {
            error!(worker_id = %self.id, job_id = %job_id, "heartbeat task panicked: {err}");
        }
        outcome
    }

    async fn drive_submissions(
        &self,
        grant: &LeaseGrant,
        shutdown: &CancellationToken,
        lease_lost: &CancellationToken,
        hint: &watch::Sender<Option<String>>,
    ) -> JobRunOutcome {
        let job_id = grant.job.id;
        let started = Instant::now();
        let mut sequence = grant.lease.last_sequence;
        let mut status = grant.job.status;
        let mut summary = CompletionSummary::default();

        for (index, submission) in grant.submissions.iter().enumerate() {
            if let Some(outcome) = self.checkpoint(job_id, status, shutdown, lease_lost).await {
                return outcome;
            }

            if index > 0 && !self.config.worker.submission_pacing().is_zero() {
                tokio::select! {
                    _ = tokio::time::sleep(self.config.worker.submission_pacing()) => {}
                    _ = shutdown.cancelled() => {
                        self.release(job_id).await;
                        return JobRunOutcome::Shutdown;
                    }
                }
            }

            hint.send_replace(Some(submission.target_name.clone()));
            let Some((outcome, attempts)) =
                self.attempt_submission(submission, &grant.job.payload, shutdown).await
            else {
                self.release(job_id).await;
                return JobRunOutcome::Shutdown;
            };

            sequence += 1;
            let report = ProgressReport {
                job_id,
                submission_id: submission.id,
                sequence,
                outcome: outcome.clone(),
                attempts,
            };

            match self.send_report(report).await {
                Ok(job) => {
                    summary.record(&outcome);
                    status = job.status;
                }
                Err(DirsubError::SequenceConflict {
                    last_applied,
                    received,
                    ..
                }) => {
                    warn!(
                        worker_id = %self.id,
                        job_id = %job_id,
                        last_applied,
                        received,
                        "progress rejected as replay; handing job back"
                    );
                    self.release(job_id).await;
                    return JobRunOutcome::Released(format!(
                        "sequence {received} already covered by {last_applied}"
                    ));
                }
                Err(DirsubError::LeaseMismatch { reason, .. }) => {
                    warn!(worker_id = %self.id, job_id = %job_id, %reason, "lease lost while reporting");
                    return JobRunOutcome::LeaseLost(reason);
                }
                Err(err) => {
                    error!(worker_id = %self.id, job_id = %job_id, error = %err, "progress report failed");
                    return JobRunOutcome::Abandoned(err.to_string());
                }
            }
        }

        if lease_lost.is_cancelled() {
            return JobRunOutcome::LeaseLost("heartbeat rejected".into());
        }
        // A pause that landed during the last submission.
        if status == JobStatus::Paused {
            return self.hand_back_paused(job_id).await;
        }

        summary.elapsed_ms = started.elapsed().as_millis() as u64;
        match self
            .orchestrator
            .complete_job(&self.id, job_id, summary)
            .await
        {
            Ok(job) => JobRunOutcome::Completed(job),
            Err(DirsubError::LeaseMismatch { reason, .. }) => JobRunOutcome::LeaseLost(reason),
            Err(DirsubError::InvalidState {
                status: JobStatus::Paused,
                ..
            }) => self.hand_back_paused(job_id).await,
            Err(err @ DirsubError::IncompleteSubmissions { .. }) => {
                // Rows were reset underneath us; let the next pass pick them up.
                self.release(job_id).await;
                JobRunOutcome::Released(err.to_string())
            }
            Err(err) => JobRunOutcome::Abandoned(err.to_string()),
        }
    }

    /// Cooperative stop check run before every submission.
    async fn checkpoint(
        &self,
        job_id: JobId,
        status: JobStatus,
        shutdown: &CancellationToken,
        lease_lost: &CancellationToken,
    ) -> Option<JobRunOutcome> {
        if lease_lost.is_cancelled() {
            return Some(JobRunOutcome::LeaseLost("heartbeat rejected".into()));
        }
        if status == JobStatus::Paused {
            return Some(self.hand_back_paused(job_id).await);
        }
        if shutdown.is_cancelled() {
            self.release(job_id).await;
            return Some(JobRunOutcome::Shutdown);
        }
        None
    }

    /// Run the automation with local retries. `None` means shutdown interrupted a backoff.
    async fn attempt_submission(
        &self,
        submission: &Submission,
        payload: &BusinessProfile,
        shutdown: &CancellationToken,
    ) -> Option<(ProgressOutcome, u32)> {
        let max_attempts = self.config.retry.max_attempts.max(1);
        let timeout = self.config.worker.attempt_timeout();

        for attempt in 1..=max_attempts {
            let outcome = match tokio::time::timeout(
                timeout,
                self.automation.attempt(submission, payload),
            )
            .await
            {
                Ok(outcome) => outcome,
                Err(_) => AttemptOutcome::TransientFailure {
                    reason: "timeout".into(),
                },
            };

            match outcome {
                AttemptOutcome::Success { confirmed: true } => {
                    return Some((ProgressOutcome::Approved, attempt));
                }
                AttemptOutcome::Success { confirmed: false } => {
                    return Some((ProgressOutcome::Submitted, attempt));
                }
                AttemptOutcome::PermanentFailure { reason } => {
                    return Some((
                        ProgressOutcome::Failed {
                            error_kind: SubmissionErrorKind::Permanent,
                            message: reason,
                        },
                        attempt,
                    ));
                }
                AttemptOutcome::TransientFailure { reason } if attempt == max_attempts => {
                    return Some((
                        ProgressOutcome::Failed {
                            error_kind: SubmissionErrorKind::TransientExhausted,
                            message: reason,
                        },
                        attempt,
                    ));
                }
                AttemptOutcome::TransientFailure { reason } => {
                    let delay = retry_delay(attempt - 1, &self.config.retry);
                    debug!(
                        worker_id = %self.id,
                        target_name = %submission.target_name,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        %reason,
                        "transient automation failure; retrying"
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = shutdown.cancelled() => return None,
                    }
                }
            }
        }

        None
    }

    /// Send a report, re-sending the same sequence on transport failures.
    async fn send_report(&self, report: ProgressReport) -> Result<Job> {
        let retries = self.config.worker.report_retry_attempts;
        let mut retry = 0;
        loop {
            match self
                .orchestrator
                .report_progress(&self.id, report.clone())
                .await
            {
                Err(DirsubError::Transport(reason)) if retry < retries => {
                    let delay = retry_delay(retry, &self.config.retry);
                    warn!(
                        worker_id = %self.id,
                        job_id = %report.job_id,
                        sequence = report.sequence,
                        retry,
                        %reason,
                        "progress report transport failure; re-sending"
                    );
                    tokio::time::sleep(delay).await;
                    retry += 1;
                }
                other => return other,
            }
        }
    }

    async fn hand_back_paused(&self, job_id: JobId) -> JobRunOutcome {
        info!(worker_id = %self.id, job_id = %job_id, "job paused; releasing lease");
        self.release(job_id).await;
        JobRunOutcome::Paused
    }

    async fn release(&self, job_id: JobId) {
        if let Err(err) = self.orchestrator.release(&self.id, job_id).await {
            warn!(worker_id = %self.id, job_id = %job_id, error = %err, "lease release failed");
        }
    }

    fn spawn_heartbeat(
        &self,
        job_id: JobId,
        interval: Duration,
        hint: watch::Receiver<Option<String>>,
        lease_lost: CancellationToken,
        stop: CancellationToken,
    ) -> JoinHandle<()> {
        let orchestrator = Arc::clone(&self.orchestrator);
        let worker = self.id.clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {}
                    _ = stop.cancelled() => break,
                }

                let current_target = hint.borrow().clone();
                match orchestrator.heartbeat(&worker, job_id, current_target).await {
                    Ok(lease) => {
                        debug!(worker_id = %worker, job_id = %job_id, expires_at = %lease.expires_at, "lease renewed");
                    }
                    Err(DirsubError::LeaseMismatch { reason, .. }) => {
                        warn!(worker_id = %worker, job_id = %job_id, %reason, "heartbeat rejected");
                        lease_lost.cancel();
                        break;
                    }
                    Err(err) => {
                        // Keep trying; the lease only lapses after the full TTL.
                        warn!(worker_id = %worker, job_id = %job_id, error = %err, "heartbeat failed");
                    }
                }
            }
        })
    }
}

//! Job and submission state machine.
//!
//! Every store loads the affected rows under its own exclusion primitive
//! (a mutex for the in-memory store, row locks for Postgres), runs one of
//! these functions, and persists the result. Functions either fully apply or
//! return an error without touching their inputs.

use chrono::{DateTime, Utc};

use crate::config::LeaseConfig;
use crate::error::{DirsubError, Result};
use crate::job::{
    FailureReason, Job, JobStatus, Submission, SubmissionId, SubmissionStatus, WorkerId,
};
use crate::lease::Lease;
use crate::progress::{CompletionSummary, ProgressOutcome, ProgressReport};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LeaseDecision {
    Granted,
    /// The job was reclaimed but had already exhausted its expiry budget.
    ExpiredOut,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExpiryOutcome {
    Requeued,
    WorkerUnavailable,
}

/// Count an expired lease against the job and either requeue or fail it.
pub fn expire_lease(job: &mut Job, now: DateTime<Utc>, config: &LeaseConfig) -> ExpiryOutcome {
    job.lease_expiries = job.lease_expiries.saturating_add(1);
    job.clear_lease();
    job.updated_at = now;

    if job.lease_expiries >= config.max_consecutive_expiries {
        job.status = JobStatus::Failed;
        job.failure_reason = Some(FailureReason::WorkerUnavailable);
        job.completed_at = Some(now);
        ExpiryOutcome::WorkerUnavailable
    } else {
        job.status = JobStatus::Queued;
        ExpiryOutcome::Requeued
    }
}

/// Lease an eligible job to `worker`. Callers must have checked
/// [`Job::is_eligible`] under their lock.
pub fn lease_job(
    job: &mut Job,
    worker: &WorkerId,
    now: DateTime<Utc>,
    config: &LeaseConfig,
) -> LeaseDecision {
    if job.status == JobStatus::InProgress
        && expire_lease(job, now, config) == ExpiryOutcome::WorkerUnavailable
    {
        return LeaseDecision::ExpiredOut;
    }

    job.status = JobStatus::InProgress;
    job.lease_owner = Some(worker.clone());
    job.lease_acquired_at = Some(now);
    job.lease_expires_at = Some(now + config.ttl());
    job.started_at.get_or_insert(now);
    job.updated_at = now;
    LeaseDecision::Granted
}

/// Extend the caller's lease to `now + TTL`. Returns the renewed lease and
/// whether the target hint changed.
pub fn renew_lease(
    job: &mut Job,
    worker: &WorkerId,
    current_target: Option<String>,
    now: DateTime<Utc>,
    config: &LeaseConfig,
) -> Result<(Lease, bool)> {
    job.check_lease(worker, now)?;

    job.lease_expires_at = Some(now + config.ttl());
    let hint_changed = match current_target {
        Some(target) if job.current_target_hint.as_deref() != Some(target.as_str()) => {
            job.current_target_hint = Some(target);
            true
        }
        _ => false,
    };

    let lease = Lease::from_job(job)
        .ok_or_else(|| DirsubError::Internal(format!("job {} lost its lease fields", job.id)))?;
    Ok((lease, hint_changed))
}

/// Voluntary release by the lease owner.
pub fn release_lease(job: &mut Job, worker: &WorkerId, now: DateTime<Utc>) -> Result<()> {
    if job.lease_owner.as_ref() != Some(worker) {
        return Err(DirsubError::lease_mismatch(
            job.id,
            "release requested by a worker that does not own the lease",
        ));
    }

    job.clear_lease();
    job.current_target_hint = None;
    if job.status == JobStatus::InProgress {
        job.status = JobStatus::Queued;
    }
    job.updated_at = now;
    Ok(())
}

/// Recompute aggregate counters from the submission rows.
pub fn recount(job: &mut Job, submissions: &[Submission]) {
    job.completed_count = submissions
        .iter()
        .filter(|submission| submission.status.is_success())
        .count() as u32;
    job.failed_count = submissions
        .iter()
        .filter(|submission| submission.status == SubmissionStatus::Failed)
        .count() as u32;
}

/// Apply one progress report. Returns the index of the updated submission.
pub fn apply_report(
    job: &mut Job,
    submissions: &mut [Submission],
    worker: &WorkerId,
    report: &ProgressReport,
    now: DateTime<Utc>,
    lease: &LeaseConfig,
    max_attempts: u32,
) -> Result<usize> {
    job.check_lease(worker, now)?;

    if report.sequence <= job.last_sequence {
        return Err(DirsubError::SequenceConflict {
            job_id: job.id,
            last_applied: job.last_sequence,
            received: report.sequence,
        });
    }

    let index = submissions
        .iter()
        .position(|submission| {
            submission.id == report.submission_id && submission.job_id == job.id
        })
        .ok_or_else(|| DirsubError::submission_not_found(report.submission_id))?;

    let next = report.outcome.target_status();
    let current = submissions[index].status;
    if !current.can_transition_to(next) {
        return Err(DirsubError::InvalidTransition {
            submission_id: report.submission_id,
            from: current,
            to: next,
        });
    }

    if report.attempts == 0 || report.attempts > max_attempts {
        return Err(DirsubError::Validation(format!(
            "attempts must be within 1..={max_attempts}, got {}",
            report.attempts
        )));
    }

    let submission = &mut submissions[index];
    submission.status = next;
    submission.attempt_count = report.attempts;
    submission.updated_at = now;
    match &report.outcome {
        ProgressOutcome::Submitted => {
            submission.submitted_at = Some(now);
        }
        ProgressOutcome::Approved => {
            submission.submitted_at.get_or_insert(now);
            submission.approved_at = Some(now);
        }
        ProgressOutcome::Failed {
            error_kind,
            message,
        } => {
            submission.failed_at = Some(now);
            submission.last_error_kind = Some(*error_kind);
            submission.last_error_message = Some(message.clone());
        }
    }
    let target_name = submission.target_name.clone();

    recount(job, submissions);
    job.last_sequence = report.sequence;
    job.lease_expires_at = Some(now + lease.ttl());
    job.lease_expiries = 0;
    job.current_target_hint = Some(target_name);
    job.updated_at = now;
    Ok(index)
}

/// Finish a job once every submission is terminal.
pub fn complete(
    job: &mut Job,
    submissions: &[Submission],
    worker: &WorkerId,
    summary: CompletionSummary,
    now: DateTime<Utc>,
) -> Result<()> {
    job.check_lease(worker, now)?;
    if job.status != JobStatus::InProgress {
        return Err(DirsubError::InvalidState {
            job_id: job.id,
            status: job.status,
            reason: "only in-progress jobs can be completed".into(),
        });
    }

    let pending = submissions
        .iter()
        .filter(|submission| submission.status == SubmissionStatus::Pending)
        .count() as u32;
    if pending > 0 {
        return Err(DirsubError::IncompleteSubmissions {
            job_id: job.id,
            pending,
        });
    }

    recount(job, submissions);
    if job.failed_count == 0 {
        job.status = JobStatus::Completed;
        job.failure_reason = None;
    } else {
        job.status = JobStatus::Failed;
        job.failure_reason = Some(FailureReason::SubmissionFailures);
    }
    job.clear_lease();
    job.current_target_hint = None;
    job.summary = Some(summary);
    job.completed_at = Some(now);
    job.updated_at = now;
    Ok(())
}

/// Staff reset of a failed submission. Returns the index of the reset row.
pub fn retry_submission(
    job: &mut Job,
    submissions: &mut [Submission],
    submission_id: SubmissionId,
    now: DateTime<Utc>,
) -> Result<usize> {
    let index = submissions
        .iter()
        .position(|submission| submission.id == submission_id && submission.job_id == job.id)
        .ok_or_else(|| DirsubError::submission_not_found(submission_id))?;

    let current = submissions[index].status;
    if current != SubmissionStatus::Failed {
        return Err(DirsubError::InvalidTransition {
            submission_id,
            from: current,
            to: SubmissionStatus::Pending,
        });
    }

    if !job.is_terminal() && job.status != JobStatus::Paused {
        return Err(DirsubError::InvalidState {
            job_id: job.id,
            status: job.status,
            reason: "submissions can only be retried on finished or paused jobs".into(),
        });
    }

    let submission = &mut submissions[index];
    submission.status = SubmissionStatus::Pending;
    submission.attempt_count = 0;
    submission.last_error_kind = None;
    submission.last_error_message = None;
    submission.submitted_at = None;
    submission.approved_at = None;
    submission.failed_at = None;
    submission.updated_at = now;

    recount(job, submissions);
    if job.is_terminal() {
        job.status = JobStatus::Queued;
        job.completed_at = None;
        job.failure_reason = None;
        job.summary = None;
        job.lease_expiries = 0;
    }
    job.updated_at = now;
    Ok(index)
}

pub fn pause(job: &mut Job, now: DateTime<Utc>) -> Result<()> {
    match job.status {
        JobStatus::Queued | JobStatus::InProgress => {
            job.status = JobStatus::Paused;
            job.updated_at = now;
            Ok(())
        }
        status => Err(DirsubError::InvalidState {
            job_id: job.id,
            status,
            reason: "only queued or in-progress jobs can be paused".into(),
        }),
    }
}

pub fn resume(job: &mut Job, now: DateTime<Utc>) -> Result<()> {
    if job.status != JobStatus::Paused {
        return Err(DirsubError::InvalidState {
            job_id: job.id,
            status: job.status,
            reason: "only paused jobs can be resumed".into(),
        });
    }

    job.status = JobStatus::Queued;
    job.clear_lease();
    job.current_target_hint = None;
    job.updated_at = now;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{BusinessProfile, NewJob, NewTarget, SubmissionErrorKind};
    use chrono::Duration;

    const MAX_ATTEMPTS: u32 = 3;

    fn fixture(targets: usize) -> (Job, Vec<Submission>, DateTime<Utc>) {
        let now = Utc::now();
        let new_job = NewJob {
            customer_id: "cust".into(),
            priority_level: 1,
            payload: BusinessProfile::default(),
            targets: (0..targets)
                .map(|i| NewTarget::named(format!("dir-{i}")))
                .collect(),
        };
        let (job, subs) = new_job.materialize(now).expect("valid job");
        (job, subs, now)
    }

    fn report(job: &Job, sub: &Submission, sequence: i64, outcome: ProgressOutcome) -> ProgressReport {
        ProgressReport {
            job_id: job.id,
            submission_id: sub.id,
            sequence,
            outcome,
            attempts: 1,
        }
    }

    fn leased(targets: usize) -> (Job, Vec<Submission>, WorkerId, DateTime<Utc>, LeaseConfig) {
        let (mut job, subs, now) = fixture(targets);
        let config = LeaseConfig::default();
        let worker = WorkerId::from("w1");
        assert_eq!(
            lease_job(&mut job, &worker, now, &config),
            LeaseDecision::Granted
        );
        (job, subs, worker, now, config)
    }

    #[test]
    fn lease_sets_owner_expiry_and_start_once() {
        let (job, _, worker, now, config) = leased(2);
        assert_eq!(job.status, JobStatus::InProgress);
        assert_eq!(job.lease_owner.as_ref(), Some(&worker));
        assert_eq!(job.lease_expires_at, Some(now + config.ttl()));
        assert_eq!(job.started_at, Some(now));
    }

    #[test]
    fn reclaim_counts_expiries_and_fails_out() {
        let (mut job, _, _, now, config) = leased(1);
        let later = now + config.ttl() + Duration::seconds(1);
        let w2 = WorkerId::from("w2");

        assert!(job.is_eligible(later));
        assert_eq!(lease_job(&mut job, &w2, later, &config), LeaseDecision::Granted);
        assert_eq!(job.lease_expiries, 1);
        assert_eq!(job.started_at, Some(now));

        let much_later = later + config.ttl() + Duration::seconds(1);
        assert_eq!(
            lease_job(&mut job, &WorkerId::from("w3"), much_later, &config),
            LeaseDecision::ExpiredOut
        );
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.failure_reason, Some(FailureReason::WorkerUnavailable));
        assert!(job.lease_owner.is_none());
    }

    #[test]
    fn heartbeat_renews_from_now() {
        let (mut job, _, worker, now, config) = leased(1);
        let later = now + Duration::seconds(100);
        let (lease, hint_changed) =
            renew_lease(&mut job, &worker, Some("dir-0".into()), later, &config).expect("renew");
        assert_eq!(lease.expires_at, later + config.ttl());
        assert!(hint_changed);

        let (_, hint_changed) =
            renew_lease(&mut job, &worker, Some("dir-0".into()), later, &config).expect("renew");
        assert!(!hint_changed);

        let err = renew_lease(&mut job, &WorkerId::from("w2"), None, later, &config)
            .expect_err("foreign worker");
        assert!(matches!(err, DirsubError::LeaseMismatch { .. }));
    }

    #[test]
    fn report_applies_counts_and_renews_lease() {
        let (mut job, mut subs, worker, now, config) = leased(2);
        job.lease_expiries = 1;
        let at = now + Duration::seconds(10);
        let r = report(&job, &subs[0], 1, ProgressOutcome::Submitted);

        let index =
            apply_report(&mut job, &mut subs, &worker, &r, at, &config, MAX_ATTEMPTS).expect("apply");
        assert_eq!(index, 0);
        assert_eq!(subs[0].status, SubmissionStatus::Submitted);
        assert_eq!(job.completed_count, 1);
        assert_eq!(job.last_sequence, 1);
        assert_eq!(job.lease_expiries, 0);
        assert_eq!(job.lease_expires_at, Some(at + config.ttl()));
        assert_eq!(job.progress_percent(), 50.0);
    }

    #[test]
    fn replayed_sequence_is_rejected_without_mutation() {
        let (mut job, mut subs, worker, now, config) = leased(2);
        let first = report(&job, &subs[0], 1, ProgressOutcome::Submitted);
        apply_report(&mut job, &mut subs, &worker, &first, now, &config, MAX_ATTEMPTS)
            .expect("apply");

        let before = (job.clone(), subs.clone());
        let replay = report(&job, &subs[1], 1, ProgressOutcome::Submitted);
        let err = apply_report(&mut job, &mut subs, &worker, &replay, now, &config, MAX_ATTEMPTS)
            .expect_err("replay");
        assert!(matches!(
            err,
            DirsubError::SequenceConflict {
                last_applied: 1,
                received: 1,
                ..
            }
        ));
        assert_eq!((job, subs), before);
    }

    #[test]
    fn illegal_transition_and_attempts_are_rejected() {
        let (mut job, mut subs, worker, now, config) = leased(1);
        let failed = report(
            &job,
            &subs[0],
            1,
            ProgressOutcome::Failed {
                error_kind: SubmissionErrorKind::Permanent,
                message: "captcha".into(),
            },
        );
        apply_report(&mut job, &mut subs, &worker, &failed, now, &config, MAX_ATTEMPTS)
            .expect("apply");

        let approve = report(&job, &subs[0], 2, ProgressOutcome::Approved);
        assert!(matches!(
            apply_report(&mut job, &mut subs, &worker, &approve, now, &config, MAX_ATTEMPTS),
            Err(DirsubError::InvalidTransition { .. })
        ));

        let (mut job, mut subs, worker, now, config) = leased(1);
        let mut too_many = report(&job, &subs[0], 1, ProgressOutcome::Submitted);
        too_many.attempts = MAX_ATTEMPTS + 1;
        assert!(matches!(
            apply_report(&mut job, &mut subs, &worker, &too_many, now, &config, MAX_ATTEMPTS),
            Err(DirsubError::Validation(_))
        ));
        assert_eq!(job.last_sequence, 0);
    }

    #[test]
    fn submitted_then_approved_keeps_counts() {
        let (mut job, mut subs, worker, now, config) = leased(1);
        let submitted = report(&job, &subs[0], 1, ProgressOutcome::Submitted);
        apply_report(&mut job, &mut subs, &worker, &submitted, now, &config, MAX_ATTEMPTS)
            .expect("submitted");
        let approved = report(&job, &subs[0], 2, ProgressOutcome::Approved);
        apply_report(&mut job, &mut subs, &worker, &approved, now, &config, MAX_ATTEMPTS)
            .expect("approved");
        assert_eq!(job.completed_count, 1);
        assert_eq!(subs[0].status, SubmissionStatus::Approved);
    }

    #[test]
    fn complete_requires_no_pending_rows() {
        let (mut job, mut subs, worker, now, config) = leased(2);
        let r = report(&job, &subs[0], 1, ProgressOutcome::Approved);
        apply_report(&mut job, &mut subs, &worker, &r, now, &config, MAX_ATTEMPTS).expect("apply");

        let err = complete(&mut job, &subs, &worker, CompletionSummary::default(), now)
            .expect_err("pending row left");
        assert!(matches!(
            err,
            DirsubError::IncompleteSubmissions { pending: 1, .. }
        ));
        assert_eq!(job.status, JobStatus::InProgress);
    }

    #[test]
    fn any_failure_marks_job_failed_and_retry_requeues() {
        let (mut job, mut subs, worker, now, config) = leased(2);
        let ok = report(&job, &subs[0], 1, ProgressOutcome::Submitted);
        apply_report(&mut job, &mut subs, &worker, &ok, now, &config, MAX_ATTEMPTS).expect("ok");
        let mut bad = report(
            &job,
            &subs[1],
            2,
            ProgressOutcome::Failed {
                error_kind: SubmissionErrorKind::TransientExhausted,
                message: "timeout".into(),
            },
        );
        bad.attempts = MAX_ATTEMPTS;
        apply_report(&mut job, &mut subs, &worker, &bad, now, &config, MAX_ATTEMPTS).expect("bad");

        complete(&mut job, &subs, &worker, CompletionSummary::default(), now).expect("complete");
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.failure_reason, Some(FailureReason::SubmissionFailures));
        assert!(job.lease_owner.is_none());

        let failed_id = subs[1].id;
        retry_submission(&mut job, &mut subs, failed_id, now).expect("retry");
        assert_eq!(job.status, JobStatus::Queued);
        assert_eq!(job.failed_count, 0);
        assert_eq!(job.completed_count, 1);
        assert!(job.completed_at.is_none());
        assert_eq!(subs[1].status, SubmissionStatus::Pending);
        assert_eq!(subs[1].attempt_count, 0);
        assert!(subs[1].last_error_kind.is_none());
    }

    #[test]
    fn retry_is_refused_while_job_runs() {
        let (mut job, mut subs, worker, now, config) = leased(1);
        let bad = report(
            &job,
            &subs[0],
            1,
            ProgressOutcome::Failed {
                error_kind: SubmissionErrorKind::Permanent,
                message: "rejected".into(),
            },
        );
        apply_report(&mut job, &mut subs, &worker, &bad, now, &config, MAX_ATTEMPTS).expect("bad");

        let id = subs[0].id;
        assert!(matches!(
            retry_submission(&mut job, &mut subs, id, now),
            Err(DirsubError::InvalidState { .. })
        ));
    }

    #[test]
    fn complete_requires_an_in_progress_job() {
        let (mut job, mut subs, worker, now, config) = leased(1);
        let r = report(&job, &subs[0], 1, ProgressOutcome::Submitted);
        apply_report(&mut job, &mut subs, &worker, &r, now, &config, MAX_ATTEMPTS).expect("apply");
        pause(&mut job, now).expect("pause");

        let err = complete(&mut job, &subs, &worker, CompletionSummary::default(), now)
            .expect_err("paused");
        assert!(matches!(
            err,
            DirsubError::InvalidState {
                status: JobStatus::Paused,
                ..
            }
        ));
        assert_eq!(job.status, JobStatus::Paused);
        assert!(job.summary.is_none());
    }

    #[test]
    fn pause_resume_and_release() {
        let (mut job, _, worker, now, _) = leased(1);
        pause(&mut job, now).expect("pause");
        assert_eq!(job.status, JobStatus::Paused);
        assert_eq!(job.lease_owner.as_ref(), Some(&worker));
        assert!(pause(&mut job, now).is_err());

        resume(&mut job, now).expect("resume");
        assert_eq!(job.status, JobStatus::Queued);
        assert!(job.lease_owner.is_none());
        assert!(matches!(
            job.check_lease(&worker, now),
            Err(DirsubError::LeaseMismatch { .. })
        ));

        let (mut job, _, worker, now, _) = leased(1);
        assert!(release_lease(&mut job, &WorkerId::from("other"), now).is_err());
        release_lease(&mut job, &worker, now).expect("release");
        assert_eq!(job.status, JobStatus::Queued);
        assert_eq!(job.lease_expiries, 0);
    }
}

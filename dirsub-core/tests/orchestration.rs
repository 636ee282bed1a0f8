use std::collections::HashSet;
use std::sync::Arc;

use chrono::{Duration, Utc};
use dirsub_core::{
    BusinessProfile, Clock, CompletionSummary, DirsubError, FailureReason, InMemoryJobStore,
    InProcJobEventBus, JobAssignment, JobEventPayload, JobId, JobStatus, LeaseGrant, ManualClock,
    NewJob, NewTarget, OrchestratorApi, OrchestratorConfig, OrchestratorService, ProgressFeed,
    ProgressOutcome, ProgressReport, SubmissionErrorKind, SubmissionStatus, WorkerId,
};

struct Harness {
    clock: ManualClock,
    config: OrchestratorConfig,
    bus: Arc<InProcJobEventBus>,
    service: OrchestratorService,
    feed: ProgressFeed,
}

fn harness() -> Harness {
    let config = OrchestratorConfig::default();
    let clock = ManualClock::new(Utc::now());
    let store = Arc::new(InMemoryJobStore::with_clock(&config, Arc::new(clock.clone())));
    let bus = Arc::new(InProcJobEventBus::new(64));
    let service = OrchestratorService::new(store.clone(), bus.clone());
    let feed = ProgressFeed::new(store, bus.clone(), config.feed);
    Harness {
        clock,
        config,
        bus,
        service,
        feed,
    }
}

fn new_job(customer: &str, priority: i32, targets: usize) -> NewJob {
    NewJob {
        customer_id: customer.into(),
        priority_level: priority,
        payload: BusinessProfile {
            name: "Acme Plumbing".into(),
            city: "Springfield".into(),
            ..Default::default()
        },
        targets: (0..targets)
            .map(|i| NewTarget::named(format!("directory-{i}")))
            .collect(),
    }
}

async fn assign(service: &OrchestratorService, worker: &WorkerId) -> LeaseGrant {
    match service.request_job(worker).await.expect("request_job") {
        JobAssignment::Assigned(grant) => grant,
        JobAssignment::NoWorkAvailable => panic!("expected work for {worker}"),
    }
}

fn report(grant: &LeaseGrant, index: usize, sequence: i64, outcome: ProgressOutcome) -> ProgressReport {
    ProgressReport {
        job_id: grant.job.id,
        submission_id: grant.submissions[index].id,
        sequence,
        outcome,
        attempts: 1,
    }
}

fn transient_exhausted() -> ProgressOutcome {
    ProgressOutcome::Failed {
        error_kind: SubmissionErrorKind::TransientExhausted,
        message: "timeout".into(),
    }
}

#[tokio::test]
async fn empty_queue_is_not_an_error() {
    let h = harness();
    let assignment = h
        .service
        .request_job(&WorkerId::from("idle"))
        .await
        .expect("request_job");
    assert_eq!(assignment, JobAssignment::NoWorkAvailable);
}

#[tokio::test]
async fn assignment_follows_priority_then_age() {
    let h = harness();
    let (low, _) = h.service.create_job(new_job("low", 0, 1)).await.expect("create");
    h.clock.advance(Duration::seconds(1));
    let (high_old, _) = h.service.create_job(new_job("high-old", 5, 1)).await.expect("create");
    h.clock.advance(Duration::seconds(1));
    let (high_new, _) = h.service.create_job(new_job("high-new", 5, 1)).await.expect("create");

    let order: Vec<JobId> = [
        assign(&h.service, &WorkerId::from("a")).await,
        assign(&h.service, &WorkerId::from("b")).await,
        assign(&h.service, &WorkerId::from("c")).await,
    ]
    .iter()
    .map(|grant| grant.job.id)
    .collect();

    assert_eq!(order, vec![high_old.id, high_new.id, low.id]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_workers_never_share_a_job() {
    let h = harness();
    for i in 0..10 {
        h.service
            .create_job(new_job(&format!("cust-{i}"), i % 3, 2))
            .await
            .expect("create");
    }

    let service = Arc::new(h.service.clone());
    let mut handles = Vec::new();
    for w in 0..50 {
        let service = Arc::clone(&service);
        handles.push(tokio::spawn(async move {
            let worker = WorkerId::new(format!("worker-{w}"));
            service.request_job(&worker).await.expect("request_job")
        }));
    }

    let mut assigned = Vec::new();
    for handle in handles {
        if let JobAssignment::Assigned(grant) = handle.await.expect("join") {
            assigned.push(grant);
        }
    }

    assert_eq!(assigned.len(), 10);
    let unique: HashSet<JobId> = assigned.iter().map(|grant| grant.job.id).collect();
    assert_eq!(unique.len(), 10, "a job was leased twice");
    for grant in &assigned {
        assert_eq!(grant.job.lease_owner.as_ref(), Some(&grant.lease.worker_id));
    }
}

#[tokio::test]
async fn progress_percent_only_grows_and_sequences_are_enforced() {
    let h = harness();
    h.service.create_job(new_job("cust", 0, 4)).await.expect("create");
    let worker = WorkerId::from("w1");
    let grant = assign(&h.service, &worker).await;

    let mut last = 0.0;
    for (index, sequence) in (0..4).zip(1..) {
        let outcome = if index == 2 {
            ProgressOutcome::Failed {
                error_kind: SubmissionErrorKind::Permanent,
                message: "listing rejected".into(),
            }
        } else {
            ProgressOutcome::Submitted
        };
        let job = h
            .service
            .report_progress(&worker, report(&grant, index, sequence, outcome))
            .await
            .expect("report");
        let percent = job.progress_percent();
        assert!((0.0..=100.0).contains(&percent));
        assert!(percent >= last);
        last = percent;
    }
    assert_eq!(last, 75.0);

    let replay = h
        .service
        .report_progress(&worker, report(&grant, 3, 4, ProgressOutcome::Approved))
        .await
        .expect_err("replayed sequence");
    assert!(matches!(replay, DirsubError::SequenceConflict { .. }));

    let detail = h.feed.job_detail(grant.job.id).await.expect("detail");
    assert_eq!(detail.job.job.completed_count, 3);
    assert_eq!(detail.job.job.failed_count, 1);
    assert_eq!(detail.job.job.last_sequence, 4);
    assert_eq!(detail.submissions[3].status, SubmissionStatus::Submitted);
}

#[tokio::test]
async fn out_of_order_report_leaves_counts_untouched() {
    let h = harness();
    h.service.create_job(new_job("cust", 0, 3)).await.expect("create");
    let worker = WorkerId::from("w1");
    let grant = assign(&h.service, &worker).await;

    h.service
        .report_progress(&worker, report(&grant, 0, 5, ProgressOutcome::Submitted))
        .await
        .expect("first report");
    let before = h.feed.job_detail(grant.job.id).await.expect("detail");

    let err = h
        .service
        .report_progress(&worker, report(&grant, 1, 3, ProgressOutcome::Submitted))
        .await
        .expect_err("stale sequence");
    assert!(matches!(
        err,
        DirsubError::SequenceConflict {
            last_applied: 5,
            received: 3,
            ..
        }
    ));

    let after = h.feed.job_detail(grant.job.id).await.expect("detail");
    assert_eq!(before, after);
}

#[tokio::test]
async fn completion_is_refused_while_rows_are_pending() {
    let h = harness();
    h.service.create_job(new_job("cust", 0, 2)).await.expect("create");
    let worker = WorkerId::from("w1");
    let grant = assign(&h.service, &worker).await;

    h.service
        .report_progress(&worker, report(&grant, 0, 1, ProgressOutcome::Approved))
        .await
        .expect("report");

    let err = h
        .service
        .complete_job(&worker, grant.job.id, CompletionSummary::default())
        .await
        .expect_err("pending row");
    assert!(matches!(
        err,
        DirsubError::IncompleteSubmissions { pending: 1, .. }
    ));

    h.service
        .report_progress(&worker, report(&grant, 1, 2, ProgressOutcome::Submitted))
        .await
        .expect("report");
    let job = h
        .service
        .complete_job(&worker, grant.job.id, CompletionSummary::default())
        .await
        .expect("complete");
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.progress_percent(), 100.0);
    assert!(job.lease_owner.is_none());
    assert!(job.completed_at.is_some());
}

#[tokio::test]
async fn reclaimed_job_returns_only_pending_rows() {
    let h = harness();
    h.service.create_job(new_job("cust", 0, 5)).await.expect("create");
    let first = WorkerId::from("crashy");
    let grant = assign(&h.service, &first).await;

    for (index, sequence) in (0..2).zip(1..) {
        h.service
            .report_progress(&first, report(&grant, index, sequence, ProgressOutcome::Submitted))
            .await
            .expect("report");
    }

    // Heartbeats stop; nothing is available until the TTL passes.
    let second = WorkerId::from("rescuer");
    assert_eq!(
        h.service.request_job(&second).await.expect("request"),
        JobAssignment::NoWorkAvailable
    );

    h.clock
        .advance(h.config.lease.ttl() + Duration::seconds(1));
    let resumed = assign(&h.service, &second).await;

    assert_eq!(resumed.job.id, grant.job.id);
    assert_eq!(resumed.submissions.len(), 3);
    assert!(
        resumed
            .submissions
            .iter()
            .all(|submission| submission.status == SubmissionStatus::Pending)
    );
    assert_eq!(resumed.lease.last_sequence, 2);
    assert_eq!(resumed.job.completed_count, 2);
    assert_eq!(resumed.job.lease_expiries, 1);

    let err = h
        .service
        .heartbeat(&first, grant.job.id, None)
        .await
        .expect_err("stale owner");
    assert!(matches!(err, DirsubError::LeaseMismatch { .. }));
}

#[tokio::test]
async fn heartbeat_keeps_the_lease_alive() {
    let h = harness();
    h.service.create_job(new_job("cust", 0, 1)).await.expect("create");
    let worker = WorkerId::from("steady");
    let grant = assign(&h.service, &worker).await;

    let step = h.config.lease.ttl() / 2;
    for _ in 0..4 {
        h.clock.advance(step);
        let lease = h
            .service
            .heartbeat(&worker, grant.job.id, Some("directory-0".into()))
            .await
            .expect("heartbeat");
        assert_eq!(lease.expires_at, h.clock.now() + h.config.lease.ttl());
    }

    assert_eq!(
        h.service
            .request_job(&WorkerId::from("thief"))
            .await
            .expect("request"),
        JobAssignment::NoWorkAvailable
    );
}

#[tokio::test]
async fn repeated_expiry_fails_job_as_worker_unavailable() {
    let h = harness();
    let (job, _) = h.service.create_job(new_job("cust", 0, 2)).await.expect("create");
    let mut events = h.bus.subscribe();
    let ttl = h.config.lease.ttl() + Duration::seconds(1);

    assign(&h.service, &WorkerId::from("w1")).await;
    h.clock.advance(ttl);
    let sweep = h.service.sweep_expired_leases().await.expect("sweep");
    assert_eq!(sweep.requeued.len(), 1);

    assign(&h.service, &WorkerId::from("w2")).await;
    h.clock.advance(ttl);
    let sweep = h.service.sweep_expired_leases().await.expect("sweep");
    assert_eq!(sweep.worker_unavailable.len(), 1);

    let failed = h.feed.job_detail(job.id).await.expect("detail").job.job;
    assert_eq!(failed.status, JobStatus::Failed);
    assert_eq!(failed.failure_reason, Some(FailureReason::WorkerUnavailable));
    assert_eq!(
        h.service
            .request_job(&WorkerId::from("w3"))
            .await
            .expect("request"),
        JobAssignment::NoWorkAvailable
    );

    let mut saw_unavailable = false;
    while let Ok(event) = events.try_recv() {
        if event.payload == JobEventPayload::WorkerUnavailable {
            saw_unavailable = true;
        }
    }
    assert!(saw_unavailable);
}

#[tokio::test]
async fn progress_report_resets_expiry_budget() {
    let h = harness();
    h.service.create_job(new_job("cust", 0, 3)).await.expect("create");
    let ttl = h.config.lease.ttl() + Duration::seconds(1);

    assign(&h.service, &WorkerId::from("w1")).await;
    h.clock.advance(ttl);

    let worker = WorkerId::from("w2");
    let grant = assign(&h.service, &worker).await;
    assert_eq!(grant.job.lease_expiries, 1);
    let job = h
        .service
        .report_progress(&worker, report(&grant, 0, 1, ProgressOutcome::Submitted))
        .await
        .expect("report");
    assert_eq!(job.lease_expiries, 0);

    h.clock.advance(ttl);
    let grant = assign(&h.service, &WorkerId::from("w3")).await;
    assert_eq!(grant.job.status, JobStatus::InProgress);
    assert_eq!(grant.job.lease_expiries, 1);
}

#[tokio::test]
async fn transient_exhaustion_fails_job_and_staff_retry_requeues_one_row() {
    let h = harness();
    h.service.create_job(new_job("cust", 0, 5)).await.expect("create");
    let worker = WorkerId::from("w1");
    let grant = assign(&h.service, &worker).await;

    for (index, sequence) in (0..5).zip(1..) {
        let mut r = if index == 3 {
            report(&grant, index, sequence, transient_exhausted())
        } else {
            report(&grant, index, sequence, ProgressOutcome::Submitted)
        };
        if index == 3 {
            r.attempts = h.config.retry.max_attempts;
        }
        h.service.report_progress(&worker, r).await.expect("report");
    }

    let job = h
        .service
        .complete_job(&worker, grant.job.id, CompletionSummary::default())
        .await
        .expect("complete");
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.failure_reason, Some(FailureReason::SubmissionFailures));
    assert_eq!((job.completed_count, job.failed_count), (4, 1));

    let failed_row = grant.submissions[3].id;
    let update = h
        .service
        .retry_submission(grant.job.id, failed_row)
        .await
        .expect("retry");
    assert_eq!(update.job.status, JobStatus::Queued);
    assert_eq!(update.submission.status, SubmissionStatus::Pending);
    assert_eq!(update.submission.attempt_count, 0);

    let worker2 = WorkerId::from("w2");
    let retry_grant = assign(&h.service, &worker2).await;
    assert_eq!(retry_grant.submissions.len(), 1);
    assert_eq!(retry_grant.submissions[0].id, failed_row);

    h.service
        .report_progress(
            &worker2,
            report(&retry_grant, 0, retry_grant.lease.last_sequence + 1, ProgressOutcome::Approved),
        )
        .await
        .expect("report");
    let job = h
        .service
        .complete_job(&worker2, retry_grant.job.id, CompletionSummary::default())
        .await
        .expect("complete");
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.completed_count, 5);
}

#[tokio::test]
async fn attempts_above_budget_are_rejected() {
    let h = harness();
    h.service.create_job(new_job("cust", 0, 1)).await.expect("create");
    let worker = WorkerId::from("w1");
    let grant = assign(&h.service, &worker).await;

    let mut r = report(&grant, 0, 1, transient_exhausted());
    r.attempts = h.config.retry.max_attempts + 1;
    let err = h
        .service
        .report_progress(&worker, r)
        .await
        .expect_err("too many attempts");
    assert!(matches!(err, DirsubError::Validation(_)));
}

#[tokio::test]
async fn pause_resume_and_release_cycle() {
    let h = harness();
    let (job, _) = h.service.create_job(new_job("cust", 0, 2)).await.expect("create");
    let worker = WorkerId::from("w1");
    let grant = assign(&h.service, &worker).await;

    let paused = h.service.pause_job(job.id).await.expect("pause");
    assert_eq!(paused.status, JobStatus::Paused);
    assert_eq!(paused.lease_owner.as_ref(), Some(&worker));

    // Reports between submissions are still accepted; the worker notices the pause.
    let snapshot = h
        .service
        .report_progress(&worker, report(&grant, 0, 1, ProgressOutcome::Submitted))
        .await
        .expect("report while paused");
    assert_eq!(snapshot.status, JobStatus::Paused);

    let released = h.service.release(&worker, job.id).await.expect("release");
    assert_eq!(released.status, JobStatus::Paused);
    assert!(released.lease_owner.is_none());
    assert_eq!(
        h.service
            .request_job(&WorkerId::from("w2"))
            .await
            .expect("request"),
        JobAssignment::NoWorkAvailable
    );

    let resumed = h.service.resume_job(job.id).await.expect("resume");
    assert_eq!(resumed.status, JobStatus::Queued);
    let regrant = assign(&h.service, &WorkerId::from("w2")).await;
    assert_eq!(regrant.submissions.len(), 1);
    assert_eq!(regrant.lease.last_sequence, 1);

    let err = h.service.resume_job(job.id).await.expect_err("not paused");
    assert!(matches!(err, DirsubError::InvalidState { .. }));
}

#[tokio::test]
async fn resume_revokes_the_previous_lease() {
    let h = harness();
    let (job, _) = h.service.create_job(new_job("cust", 0, 1)).await.expect("create");
    let worker = WorkerId::from("w1");
    assign(&h.service, &worker).await;

    h.service.pause_job(job.id).await.expect("pause");
    h.service.resume_job(job.id).await.expect("resume");

    let err = h
        .service
        .heartbeat(&worker, job.id, None)
        .await
        .expect_err("lease revoked");
    assert!(matches!(err, DirsubError::LeaseMismatch { .. }));
}

#[tokio::test]
async fn paused_job_cannot_be_completed() {
    let h = harness();
    let (job, _) = h.service.create_job(new_job("cust", 0, 1)).await.expect("create");
    let worker = WorkerId::from("w1");
    let grant = assign(&h.service, &worker).await;

    h.service
        .report_progress(&worker, report(&grant, 0, 1, ProgressOutcome::Submitted))
        .await
        .expect("report");
    h.service.pause_job(job.id).await.expect("pause");

    let err = h
        .service
        .complete_job(&worker, job.id, CompletionSummary::default())
        .await
        .expect_err("paused jobs stay paused");
    assert!(matches!(
        err,
        DirsubError::InvalidState {
            status: JobStatus::Paused,
            ..
        }
    ));

    let detail = h.feed.job_detail(job.id).await.expect("detail");
    assert_eq!(detail.job.job.status, JobStatus::Paused);
    assert!(detail.job.job.completed_at.is_none());

    // After resume a fresh lease can finish it.
    h.service.release(&worker, job.id).await.expect("release");
    h.service.resume_job(job.id).await.expect("resume");
    let regrant = assign(&h.service, &worker).await;
    assert!(regrant.submissions.is_empty());
    let done = h
        .service
        .complete_job(&worker, job.id, CompletionSummary::default())
        .await
        .expect("complete");
    assert_eq!(done.status, JobStatus::Completed);
}

#[tokio::test]
async fn change_feed_pages_by_revision() {
    let h = harness();
    let (a, _) = h.service.create_job(new_job("a", 0, 1)).await.expect("create");
    let (b, _) = h.service.create_job(new_job("b", 0, 1)).await.expect("create");

    let page = h.feed.changes_since(0, Some(1)).await.expect("page");
    assert_eq!(page.jobs.len(), 1);
    assert_eq!(page.jobs[0].job.id, a.id);

    let page = h.feed.changes_since(page.next_cursor, None).await.expect("page");
    assert_eq!(page.jobs.len(), 1);
    assert_eq!(page.jobs[0].job.id, b.id);
    let cursor = page.next_cursor;

    let empty = h.feed.changes_since(cursor, None).await.expect("page");
    assert!(empty.jobs.is_empty());
    assert_eq!(empty.next_cursor, cursor);

    // A pure heartbeat is not a change; an assignment is.
    let worker = WorkerId::from("w1");
    let grant = assign(&h.service, &worker).await;
    let page = h.feed.changes_since(cursor, None).await.expect("page");
    assert_eq!(page.jobs.len(), 1);
    assert_eq!(page.jobs[0].job.id, grant.job.id);
    let cursor = page.next_cursor;

    h.service
        .heartbeat(&worker, grant.job.id, None)
        .await
        .expect("heartbeat");
    assert!(
        h.feed
            .changes_since(cursor, None)
            .await
            .expect("page")
            .jobs
            .is_empty()
    );
}

#[tokio::test]
async fn create_job_validates_input() {
    let h = harness();
    let err = h
        .service
        .create_job(new_job("cust", 0, 0))
        .await
        .expect_err("no targets");
    assert!(matches!(err, DirsubError::Validation(_)));

    let err = h
        .service
        .create_job(new_job("", 0, 2))
        .await
        .expect_err("no customer");
    assert!(matches!(err, DirsubError::Validation(_)));
}

#[tokio::test]
async fn unknown_job_is_not_found() {
    let h = harness();
    let err = h.feed.job_detail(JobId::new()).await.expect_err("missing");
    assert!(matches!(err, DirsubError::NotFound(_)));
    let err = h.service.pause_job(JobId::new()).await.expect_err("missing");
    assert!(matches!(err, DirsubError::NotFound(_)));
}

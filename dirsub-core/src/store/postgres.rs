//! Postgres-backed job store.
//!
//! Lease ownership is resolved with row locks: candidates are picked with
//! `FOR UPDATE SKIP LOCKED` so concurrent `acquire_next` calls never see the
//! same job, and every other mutation locks its job row with `FOR UPDATE`
//! before running the shared transition functions. Timestamps come from the
//! database clock so several orchestrator instances agree on lease expiry.
//!
//! Revisions are drawn from `job_revision_seq` only while holding the
//! [`REVISION_LOCK_KEY`] transaction-level advisory lock, so they commit in
//! the order they were drawn and a feed cursor never skips a late commit.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::types::Json;
use sqlx::{FromRow, PgConnection, PgPool};
use std::fmt;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::{LeaseConfig, OrchestratorConfig};
use crate::error::{DirsubError, Result};
use crate::job::{
    BusinessProfile, Job, JobId, NewJob, Submission, SubmissionId, WorkerId,
};
use crate::lease::{AcquireOutcome, Lease, LeaseGrant, SweepReport};
use crate::progress::{CompletionSummary, ProgressReport, SubmissionUpdate};
use crate::transitions::{self, ExpiryOutcome, LeaseDecision};

use super::JobStore;

/// Advisory lock key guarding `job_revision_seq`.
pub const REVISION_LOCK_KEY: i64 = 0x6469_7273_7562;

#[derive(Clone)]
pub struct PostgresJobStore {
    pool: PgPool,
    lease: LeaseConfig,
    max_attempts: u32,
}

impl fmt::Debug for PostgresJobStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PostgresJobStore")
            .field("pool_size", &self.pool.size())
            .field("idle_connections", &self.pool.num_idle())
            .field("lease", &self.lease)
            .field("max_attempts", &self.max_attempts)
            .finish()
    }
}

#[derive(Debug, FromRow)]
struct JobRow {
    id: Uuid,
    customer_id: String,
    priority_level: i32,
    target_count: i32,
    completed_count: i32,
    failed_count: i32,
    status: String,
    failure_reason: Option<String>,
    payload: Json<BusinessProfile>,
    current_target_hint: Option<String>,
    lease_owner: Option<String>,
    lease_acquired_at: Option<DateTime<Utc>>,
    lease_expires_at: Option<DateTime<Utc>>,
    lease_expiries: i32,
    last_sequence: i64,
    summary: Option<Json<CompletionSummary>>,
    revision: i64,
    created_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<JobRow> for Job {
    type Error = DirsubError;

    fn try_from(row: JobRow) -> Result<Self> {
        Ok(Job {
            id: JobId(row.id),
            customer_id: row.customer_id,
            priority_level: row.priority_level,
            target_count: row.target_count.max(0) as u32,
            completed_count: row.completed_count.max(0) as u32,
            failed_count: row.failed_count.max(0) as u32,
            status: row.status.parse()?,
            failure_reason: row.failure_reason.as_deref().map(str::parse).transpose()?,
            payload: row.payload.0,
            current_target_hint: row.current_target_hint,
            lease_owner: row.lease_owner.map(WorkerId),
            lease_acquired_at: row.lease_acquired_at,
            lease_expires_at: row.lease_expires_at,
            lease_expiries: row.lease_expiries.max(0) as u32,
            last_sequence: row.last_sequence,
            summary: row.summary.map(|summary| summary.0),
            revision: row.revision,
            created_at: row.created_at,
            started_at: row.started_at,
            completed_at: row.completed_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(Debug, FromRow)]
struct SubmissionRow {
    id: Uuid,
    job_id: Uuid,
    position: i32,
    target_name: String,
    target_url: Option<String>,
    status: String,
    attempt_count: i32,
    last_error_kind: Option<String>,
    last_error_message: Option<String>,
    submitted_at: Option<DateTime<Utc>>,
    approved_at: Option<DateTime<Utc>>,
    failed_at: Option<DateTime<Utc>>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<SubmissionRow> for Submission {
    type Error = DirsubError;

    fn try_from(row: SubmissionRow) -> Result<Self> {
        Ok(Submission {
            id: SubmissionId(row.id),
            job_id: JobId(row.job_id),
            position: row.position.max(0) as u32,
            target_name: row.target_name,
            target_url: row.target_url,
            status: row.status.parse()?,
            attempt_count: row.attempt_count.max(0) as u32,
            last_error_kind: row.last_error_kind.as_deref().map(str::parse).transpose()?,
            last_error_message: row.last_error_message,
            submitted_at: row.submitted_at,
            approved_at: row.approved_at,
            failed_at: row.failed_at,
            updated_at: row.updated_at,
        })
    }
}

async fn db_now(conn: &mut PgConnection) -> Result<DateTime<Utc>> {
    Ok(sqlx::query_scalar::<_, DateTime<Utc>>("SELECT NOW()")
        .fetch_one(&mut *conn)
        .await?)
}

async fn lock_job(conn: &mut PgConnection, job_id: JobId) -> Result<Job> {
    sqlx::query_as::<_, JobRow>("SELECT * FROM submission_jobs WHERE id = $1 FOR UPDATE")
        .bind(job_id.0)
        .fetch_optional(&mut *conn)
        .await?
        .ok_or_else(|| DirsubError::job_not_found(job_id))?
        .try_into()
}

async fn load_submissions(
    conn: &mut PgConnection,
    job_id: JobId,
    pending_only: bool,
) -> Result<Vec<Submission>> {
    let sql = if pending_only {
        "SELECT * FROM submissions WHERE job_id = $1 AND status = 'pending' ORDER BY position"
    } else {
        "SELECT * FROM submissions WHERE job_id = $1 ORDER BY position"
    };
    sqlx::query_as::<_, SubmissionRow>(sql)
        .bind(job_id.0)
        .fetch_all(&mut *conn)
        .await?
        .into_iter()
        .map(Submission::try_from)
        .collect()
}

/// Hold the revision lock until the surrounding transaction ends.
async fn lock_revisions(conn: &mut PgConnection) -> Result<()> {
    sqlx::query("SELECT pg_advisory_xact_lock($1)")
        .bind(REVISION_LOCK_KEY)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

/// Write every mutable job column and assign a fresh revision.
async fn persist_job(conn: &mut PgConnection, job: &Job) -> Result<Job> {
    lock_revisions(&mut *conn).await?;
    sqlx::query_as::<_, JobRow>(
        r#"
        UPDATE submission_jobs
        SET completed_count = $2,
            failed_count = $3,
            status = $4,
            failure_reason = $5,
            current_target_hint = $6,
            lease_owner = $7,
            lease_acquired_at = $8,
            lease_expires_at = $9,
            lease_expiries = $10,
            last_sequence = $11,
            summary = $12,
            started_at = $13,
            completed_at = $14,
            updated_at = $15,
            revision = nextval('job_revision_seq')
        WHERE id = $1
        RETURNING *
        "#,
    )
    .bind(job.id.0)
    .bind(job.completed_count as i32)
    .bind(job.failed_count as i32)
    .bind(job.status.as_str())
    .bind(job.failure_reason.map(|reason| reason.as_str()))
    .bind(job.current_target_hint.as_deref())
    .bind(job.lease_owner.as_ref().map(WorkerId::as_str))
    .bind(job.lease_acquired_at)
    .bind(job.lease_expires_at)
    .bind(job.lease_expiries as i32)
    .bind(job.last_sequence)
    .bind(job.summary.as_ref().map(Json))
    .bind(job.started_at)
    .bind(job.completed_at)
    .bind(job.updated_at)
    .fetch_one(&mut *conn)
    .await?
    .try_into()
}

async fn persist_submission(conn: &mut PgConnection, submission: &Submission) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE submissions
        SET status = $2,
            attempt_count = $3,
            last_error_kind = $4,
            last_error_message = $5,
            submitted_at = $6,
            approved_at = $7,
            failed_at = $8,
            updated_at = $9
        WHERE id = $1
        "#,
    )
    .bind(submission.id.0)
    .bind(submission.status.as_str())
    .bind(submission.attempt_count as i32)
    .bind(submission.last_error_kind.map(|kind| kind.as_str()))
    .bind(submission.last_error_message.as_deref())
    .bind(submission.submitted_at)
    .bind(submission.approved_at)
    .bind(submission.failed_at)
    .bind(submission.updated_at)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

impl PostgresJobStore {
    /// Create a store with default lease and retry settings.
    pub async fn new(pool: PgPool) -> Result<Self> {
        Self::new_with_config(pool, &OrchestratorConfig::default()).await
    }

    /// Create a store and verify the database is reachable and migrated.
    pub async fn new_with_config(pool: PgPool, config: &OrchestratorConfig) -> Result<Self> {
        sqlx::query_scalar::<_, i32>("SELECT 1")
            .fetch_one(&pool)
            .await
            .map_err(|e| {
                DirsubError::Internal(format!("job store failed Postgres health check: {e}"))
            })?;

        let table_exists = sqlx::query_scalar::<_, Option<i32>>(
            r#"
            SELECT 1
            FROM information_schema.tables
            WHERE table_name = 'submission_jobs'
            LIMIT 1
            "#,
        )
        .fetch_optional(&pool)
        .await?
        .is_some();

        if !table_exists {
            return Err(DirsubError::Internal(
                "table submission_jobs is missing; run migrations".into(),
            ));
        }
        info!("job store connected to Postgres");

        Ok(Self {
            pool,
            lease: config.lease,
            max_attempts: config.retry.max_attempts,
        })
    }
}

#[async_trait]
impl JobStore for PostgresJobStore {
    async fn create_job(&self, new_job: NewJob) -> Result<(Job, Vec<Submission>)> {
        let mut tx = self.pool.begin().await?;
        let now = db_now(&mut tx).await?;
        let (job, submissions) = new_job.materialize(now)?;

        lock_revisions(&mut tx).await?;
        let job: Job = sqlx::query_as::<_, JobRow>(
            r#"
            INSERT INTO submission_jobs (
                id, customer_id, priority_level, target_count, status, payload,
                created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $7)
            RETURNING *
            "#,
        )
        .bind(job.id.0)
        .bind(&job.customer_id)
        .bind(job.priority_level)
        .bind(job.target_count as i32)
        .bind(job.status.as_str())
        .bind(Json(&job.payload))
        .bind(now)
        .fetch_one(&mut *tx)
        .await?
        .try_into()?;

        for submission in &submissions {
            sqlx::query(
                r#"
                INSERT INTO submissions (
                    id, job_id, position, target_name, target_url, status, updated_at
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7)
                "#,
            )
            .bind(submission.id.0)
            .bind(submission.job_id.0)
            .bind(submission.position as i32)
            .bind(&submission.target_name)
            .bind(submission.target_url.as_deref())
            .bind(submission.status.as_str())
            .bind(now)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        debug!(job_id = %job.id, targets = job.target_count, "created job");
        Ok((job, submissions))
    }

    async fn acquire_next(&self, worker: &WorkerId) -> Result<AcquireOutcome> {
        let mut tx = self.pool.begin().await?;
        let now = db_now(&mut tx).await?;
        let mut outcome = AcquireOutcome::default();

        loop {
            let row = sqlx::query_as::<_, JobRow>(
                r#"
                SELECT *
                FROM submission_jobs
                WHERE status = 'queued'
                   OR (status = 'in_progress'
                       AND (lease_expires_at IS NULL OR lease_expires_at <= $1))
                ORDER BY priority_level DESC, created_at ASC, id ASC
                LIMIT 1
                FOR UPDATE SKIP LOCKED
                "#,
            )
            .bind(now)
            .fetch_optional(&mut *tx)
            .await?;

            let Some(row) = row else {
                break;
            };

            let mut job = Job::try_from(row)?;
            match transitions::lease_job(&mut job, worker, now, &self.lease) {
                LeaseDecision::ExpiredOut => {
                    let job = persist_job(&mut tx, &job).await?;
                    warn!(job_id = %job.id, "job failed after repeated lease expiry");
                    outcome.failed_out.push(job);
                }
                LeaseDecision::Granted => {
                    let job = persist_job(&mut tx, &job).await?;
                    let lease = Lease::from_job(&job).ok_or_else(|| {
                        DirsubError::Internal(format!("job {} granted without lease", job.id))
                    })?;
                    let submissions = load_submissions(&mut tx, job.id, true).await?;
                    outcome.grant = Some(LeaseGrant {
                        lease,
                        job,
                        submissions,
                    });
                    break;
                }
            }
        }

        tx.commit().await?;
        Ok(outcome)
    }

    async fn heartbeat(
        &self,
        worker: &WorkerId,
        job_id: JobId,
        current_target: Option<String>,
    ) -> Result<Lease> {
        let mut tx = self.pool.begin().await?;
        let now = db_now(&mut tx).await?;
        let mut job = lock_job(&mut tx, job_id).await?;
        let (lease, hint_changed) =
            transitions::renew_lease(&mut job, worker, current_target, now, &self.lease)?;

        if hint_changed {
            persist_job(&mut tx, &job).await?;
        } else {
            // Pure renewals do not show up in the change feed.
            sqlx::query("UPDATE submission_jobs SET lease_expires_at = $2 WHERE id = $1")
                .bind(job_id.0)
                .bind(job.lease_expires_at)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        Ok(lease)
    }

    async fn release(&self, worker: &WorkerId, job_id: JobId) -> Result<Job> {
        let mut tx = self.pool.begin().await?;
        let now = db_now(&mut tx).await?;
        let mut job = lock_job(&mut tx, job_id).await?;
        transitions::release_lease(&mut job, worker, now)?;
        let job = persist_job(&mut tx, &job).await?;
        tx.commit().await?;
        Ok(job)
    }

    async fn apply_progress(
        &self,
        worker: &WorkerId,
        report: &ProgressReport,
    ) -> Result<SubmissionUpdate> {
        let mut tx = self.pool.begin().await?;
        let now = db_now(&mut tx).await?;
        let mut job = lock_job(&mut tx, report.job_id).await?;
        let mut submissions = load_submissions(&mut tx, report.job_id, false).await?;

        let index = transitions::apply_report(
            &mut job,
            &mut submissions,
            worker,
            report,
            now,
            &self.lease,
            self.max_attempts,
        )?;
        let submission = submissions.swap_remove(index);
        persist_submission(&mut tx, &submission).await?;
        let job = persist_job(&mut tx, &job).await?;

        tx.commit().await?;
        Ok(SubmissionUpdate { job, submission })
    }

    async fn complete(
        &self,
        worker: &WorkerId,
        job_id: JobId,
        summary: CompletionSummary,
    ) -> Result<Job> {
        let mut tx = self.pool.begin().await?;
        let now = db_now(&mut tx).await?;
        let mut job = lock_job(&mut tx, job_id).await?;
        let submissions = load_submissions(&mut tx, job_id, false).await?;
        transitions::complete(&mut job, &submissions, worker, summary, now)?;
        let job = persist_job(&mut tx, &job).await?;
        tx.commit().await?;
        Ok(job)
    }

    async fn retry_submission(
        &self,
        job_id: JobId,
        submission_id: SubmissionId,
    ) -> Result<SubmissionUpdate> {
        let mut tx = self.pool.begin().await?;
        let now = db_now(&mut tx).await?;
        let mut job = lock_job(&mut tx, job_id).await?;
        let mut submissions = load_submissions(&mut tx, job_id, false).await?;

        let index = transitions::retry_submission(&mut job, &mut submissions, submission_id, now)?;
        let submission = submissions.swap_remove(index);
        persist_submission(&mut tx, &submission).await?;
        let job = persist_job(&mut tx, &job).await?;

        tx.commit().await?;
        Ok(SubmissionUpdate { job, submission })
    }

    async fn pause(&self, job_id: JobId) -> Result<Job> {
        let mut tx = self.pool.begin().await?;
        let now = db_now(&mut tx).await?;
        let mut job = lock_job(&mut tx, job_id).await?;
        transitions::pause(&mut job, now)?;
        let job = persist_job(&mut tx, &job).await?;
        tx.commit().await?;
        Ok(job)
    }

    async fn resume(&self, job_id: JobId) -> Result<Job> {
        let mut tx = self.pool.begin().await?;
        let now = db_now(&mut tx).await?;
        let mut job = lock_job(&mut tx, job_id).await?;
        transitions::resume(&mut job, now)?;
        let job = persist_job(&mut tx, &job).await?;
        tx.commit().await?;
        Ok(job)
    }

    async fn sweep_expired_leases(&self) -> Result<SweepReport> {
        let mut tx = self.pool.begin().await?;
        let now = db_now(&mut tx).await?;

        let rows = sqlx::query_as::<_, JobRow>(
            r#"
            SELECT *
            FROM submission_jobs
            WHERE status = 'in_progress'
              AND (lease_expires_at IS NULL OR lease_expires_at <= $1)
            ORDER BY id
            FOR UPDATE SKIP LOCKED
            "#,
        )
        .bind(now)
        .fetch_all(&mut *tx)
        .await?;

        let mut report = SweepReport::default();
        for row in rows {
            let mut job = Job::try_from(row)?;
            let outcome = transitions::expire_lease(&mut job, now, &self.lease);
            let job = persist_job(&mut tx, &job).await?;
            match outcome {
                ExpiryOutcome::Requeued => report.requeued.push(job),
                ExpiryOutcome::WorkerUnavailable => report.worker_unavailable.push(job),
            }
        }

        tx.commit().await?;
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
        sqlx::query_as::<_, JobRow>("SELECT * FROM submission_jobs WHERE id = $1")
            .bind(job_id.0)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| DirsubError::job_not_found(job_id))?
            .try_into()
    }

    async fn list_submissions(&self, job_id: JobId) -> Result<Vec<Submission>> {
        let mut conn = self.pool.acquire().await?;
        let submissions = load_submissions(&mut conn, job_id, false).await?;
        if submissions.is_empty() {
            // Jobs always carry at least one target, so an empty list means no such job.
            self.get_job(job_id).await?;
        }
        Ok(submissions)
    }

    async fn changes_since(&self, since: i64, limit: usize) -> Result<Vec<Job>> {
        sqlx::query_as::<_, JobRow>(
            "SELECT * FROM submission_jobs WHERE revision > $1 ORDER BY revision LIMIT $2",
        )
        .bind(since)
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?
        .into_iter()
        .map(Job::try_from)
        .collect()
    }

    async fn latest_revision(&self) -> Result<i64> {
        Ok(
            sqlx::query_scalar::<_, i64>("SELECT COALESCE(MAX(revision), 0) FROM submission_jobs")
                .fetch_one(&self.pool)
                .await?,
        )
    }
}

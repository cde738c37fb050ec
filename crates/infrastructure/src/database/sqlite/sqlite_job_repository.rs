use async_trait::async_trait;
use chrono::{DateTime, Utc};
use jobrunner_domain::{
    JobId, JobRecord, JobRepository, JobState, Lease, LeaseRenewal, LeasedJob, StateHistoryEntry,
    StateTransition,
};
use jobrunner_errors::{JobError, JobResult};
use sqlx::sqlite::SqliteRow;
use tracing::{debug, instrument};

use super::{insert_created, load_job, load_parents, transition_in, SqliteJobStorage};
use crate::database::mapping::{parse_job_id, row_to_history, row_to_job, to_ms, JOB_COLUMNS};

impl SqliteJobStorage {
    async fn rows_with_parents(&self, rows: Vec<SqliteRow>) -> JobResult<Vec<JobRecord>> {
        let mut conn = self.pool.acquire().await?;
        let mut jobs = Vec::with_capacity(rows.len());
        for row in rows {
            let mut job = row_to_job(&row)?;
            job.parents = load_parents(&mut conn, &job.id).await?;
            jobs.push(job);
        }
        Ok(jobs)
    }
}

#[async_trait]
impl JobRepository for SqliteJobStorage {
    #[instrument(skip(self, job), fields(job_id = %job.id, handler = %job.payload.handler))]
    async fn create_job(&self, job: &JobRecord) -> JobResult<JobId> {
        let mut tx = self.pool.begin().await?;
        insert_created(&mut tx, job).await?;
        tx.commit().await?;
        debug!("创建任务: {}", job.entity_description());
        Ok(job.id)
    }

    #[instrument(skip(self), fields(job_id = %id))]
    async fn get_job(&self, id: &JobId) -> JobResult<Option<JobRecord>> {
        let mut conn = self.pool.acquire().await?;
        load_job(&mut conn, id).await
    }

    #[instrument(skip(self), fields(job_id = %id))]
    async fn state_history(&self, id: &JobId) -> JobResult<Vec<StateHistoryEntry>> {
        let rows = sqlx::query(
            "SELECT state, reason, at_ms FROM job_state_history WHERE job_id = ? ORDER BY id",
        )
        .bind(id.to_string())
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_history).collect()
    }

    #[instrument(skip(self, transition), fields(job_id = %id, from = %expected, to = %transition.to))]
    async fn compare_and_transition(
        &self,
        id: &JobId,
        expected: JobState,
        transition: StateTransition,
    ) -> JobResult<bool> {
        let mut tx = self.pool.begin().await?;
        let applied = transition_in(&mut tx, id, expected, &transition).await?;
        if applied {
            tx.commit().await?;
        } else {
            tx.rollback().await?;
        }
        Ok(applied)
    }

    #[instrument(skip(self), fields(queue = %queue, owner = %owner))]
    async fn fetch_next_eligible(
        &self,
        queue: &str,
        owner: &str,
        now: DateTime<Utc>,
        lease_until: DateTime<Utc>,
    ) -> JobResult<Option<LeasedJob>> {
        let now_ms = to_ms(now);
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "DELETE FROM job_leases WHERE expires_at_ms <= ? \
             AND job_id IN (SELECT id FROM jobs WHERE queue = ?)",
        )
        .bind(now_ms)
        .bind(queue)
        .execute(&mut *tx)
        .await?;

        let abandoned: Vec<String> = sqlx::query_scalar(
            "SELECT j.id FROM jobs j WHERE j.queue = ? AND j.state = 'PROCESSING' \
             AND NOT EXISTS (SELECT 1 FROM job_leases l WHERE l.job_id = j.id) ORDER BY j.seq",
        )
        .bind(queue)
        .fetch_all(&mut *tx)
        .await?;

        for raw in abandoned {
            let id = parse_job_id(&raw)?;
            let requeue = StateTransition::to(JobState::Enqueued, now)
                .with_reason("租约已过期，重新入队")
                .clear_activation();
            if transition_in(&mut tx, &id, JobState::Processing, &requeue).await? {
                debug!("回收租约过期的任务: {}", id);
            }
        }

        let row = sqlx::query(&format!(
            "SELECT {JOB_COLUMNS} FROM jobs j WHERE j.queue = ? AND j.state = 'ENQUEUED' \
             AND (j.activate_at_ms IS NULL OR j.activate_at_ms <= ?) \
             AND NOT EXISTS (SELECT 1 FROM job_leases l WHERE l.job_id = j.id AND l.expires_at_ms > ?) \
             ORDER BY j.seq LIMIT 1"
        ))
        .bind(queue)
        .bind(now_ms)
        .bind(now_ms)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(row) = row else {
            tx.commit().await?;
            return Ok(None);
        };

        let mut job = row_to_job(&row)?;
        job.parents = load_parents(&mut tx, &job.id).await?;

        sqlx::query(
            r#"
            INSERT INTO job_leases (job_id, owner, acquired_at_ms, expires_at_ms)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(job_id) DO UPDATE SET
                owner = excluded.owner,
                acquired_at_ms = excluded.acquired_at_ms,
                expires_at_ms = excluded.expires_at_ms
            "#,
        )
        .bind(job.id.to_string())
        .bind(owner)
        .bind(now_ms)
        .bind(to_ms(lease_until))
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        let lease = Lease {
            job_id: job.id,
            owner: owner.to_string(),
            acquired_at: now,
            expires_at: lease_until,
        };
        Ok(Some(LeasedJob { job, lease }))
    }

    #[instrument(skip(self), fields(job_id = %id, owner = %owner))]
    async fn renew_lease(
        &self,
        id: &JobId,
        owner: &str,
        now: DateTime<Utc>,
        lease_until: DateTime<Utc>,
    ) -> JobResult<LeaseRenewal> {
        let result = sqlx::query(
            "UPDATE job_leases SET expires_at_ms = ? \
             WHERE job_id = ? AND owner = ? AND expires_at_ms > ?",
        )
        .bind(to_ms(lease_until))
        .bind(id.to_string())
        .bind(owner)
        .bind(to_ms(now))
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(JobError::lease_expired(id, owner));
        }

        let cancellation_requested: Option<bool> =
            sqlx::query_scalar("SELECT cancellation_requested FROM jobs WHERE id = ?")
                .bind(id.to_string())
                .fetch_optional(&self.pool)
                .await?;

        Ok(LeaseRenewal {
            expires_at: lease_until,
            cancellation_requested: cancellation_requested.unwrap_or(false),
        })
    }

    #[instrument(skip(self), fields(job_id = %id, owner = %owner))]
    async fn release_lease(&self, id: &JobId, owner: &str) -> JobResult<()> {
        sqlx::query("DELETE FROM job_leases WHERE job_id = ? AND owner = ?")
            .bind(id.to_string())
            .bind(owner)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn list_due_scheduled(
        &self,
        now: DateTime<Utc>,
        after: Option<JobId>,
        limit: usize,
    ) -> JobResult<Vec<JobRecord>> {
        let rows = sqlx::query(&format!(
            "SELECT {JOB_COLUMNS} FROM jobs WHERE state = 'SCHEDULED' \
             AND (activate_at_ms IS NULL OR activate_at_ms <= ?) \
             AND (? IS NULL OR id > ?) ORDER BY id LIMIT ?"
        ))
        .bind(to_ms(now))
        .bind(after.map(|id| id.to_string()))
        .bind(after.map(|id| id.to_string()))
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        self.rows_with_parents(rows).await
    }

    async fn find_children(&self, parent_id: &JobId) -> JobResult<Vec<JobRecord>> {
        let rows = sqlx::query(&format!(
            "SELECT {JOB_COLUMNS} FROM jobs \
             WHERE id IN (SELECT job_id FROM job_parents WHERE parent_id = ?) ORDER BY seq"
        ))
        .bind(parent_id.to_string())
        .fetch_all(&self.pool)
        .await?;
        self.rows_with_parents(rows).await
    }

    async fn list_awaiting_continuations(
        &self,
        after: Option<JobId>,
        limit: usize,
    ) -> JobResult<Vec<JobRecord>> {
        let rows = sqlx::query(&format!(
            "SELECT {JOB_COLUMNS} FROM jobs WHERE state = 'AWAITING_CONTINUATION' \
             AND (? IS NULL OR id > ?) ORDER BY id LIMIT ?"
        ))
        .bind(after.map(|id| id.to_string()))
        .bind(after.map(|id| id.to_string()))
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        self.rows_with_parents(rows).await
    }

    #[instrument(skip(self), fields(job_id = %id))]
    async fn request_cancellation(&self, id: &JobId) -> JobResult<bool> {
        let result = sqlx::query(
            "UPDATE jobs SET cancellation_requested = 1 WHERE id = ? AND state = 'PROCESSING'",
        )
        .bind(id.to_string())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    #[instrument(skip(self))]
    async fn sweep_expired(&self, now: DateTime<Utc>) -> JobResult<u64> {
        let expired = "SELECT id FROM jobs WHERE state IN ('CREATED', 'SUCCEEDED', 'DELETED') \
                       AND expire_at_ms IS NOT NULL AND expire_at_ms <= ?";
        let now_ms = to_ms(now);
        let mut tx = self.pool.begin().await?;

        for table in ["job_state_history", "job_parents", "job_leases"] {
            sqlx::query(&format!("DELETE FROM {table} WHERE job_id IN ({expired})"))
                .bind(now_ms)
                .execute(&mut *tx)
                .await?;
        }
        let result = sqlx::query(&format!("DELETE FROM jobs WHERE id IN ({expired})"))
            .bind(now_ms)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(result.rows_affected())
    }

    async fn count_by_state(&self, state: JobState) -> JobResult<u64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM jobs WHERE state = ?")
            .bind(state.as_str())
            .fetch_one(&self.pool)
            .await?;
        Ok(count as u64)
    }
}

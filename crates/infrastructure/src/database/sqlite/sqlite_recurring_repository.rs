use async_trait::async_trait;
use chrono::{DateTime, Utc};
use jobrunner_domain::{
    JobRecord, JobState, RecurringJobDefinition, RecurringJobRepository, StateTransition,
};
use jobrunner_errors::JobResult;
use tracing::{debug, instrument};

use super::{insert_created, transition_in, SqliteJobStorage};
use crate::database::mapping::{row_to_recurring, to_ms, RECURRING_COLUMNS};

#[async_trait]
impl RecurringJobRepository for SqliteJobStorage {
    #[instrument(skip(self, definition), fields(recurring_id = %definition.id, cron = %definition.cron))]
    async fn upsert_recurring(&self, definition: &RecurringJobDefinition) -> JobResult<()> {
        sqlx::query(
            r#"
            INSERT INTO recurring_jobs (id, cron, handler, arguments, queue, last_fired_ms,
                                        next_fire_ms, last_job_id, created_at_ms, updated_at_ms)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                cron = excluded.cron,
                handler = excluded.handler,
                arguments = excluded.arguments,
                queue = excluded.queue,
                next_fire_ms = CASE WHEN recurring_jobs.cron = excluded.cron
                                    THEN recurring_jobs.next_fire_ms
                                    ELSE excluded.next_fire_ms END,
                updated_at_ms = excluded.updated_at_ms
            "#,
        )
        .bind(&definition.id)
        .bind(&definition.cron)
        .bind(&definition.payload.handler)
        .bind(serde_json::to_string(&definition.payload.arguments)?)
        .bind(&definition.queue)
        .bind(definition.last_fired_at.map(to_ms))
        .bind(to_ms(definition.next_fire_at))
        .bind(definition.last_job_id.map(|id| id.to_string()))
        .bind(to_ms(definition.created_at))
        .bind(to_ms(definition.updated_at))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_recurring(&self, id: &str) -> JobResult<Option<RecurringJobDefinition>> {
        let row = sqlx::query(&format!(
            "SELECT {RECURRING_COLUMNS} FROM recurring_jobs WHERE id = ?"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(row_to_recurring).transpose()
    }

    async fn list_recurring(&self) -> JobResult<Vec<RecurringJobDefinition>> {
        let rows = sqlx::query(&format!(
            "SELECT {RECURRING_COLUMNS} FROM recurring_jobs ORDER BY id"
        ))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_recurring).collect()
    }

    #[instrument(skip(self))]
    async fn remove_recurring(&self, id: &str) -> JobResult<bool> {
        let result = sqlx::query("DELETE FROM recurring_jobs WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn list_due_recurring(
        &self,
        now: DateTime<Utc>,
    ) -> JobResult<Vec<RecurringJobDefinition>> {
        let rows = sqlx::query(&format!(
            "SELECT {RECURRING_COLUMNS} FROM recurring_jobs WHERE next_fire_ms <= ? ORDER BY next_fire_ms"
        ))
        .bind(to_ms(now))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_recurring).collect()
    }

    #[instrument(skip(self, job), fields(recurring_id = %id, job_id = %job.id))]
    async fn fire_recurring(
        &self,
        id: &str,
        expected_next_fire: DateTime<Utc>,
        job: &JobRecord,
        fired_at: DateTime<Utc>,
        next_fire: DateTime<Utc>,
    ) -> JobResult<bool> {
        let mut tx = self.pool.begin().await?;

        let advanced = sqlx::query(
            r#"
            UPDATE recurring_jobs
            SET last_fired_ms = ?, next_fire_ms = ?, last_job_id = ?, updated_at_ms = ?
            WHERE id = ? AND next_fire_ms = ?
            "#,
        )
        .bind(to_ms(fired_at))
        .bind(to_ms(next_fire))
        .bind(job.id.to_string())
        .bind(to_ms(fired_at))
        .bind(id)
        .bind(to_ms(expected_next_fire))
        .execute(&mut *tx)
        .await?;

        if advanced.rows_affected() == 0 {
            tx.rollback().await?;
            debug!("周期任务 {} 已被其他实例触发", id);
            return Ok(false);
        }

        insert_created(&mut tx, job).await?;
        let enqueue = StateTransition::to(JobState::Enqueued, fired_at)
            .with_reason(format!("由周期任务 {id} 触发"));
        transition_in(&mut tx, &job.id, JobState::Created, &enqueue).await?;

        tx.commit().await?;
        Ok(true)
    }
}

mod sqlite_job_repository;
mod sqlite_recurring_repository;

use std::str::FromStr;
use std::time::Duration;

use jobrunner_core::StorageConfig;
use jobrunner_domain::{apply_transition, JobId, JobRecord, JobState, StateTransition};
use jobrunner_errors::{JobError, JobResult};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{SqliteConnection, SqlitePool};
use tracing::debug;

use crate::database::mapping::{parse_job_id, row_to_job, to_ms, to_ms_ceil, JOB_COLUMNS};

/// 基于 SQLite 的持久化存储
///
/// 所有写事务的第一条语句都是写操作，保证事务一开始就拿到写锁，
/// 避免读锁升级时的 SQLITE_BUSY。
#[derive(Debug, Clone)]
pub struct SqliteJobStorage {
    pool: SqlitePool,
}

impl SqliteJobStorage {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str, max_connections: u32) -> JobResult<Self> {
        Self::connect_with_timeout(database_url, max_connections, Duration::from_secs(300)).await
    }

    pub async fn from_config(config: &StorageConfig) -> JobResult<Self> {
        Self::connect_with_timeout(
            &config.database_url,
            config.max_connections,
            Duration::from_secs(config.command_timeout_seconds),
        )
        .await
    }

    async fn connect_with_timeout(
        database_url: &str,
        max_connections: u32,
        busy_timeout: Duration,
    ) -> JobResult<Self> {
        debug!("连接SQLite数据库: {}", database_url);

        let connect_options = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true)
            .foreign_keys(true)
            .busy_timeout(busy_timeout)
            .journal_mode(SqliteJournalMode::Wal);

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .min_connections(1)
            .connect_with(connect_options)
            .await?;

        let storage = Self { pool };
        storage.migrate().await?;
        Ok(storage)
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// 初始化表结构，可重复执行
    pub async fn migrate(&self) -> JobResult<()> {
        debug!("执行SQLite数据库迁移");

        let statements = [
            r#"
            CREATE TABLE IF NOT EXISTS jobs (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                id TEXT NOT NULL UNIQUE,
                handler TEXT NOT NULL,
                arguments TEXT NOT NULL DEFAULT 'null',
                state TEXT NOT NULL,
                queue TEXT NOT NULL,
                created_at_ms INTEGER NOT NULL,
                state_changed_at_ms INTEGER NOT NULL,
                activate_at_ms INTEGER,
                retry_count INTEGER NOT NULL DEFAULT 0,
                max_retries INTEGER NOT NULL DEFAULT 0,
                last_failure TEXT,
                continuation_policy TEXT NOT NULL DEFAULT 'ONLY_ON_SUCCEEDED',
                expire_at_ms INTEGER,
                cancellation_requested INTEGER NOT NULL DEFAULT 0
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS job_leases (
                job_id TEXT PRIMARY KEY,
                owner TEXT NOT NULL,
                acquired_at_ms INTEGER NOT NULL,
                expires_at_ms INTEGER NOT NULL
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS job_parents (
                job_id TEXT NOT NULL,
                parent_id TEXT NOT NULL,
                position INTEGER NOT NULL,
                PRIMARY KEY (job_id, parent_id)
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS job_state_history (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                job_id TEXT NOT NULL,
                state TEXT NOT NULL,
                reason TEXT,
                at_ms INTEGER NOT NULL
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS recurring_jobs (
                id TEXT PRIMARY KEY,
                cron TEXT NOT NULL,
                handler TEXT NOT NULL,
                arguments TEXT NOT NULL DEFAULT 'null',
                queue TEXT NOT NULL,
                last_fired_ms INTEGER,
                next_fire_ms INTEGER NOT NULL,
                last_job_id TEXT,
                created_at_ms INTEGER NOT NULL,
                updated_at_ms INTEGER NOT NULL
            )
            "#,
            "CREATE INDEX IF NOT EXISTS idx_jobs_queue_state ON jobs(queue, state, activate_at_ms)",
            "CREATE INDEX IF NOT EXISTS idx_jobs_state_expire ON jobs(state, expire_at_ms)",
            "CREATE INDEX IF NOT EXISTS idx_job_leases_expires ON job_leases(expires_at_ms)",
            "CREATE INDEX IF NOT EXISTS idx_job_parents_parent ON job_parents(parent_id)",
            "CREATE INDEX IF NOT EXISTS idx_job_history_job ON job_state_history(job_id)",
            "CREATE INDEX IF NOT EXISTS idx_recurring_next_fire ON recurring_jobs(next_fire_ms)",
        ];

        for sql in statements {
            sqlx::query(sql).execute(&self.pool).await?;
        }

        debug!("SQLite数据库迁移完成");
        Ok(())
    }
}

pub(crate) async fn load_parents(conn: &mut SqliteConnection, id: &JobId) -> JobResult<Vec<JobId>> {
    let parents: Vec<String> =
        sqlx::query_scalar("SELECT parent_id FROM job_parents WHERE job_id = ? ORDER BY position")
            .bind(id.to_string())
            .fetch_all(&mut *conn)
            .await?;
    parents.iter().map(|raw| parse_job_id(raw)).collect()
}

pub(crate) async fn load_job(
    conn: &mut SqliteConnection,
    id: &JobId,
) -> JobResult<Option<JobRecord>> {
    let row = sqlx::query(&format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = ?"))
        .bind(id.to_string())
        .fetch_optional(&mut *conn)
        .await?;
    match row {
        Some(row) => {
            let mut job = row_to_job(&row)?;
            job.parents = load_parents(conn, id).await?;
            Ok(Some(job))
        }
        None => Ok(None),
    }
}

pub(crate) async fn insert_created(conn: &mut SqliteConnection, job: &JobRecord) -> JobResult<()> {
    if job.state != JobState::Created {
        return Err(JobError::validation_error(format!(
            "新任务必须处于 CREATED 状态: {}",
            job.state
        )));
    }

    let last_failure = job
        .last_failure
        .as_ref()
        .map(serde_json::to_string)
        .transpose()?;

    sqlx::query(
        r#"
        INSERT INTO jobs (id, handler, arguments, state, queue, created_at_ms, state_changed_at_ms,
                          activate_at_ms, retry_count, max_retries, last_failure,
                          continuation_policy, expire_at_ms, cancellation_requested)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(job.id.to_string())
    .bind(&job.payload.handler)
    .bind(serde_json::to_string(&job.payload.arguments)?)
    .bind(job.state.as_str())
    .bind(&job.queue)
    .bind(to_ms(job.created_at))
    .bind(to_ms(job.state_changed_at))
    .bind(job.activate_at.map(to_ms_ceil))
    .bind(job.retry_count as i64)
    .bind(job.max_retries as i64)
    .bind(last_failure)
    .bind(job.continuation_policy.as_str())
    .bind(job.expire_at.map(to_ms))
    .bind(job.cancellation_requested)
    .execute(&mut *conn)
    .await
    .map_err(|e| match e {
        sqlx::Error::Database(ref db) if db.is_unique_violation() => JobError::DuplicateId {
            job_id: job.id.to_string(),
        },
        other => JobError::Database(other),
    })?;

    for (position, parent) in job.parents.iter().enumerate() {
        sqlx::query("INSERT OR IGNORE INTO job_parents (job_id, parent_id, position) VALUES (?, ?, ?)")
            .bind(job.id.to_string())
            .bind(parent.to_string())
            .bind(position as i64)
            .execute(&mut *conn)
            .await?;
    }

    sqlx::query("INSERT INTO job_state_history (job_id, state, reason, at_ms) VALUES (?, ?, NULL, ?)")
        .bind(job.id.to_string())
        .bind(JobState::Created.as_str())
        .bind(to_ms(job.created_at))
        .execute(&mut *conn)
        .await?;

    Ok(())
}

/// 在当前事务内执行条件状态转换
pub(crate) async fn transition_in(
    conn: &mut SqliteConnection,
    id: &JobId,
    expected: JobState,
    transition: &StateTransition,
) -> JobResult<bool> {
    let guard = sqlx::query("UPDATE jobs SET state = state WHERE id = ? AND state = ?")
        .bind(id.to_string())
        .bind(expected.as_str())
        .execute(&mut *conn)
        .await?;
    if guard.rows_affected() == 0 {
        return Ok(false);
    }

    if let Some(owner) = transition.required_lease_owner() {
        let held: Option<i64> = sqlx::query_scalar(
            "SELECT 1 FROM job_leases WHERE job_id = ? AND owner = ? AND expires_at_ms > ?",
        )
        .bind(id.to_string())
        .bind(owner)
        .bind(to_ms(transition.at))
        .fetch_optional(&mut *conn)
        .await?;
        if held.is_none() {
            return Ok(false);
        }
    }

    let Some(mut record) = load_job(conn, id).await? else {
        return Ok(false);
    };
    let entries = apply_transition(&mut record, expected, transition)?;

    let last_failure = record
        .last_failure
        .as_ref()
        .map(serde_json::to_string)
        .transpose()?;

    sqlx::query(
        r#"
        UPDATE jobs
        SET state = ?, state_changed_at_ms = ?, activate_at_ms = ?, retry_count = ?,
            last_failure = ?, expire_at_ms = ?, cancellation_requested = ?
        WHERE id = ?
        "#,
    )
    .bind(record.state.as_str())
    .bind(to_ms(record.state_changed_at))
    .bind(record.activate_at.map(to_ms_ceil))
    .bind(record.retry_count as i64)
    .bind(last_failure)
    .bind(record.expire_at.map(to_ms))
    .bind(record.cancellation_requested)
    .bind(id.to_string())
    .execute(&mut *conn)
    .await?;

    for entry in entries {
        sqlx::query("INSERT INTO job_state_history (job_id, state, reason, at_ms) VALUES (?, ?, ?, ?)")
            .bind(id.to_string())
            .bind(entry.state.as_str())
            .bind(entry.reason)
            .bind(to_ms(entry.at))
            .execute(&mut *conn)
            .await?;
    }

    if transition.releases_lease() {
        sqlx::query("DELETE FROM job_leases WHERE job_id = ?")
            .bind(id.to_string())
            .execute(&mut *conn)
            .await?;
    }

    Ok(true)
}

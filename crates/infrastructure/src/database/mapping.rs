use std::str::FromStr;

use chrono::{DateTime, Utc};
use jobrunner_domain::{
    ContinuationPolicy, FailureDetail, JobId, JobPayload, JobRecord, JobState,
    RecurringJobDefinition, StateHistoryEntry,
};
use jobrunner_errors::{JobError, JobResult};
use sqlx::sqlite::SqliteRow;
use sqlx::Row;

/// 时间戳以整数毫秒存储
pub fn to_ms(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

/// 激活时间向上取整，保证毫秒精度下也不会提前取出任务
pub fn to_ms_ceil(at: DateTime<Utc>) -> i64 {
    let ms = at.timestamp_millis();
    if at.timestamp_subsec_nanos() % 1_000_000 == 0 {
        ms
    } else {
        ms + 1
    }
}

pub fn from_ms(ms: i64) -> JobResult<DateTime<Utc>> {
    DateTime::<Utc>::from_timestamp_millis(ms)
        .ok_or_else(|| JobError::Serialization(format!("无效的时间戳: {ms}")))
}

fn opt_from_ms(ms: Option<i64>) -> JobResult<Option<DateTime<Utc>>> {
    ms.map(from_ms).transpose()
}

pub fn parse_job_id(value: &str) -> JobResult<JobId> {
    JobId::from_str(value).map_err(|e| JobError::Serialization(e.to_string()))
}

pub const JOB_COLUMNS: &str = "id, handler, arguments, state, queue, created_at_ms, \
    state_changed_at_ms, activate_at_ms, retry_count, max_retries, last_failure, \
    continuation_policy, expire_at_ms, cancellation_requested";

/// 父任务列表单独存放在 job_parents 表，由调用方补齐
pub fn row_to_job(row: &SqliteRow) -> JobResult<JobRecord> {
    let id: String = row.try_get("id")?;
    let arguments: String = row.try_get("arguments")?;
    let state: String = row.try_get("state")?;
    let policy: String = row.try_get("continuation_policy")?;
    let last_failure: Option<String> = row.try_get("last_failure")?;
    let retry_count: i64 = row.try_get("retry_count")?;
    let max_retries: i64 = row.try_get("max_retries")?;

    Ok(JobRecord {
        id: parse_job_id(&id)?,
        payload: JobPayload {
            handler: row.try_get("handler")?,
            arguments: serde_json::from_str(&arguments)?,
        },
        state: JobState::from_str(&state)?,
        queue: row.try_get("queue")?,
        created_at: from_ms(row.try_get("created_at_ms")?)?,
        state_changed_at: from_ms(row.try_get("state_changed_at_ms")?)?,
        activate_at: opt_from_ms(row.try_get("activate_at_ms")?)?,
        retry_count: retry_count as u32,
        max_retries: max_retries as u32,
        last_failure: last_failure
            .map(|raw| serde_json::from_str::<FailureDetail>(&raw))
            .transpose()?,
        parents: Vec::new(),
        continuation_policy: ContinuationPolicy::from_str(&policy)?,
        expire_at: opt_from_ms(row.try_get("expire_at_ms")?)?,
        cancellation_requested: row.try_get("cancellation_requested")?,
    })
}

pub fn row_to_history(row: &SqliteRow) -> JobResult<StateHistoryEntry> {
    let state: String = row.try_get("state")?;
    Ok(StateHistoryEntry {
        state: JobState::from_str(&state)?,
        reason: row.try_get("reason")?,
        at: from_ms(row.try_get("at_ms")?)?,
    })
}

pub const RECURRING_COLUMNS: &str = "id, cron, handler, arguments, queue, last_fired_ms, \
    next_fire_ms, last_job_id, created_at_ms, updated_at_ms";

pub fn row_to_recurring(row: &SqliteRow) -> JobResult<RecurringJobDefinition> {
    let arguments: String = row.try_get("arguments")?;
    let last_job_id: Option<String> = row.try_get("last_job_id")?;

    Ok(RecurringJobDefinition {
        id: row.try_get("id")?,
        cron: row.try_get("cron")?,
        payload: JobPayload {
            handler: row.try_get("handler")?,
            arguments: serde_json::from_str(&arguments)?,
        },
        queue: row.try_get("queue")?,
        last_fired_at: opt_from_ms(row.try_get("last_fired_ms")?)?,
        next_fire_at: from_ms(row.try_get("next_fire_ms")?)?,
        last_job_id: last_job_id.as_deref().map(parse_job_id).transpose()?,
        created_at: from_ms(row.try_get("created_at_ms")?)?,
        updated_at: from_ms(row.try_get("updated_at_ms")?)?,
    })
}

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use jobrunner_errors::JobError;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const DEFAULT_QUEUE: &str = "default";

/// 任务ID，基于UUID v7，按创建时间有序
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.hyphenated())
    }
}

impl FromStr for JobId {
    type Err = JobError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|e| JobError::validation_error(format!("无效的任务ID '{s}': {e}")))
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum JobState {
    #[serde(rename = "CREATED")]
    Created,
    #[serde(rename = "ENQUEUED")]
    Enqueued,
    #[serde(rename = "SCHEDULED")]
    Scheduled,
    #[serde(rename = "AWAITING_CONTINUATION")]
    AwaitingContinuation,
    #[serde(rename = "PROCESSING")]
    Processing,
    #[serde(rename = "SUCCEEDED")]
    Succeeded,
    #[serde(rename = "FAILED")]
    Failed,
    #[serde(rename = "DELETED")]
    Deleted,
}

impl JobState {
    pub const ALL: [JobState; 8] = [
        JobState::Created,
        JobState::Enqueued,
        JobState::Scheduled,
        JobState::AwaitingContinuation,
        JobState::Processing,
        JobState::Succeeded,
        JobState::Failed,
        JobState::Deleted,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Created => "CREATED",
            JobState::Enqueued => "ENQUEUED",
            JobState::Scheduled => "SCHEDULED",
            JobState::AwaitingContinuation => "AWAITING_CONTINUATION",
            JobState::Processing => "PROCESSING",
            JobState::Succeeded => "SUCCEEDED",
            JobState::Failed => "FAILED",
            JobState::Deleted => "DELETED",
        }
    }

    /// 终态：Succeeded 与 Deleted，之后不再发生任何转换
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Succeeded | JobState::Deleted)
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobState {
    type Err = JobError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobState::ALL
            .iter()
            .copied()
            .find(|state| state.as_str() == s)
            .ok_or_else(|| JobError::validation_error(format!("Invalid job state: {s}")))
    }
}

/// 处理器引用：处理器名称 + 不透明的参数
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobPayload {
    pub handler: String,
    #[serde(default)]
    pub arguments: serde_json::Value,
}

impl JobPayload {
    pub fn new(handler: impl Into<String>, arguments: serde_json::Value) -> Self {
        Self {
            handler: handler.into(),
            arguments,
        }
    }

    pub fn handler_only(handler: impl Into<String>) -> Self {
        Self::new(handler, serde_json::Value::Null)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum FailureKind {
    #[serde(rename = "RECOVERABLE")]
    Recoverable,
    #[serde(rename = "ABORTED")]
    Aborted,
    #[serde(rename = "TIMED_OUT")]
    TimedOut,
    #[serde(rename = "HANDLER_MISSING")]
    HandlerMissing,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureDetail {
    pub kind: FailureKind,
    pub message: String,
    /// 第几次尝试失败（从1开始）
    pub attempt: u32,
    pub occurred_at: DateTime<Utc>,
}

/// 延续任务的触发策略
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub enum ContinuationPolicy {
    /// 所有父任务成功后才触发（默认）
    #[default]
    #[serde(rename = "ONLY_ON_SUCCEEDED")]
    OnlyOnSucceeded,
    /// 所有父任务进入任一终态后触发
    #[serde(rename = "ON_ANY_FINISHED_STATE")]
    OnAnyFinishedState,
}

impl ContinuationPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContinuationPolicy::OnlyOnSucceeded => "ONLY_ON_SUCCEEDED",
            ContinuationPolicy::OnAnyFinishedState => "ON_ANY_FINISHED_STATE",
        }
    }

    pub fn is_satisfied_by(&self, parent_state: JobState) -> bool {
        match self {
            ContinuationPolicy::OnlyOnSucceeded => parent_state == JobState::Succeeded,
            ContinuationPolicy::OnAnyFinishedState => parent_state.is_terminal(),
        }
    }
}

impl FromStr for ContinuationPolicy {
    type Err = JobError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ONLY_ON_SUCCEEDED" => Ok(ContinuationPolicy::OnlyOnSucceeded),
            "ON_ANY_FINISHED_STATE" => Ok(ContinuationPolicy::OnAnyFinishedState),
            _ => Err(JobError::validation_error(format!(
                "Invalid continuation policy: {s}"
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: JobId,
    pub payload: JobPayload,
    pub state: JobState,
    pub queue: String,
    pub created_at: DateTime<Utc>,
    pub state_changed_at: DateTime<Utc>,
    /// 可执行时间，未到达前不会被取出执行
    pub activate_at: Option<DateTime<Utc>>,
    pub retry_count: u32,
    pub max_retries: u32,
    pub last_failure: Option<FailureDetail>,
    pub parents: Vec<JobId>,
    pub continuation_policy: ContinuationPolicy,
    /// 记录过期时间，仅 Created 与终态记录设置
    pub expire_at: Option<DateTime<Utc>>,
    pub cancellation_requested: bool,
}

impl JobRecord {
    pub fn new(payload: JobPayload, now: DateTime<Utc>) -> Self {
        Self {
            id: JobId::new(),
            payload,
            state: JobState::Created,
            queue: DEFAULT_QUEUE.to_string(),
            created_at: now,
            state_changed_at: now,
            activate_at: None,
            retry_count: 0,
            max_retries: 0,
            last_failure: None,
            parents: Vec::new(),
            continuation_policy: ContinuationPolicy::default(),
            expire_at: None,
            cancellation_requested: false,
        }
    }

    pub fn with_queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = queue.into();
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_parents(mut self, parents: Vec<JobId>, policy: ContinuationPolicy) -> Self {
        self.parents = parents;
        self.continuation_policy = policy;
        self
    }

    pub fn with_expiration(mut self, expire_at: Option<DateTime<Utc>>) -> Self {
        self.expire_at = expire_at;
        self
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    pub fn is_activation_elapsed(&self, now: DateTime<Utc>) -> bool {
        self.activate_at.map_or(true, |at| at <= now)
    }

    /// 剩余可重试次数
    pub fn retries_remaining(&self) -> u32 {
        self.max_retries.saturating_sub(self.retry_count)
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        matches!(
            self.state,
            JobState::Created | JobState::Succeeded | JobState::Deleted
        ) && self.expire_at.is_some_and(|at| at <= now)
    }

    pub fn entity_description(&self) -> String {
        format!(
            "任务 {} (处理器: {}, 队列: {}, 状态: {})",
            self.id, self.payload.handler, self.queue, self.state
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateHistoryEntry {
    pub state: JobState,
    pub reason: Option<String>,
    pub at: DateTime<Utc>,
}

/// 任务租约：某一Worker在有效期内对任务的独占声明
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Lease {
    pub job_id: JobId,
    pub owner: String,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl Lease {
    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at > now
    }

    pub fn is_held_by(&self, owner: &str, now: DateTime<Utc>) -> bool {
        self.owner == owner && self.is_valid_at(now)
    }
}

#[derive(Debug, Clone)]
pub struct LeasedJob {
    pub job: JobRecord,
    pub lease: Lease,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeaseRenewal {
    pub expires_at: DateTime<Utc>,
    pub cancellation_requested: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecurringJobDefinition {
    pub id: String,
    pub cron: String,
    pub payload: JobPayload,
    pub queue: String,
    pub last_fired_at: Option<DateTime<Utc>>,
    pub next_fire_at: DateTime<Utc>,
    pub last_job_id: Option<JobId>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl RecurringJobDefinition {
    pub fn new(
        id: impl Into<String>,
        cron: impl Into<String>,
        payload: JobPayload,
        next_fire_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: id.into(),
            cron: cron.into(),
            payload,
            queue: DEFAULT_QUEUE.to_string(),
            last_fired_at: None,
            next_fire_at,
            last_job_id: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = queue.into();
        self
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.next_fire_at <= now
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_job_state_round_trip_through_str() {
        for state in JobState::ALL {
            assert_eq!(state.as_str().parse::<JobState>().unwrap(), state);
        }
        assert!("RUNNING".parse::<JobState>().is_err());
    }

    #[test]
    fn test_job_ids_sort_by_creation() {
        let first = JobId::new();
        let second = JobId::new();
        assert!(first < second);
        assert!(first.to_string() < second.to_string());
    }

    #[test]
    fn test_activation_and_expiry() {
        let now = Utc::now();
        let mut job = JobRecord::new(JobPayload::handler_only("noop"), now);
        assert!(job.is_activation_elapsed(now));

        job.activate_at = Some(now + Duration::seconds(10));
        assert!(!job.is_activation_elapsed(now));
        assert!(job.is_activation_elapsed(now + Duration::seconds(10)));

        job.expire_at = Some(now);
        assert!(job.is_expired(now));
        job.state = JobState::Enqueued;
        assert!(!job.is_expired(now));
    }

    #[test]
    fn test_continuation_policy() {
        let strict = ContinuationPolicy::OnlyOnSucceeded;
        assert!(strict.is_satisfied_by(JobState::Succeeded));
        assert!(!strict.is_satisfied_by(JobState::Deleted));

        let relaxed = ContinuationPolicy::OnAnyFinishedState;
        assert!(relaxed.is_satisfied_by(JobState::Deleted));
        assert!(!relaxed.is_satisfied_by(JobState::Failed));
    }

    #[test]
    fn test_lease_validity() {
        let now = Utc::now();
        let lease = Lease {
            job_id: JobId::new(),
            owner: "host:1:a:0".to_string(),
            acquired_at: now,
            expires_at: now + Duration::seconds(30),
        };
        assert!(lease.is_held_by("host:1:a:0", now));
        assert!(!lease.is_held_by("host:2:b:0", now));
        assert!(!lease.is_valid_at(now + Duration::seconds(30)));
    }
}

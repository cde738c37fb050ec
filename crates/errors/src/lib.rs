use thiserror::Error;

#[cfg(test)]
mod tests;

#[derive(Debug, Error)]
pub enum JobError {
    #[error("任务状态已变更: 任务 {job_id} 期望状态 {expected}, 实际状态 {actual}")]
    StaleState {
        job_id: String,
        expected: String,
        actual: String,
    },
    #[error("非法的状态转换: 任务 {job_id} 不能从 {from} 转换到 {to}")]
    InvalidTransition {
        job_id: String,
        from: String,
        to: String,
    },
    #[error("任务ID重复: {job_id}")]
    DuplicateId { job_id: String },
    #[error("任务未找到: {job_id}")]
    JobNotFound { job_id: String },
    #[error("周期任务未找到: {id}")]
    RecurringJobNotFound { id: String },
    #[error("存储暂时不可用: {0}")]
    TransientStore(String),
    #[error("存储发生致命错误: {0}")]
    FatalStore(String),
    #[error("数据库错误: {0}")]
    Database(#[from] sqlx::Error),
    #[error("任务处理失败: {0}")]
    Handler(String),
    #[error("任务处理被中止: {0}")]
    HandlerAbort(String),
    #[error("未注册的任务处理器: {0}")]
    HandlerNotFound(String),
    #[error("任务执行超时")]
    ExecutionTimeout,
    #[error("租约已失效: 任务 {job_id}, 持有者 {owner}")]
    LeaseExpired { job_id: String, owner: String },
    #[error("无效的CRON表达式: {expr} - {message}")]
    InvalidCron { expr: String, message: String },
    #[error("配置错误: {0}")]
    Configuration(String),
    #[error("序列化错误: {0}")]
    Serialization(String),
    #[error("数据验证失败: {0}")]
    Validation(String),
    #[error("内部错误: {0}")]
    Internal(String),
}

pub type JobResult<T> = Result<T, JobError>;

impl JobError {
    pub fn job_not_found(job_id: impl ToString) -> Self {
        Self::JobNotFound {
            job_id: job_id.to_string(),
        }
    }
    pub fn recurring_not_found<S: Into<String>>(id: S) -> Self {
        Self::RecurringJobNotFound { id: id.into() }
    }
    pub fn lease_expired(job_id: impl ToString, owner: impl Into<String>) -> Self {
        Self::LeaseExpired {
            job_id: job_id.to_string(),
            owner: owner.into(),
        }
    }
    pub fn transient<S: Into<String>>(msg: S) -> Self {
        Self::TransientStore(msg.into())
    }
    pub fn fatal<S: Into<String>>(msg: S) -> Self {
        Self::FatalStore(msg.into())
    }
    pub fn handler<S: Into<String>>(msg: S) -> Self {
        Self::Handler(msg.into())
    }
    pub fn abort<S: Into<String>>(msg: S) -> Self {
        Self::HandlerAbort(msg.into())
    }
    pub fn config_error<S: Into<String>>(msg: S) -> Self {
        Self::Configuration(msg.into())
    }
    pub fn validation_error<S: Into<String>>(msg: S) -> Self {
        Self::Validation(msg.into())
    }

    /// 致命错误会终止所在组件的循环并上报给运维
    pub fn is_fatal(&self) -> bool {
        match self {
            JobError::FatalStore(_) | JobError::Configuration(_) | JobError::Internal(_) => true,
            JobError::Database(e) => !is_transient_sqlx(e),
            _ => false,
        }
    }

    /// 存储层瞬时错误，调用方应退避后重试
    pub fn is_retryable(&self) -> bool {
        match self {
            JobError::TransientStore(_) => true,
            JobError::Database(e) => is_transient_sqlx(e),
            _ => false,
        }
    }

    /// 乐观并发冲突，属于预期情况
    pub fn is_stale(&self) -> bool {
        matches!(self, JobError::StaleState { .. })
    }

    /// 处理器返回的错误是否跳过剩余重试直接进入死信
    pub fn is_abort(&self) -> bool {
        matches!(self, JobError::HandlerAbort(_))
    }
}

fn is_transient_sqlx(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) | sqlx::Error::WorkerCrashed => true,
        sqlx::Error::Database(db) => {
            // SQLITE_BUSY(5) / SQLITE_LOCKED(6)
            matches!(db.code().as_deref(), Some("5") | Some("6") | Some("517"))
        }
        _ => false,
    }
}

impl From<serde_json::Error> for JobError {
    fn from(err: serde_json::Error) -> Self {
        JobError::Serialization(err.to_string())
    }
}

impl From<anyhow::Error> for JobError {
    fn from(err: anyhow::Error) -> Self {
        JobError::Internal(err.to_string())
    }
}

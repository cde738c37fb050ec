use std::time::Duration;

use jobrunner_domain::DEFAULT_QUEUE;
use jobrunner_errors::{JobError, JobResult};
use serde::{Deserialize, Serialize};

use super::validation::{ConfigValidator, ValidationUtils};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    #[default]
    Sqlite,
    Memory,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub backend: StorageBackend,
    pub database_url: String,
    pub max_connections: u32,
    /// 单条语句的超时时间
    pub command_timeout_seconds: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::Sqlite,
            database_url: "sqlite://jobrunner.db".to_string(),
            max_connections: 10,
            command_timeout_seconds: 300,
        }
    }
}

impl ConfigValidator for StorageConfig {
    fn validate(&self) -> JobResult<()> {
        if self.backend == StorageBackend::Sqlite {
            ValidationUtils::validate_not_empty(&self.database_url, "storage.database_url")?;
            if !self.database_url.starts_with("sqlite:") {
                return Err(JobError::config_error(format!(
                    "storage.database_url 必须以 sqlite: 开头: {}",
                    self.database_url
                )));
            }
        }
        ValidationUtils::validate_count(
            self.max_connections as usize,
            "storage.max_connections",
            1000,
        )?;
        ValidationUtils::validate_positive(
            self.command_timeout_seconds,
            "storage.command_timeout_seconds",
        )?;
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub enabled: bool,
    /// 0 表示连续轮询
    pub poll_interval_ms: u64,
    pub page_size: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            poll_interval_ms: 15_000,
            page_size: 100,
        }
    }
}

impl SchedulerConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

impl ConfigValidator for SchedulerConfig {
    fn validate(&self) -> JobResult<()> {
        ValidationUtils::validate_count(self.page_size, "scheduler.page_size", 10_000)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub enabled: bool,
    pub worker_count: usize,
    /// 按优先级排列的队列
    pub queues: Vec<String>,
    pub poll_interval_ms: u64,
    pub lease_timeout_seconds: u64,
    pub heartbeat_interval_seconds: u64,
    pub execution_timeout_seconds: u64,
    pub shutdown_timeout_seconds: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            worker_count: default_worker_count(),
            queues: vec![DEFAULT_QUEUE.to_string()],
            poll_interval_ms: 0,
            lease_timeout_seconds: 300,
            heartbeat_interval_seconds: 30,
            execution_timeout_seconds: 300,
            shutdown_timeout_seconds: 30,
        }
    }
}

fn default_worker_count() -> usize {
    let cpus = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1);
    (cpus * 5).min(20)
}

impl WorkerConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn lease_timeout(&self) -> Duration {
        Duration::from_secs(self.lease_timeout_seconds)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_seconds)
    }

    pub fn execution_timeout(&self) -> Duration {
        Duration::from_secs(self.execution_timeout_seconds)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_seconds)
    }
}

impl ConfigValidator for WorkerConfig {
    fn validate(&self) -> JobResult<()> {
        ValidationUtils::validate_count(self.worker_count, "worker.worker_count", 1000)?;
        if self.queues.is_empty() {
            return Err(JobError::config_error("worker.queues 不能为空"));
        }
        for queue in &self.queues {
            ValidationUtils::validate_not_empty(queue, "worker.queues")?;
        }
        ValidationUtils::validate_positive(
            self.lease_timeout_seconds,
            "worker.lease_timeout_seconds",
        )?;
        ValidationUtils::validate_positive(
            self.heartbeat_interval_seconds,
            "worker.heartbeat_interval_seconds",
        )?;
        if self.heartbeat_interval_seconds >= self.lease_timeout_seconds {
            return Err(JobError::config_error(
                "worker.heartbeat_interval_seconds 必须小于 worker.lease_timeout_seconds",
            ));
        }
        ValidationUtils::validate_positive(
            self.execution_timeout_seconds,
            "worker.execution_timeout_seconds",
        )?;
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// 未显式指定时新任务的最大重试次数
    pub default_max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff_multiplier: f64,
    pub jitter_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            default_max_retries: 10,
            base_delay_ms: 15_000,
            max_delay_ms: 3_600_000,
            backoff_multiplier: 2.0,
            jitter_factor: 0.1,
        }
    }
}

impl ConfigValidator for RetryConfig {
    fn validate(&self) -> JobResult<()> {
        ValidationUtils::validate_positive(self.base_delay_ms, "retry.base_delay_ms")?;
        if self.max_delay_ms < self.base_delay_ms {
            return Err(JobError::config_error(
                "retry.max_delay_ms 不能小于 retry.base_delay_ms",
            ));
        }
        if self.backoff_multiplier < 1.0 {
            return Err(JobError::config_error("retry.backoff_multiplier 不能小于 1.0"));
        }
        ValidationUtils::validate_ratio(self.jitter_factor, "retry.jitter_factor")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecurringConfig {
    pub enabled: bool,
    pub poll_interval_ms: u64,
}

impl Default for RecurringConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            poll_interval_ms: 1_000,
        }
    }
}

impl RecurringConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

impl ConfigValidator for RecurringConfig {
    fn validate(&self) -> JobResult<()> {
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExpirationConfig {
    /// 未离开 Created 状态的任务保留时长
    pub created_job_seconds: u64,
    pub succeeded_job_seconds: u64,
    pub deleted_job_seconds: u64,
    pub cleanup_interval_seconds: u64,
}

impl Default for ExpirationConfig {
    fn default() -> Self {
        Self {
            created_job_seconds: 3_600,
            succeeded_job_seconds: 86_400,
            deleted_job_seconds: 86_400,
            cleanup_interval_seconds: 1_800,
        }
    }
}

impl ExpirationConfig {
    pub fn created_ttl(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.created_job_seconds as i64)
    }

    pub fn succeeded_ttl(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.succeeded_job_seconds as i64)
    }

    pub fn deleted_ttl(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.deleted_job_seconds as i64)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_seconds)
    }
}

impl ConfigValidator for ExpirationConfig {
    fn validate(&self) -> JobResult<()> {
        ValidationUtils::validate_positive(
            self.created_job_seconds,
            "expiration.created_job_seconds",
        )?;
        ValidationUtils::validate_positive(
            self.cleanup_interval_seconds,
            "expiration.cleanup_interval_seconds",
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ContinuationConfig {
    pub reconcile_interval_seconds: u64,
    pub page_size: usize,
}

impl Default for ContinuationConfig {
    fn default() -> Self {
        Self {
            reconcile_interval_seconds: 60,
            page_size: 100,
        }
    }
}

impl ContinuationConfig {
    pub fn reconcile_interval(&self) -> Duration {
        Duration::from_secs(self.reconcile_interval_seconds)
    }
}

impl ConfigValidator for ContinuationConfig {
    fn validate(&self) -> JobResult<()> {
        ValidationUtils::validate_positive(
            self.reconcile_interval_seconds,
            "continuation.reconcile_interval_seconds",
        )?;
        ValidationUtils::validate_count(self.page_size, "continuation.page_size", 10_000)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
        }
    }
}

impl ConfigValidator for LoggingConfig {
    fn validate(&self) -> JobResult<()> {
        ValidationUtils::validate_not_empty(&self.level, "logging.level")?;
        ValidationUtils::validate_one_of(&self.format, "logging.format", &["json", "pretty"])
    }
}

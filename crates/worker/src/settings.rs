use std::time::Duration;

use jobrunner_core::{ExpirationConfig, RetryBackoff, RetryConfig, WorkerConfig};

/// Worker运行参数，由配置各节合并而来
#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub worker_count: usize,
    pub queues: Vec<String>,
    pub poll_interval: Duration,
    pub lease_timeout: Duration,
    pub heartbeat_interval: Duration,
    pub execution_timeout: Duration,
    pub shutdown_timeout: Duration,
    pub succeeded_ttl: chrono::Duration,
    pub deleted_ttl: chrono::Duration,
    pub backoff: RetryBackoff,
}

impl WorkerSettings {
    pub fn from_config(
        worker: &WorkerConfig,
        retry: &RetryConfig,
        expiration: &ExpirationConfig,
    ) -> Self {
        Self {
            worker_count: worker.worker_count.max(1),
            queues: worker.queues.clone(),
            poll_interval: worker.poll_interval(),
            lease_timeout: worker.lease_timeout(),
            heartbeat_interval: worker.heartbeat_interval(),
            execution_timeout: worker.execution_timeout(),
            shutdown_timeout: worker.shutdown_timeout(),
            succeeded_ttl: expiration.succeeded_ttl(),
            deleted_ttl: expiration.deleted_ttl(),
            backoff: RetryBackoff::from_config(retry),
        }
    }

    pub fn lease_duration(&self) -> chrono::Duration {
        chrono::Duration::from_std(self.lease_timeout)
            .unwrap_or_else(|_| chrono::Duration::seconds(300))
    }
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self::from_config(
            &WorkerConfig::default(),
            &RetryConfig::default(),
            &ExpirationConfig::default(),
        )
    }
}

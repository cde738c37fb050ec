use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use jobrunner_core::{ExpirationConfig, RecurringConfig, RetryBackoff, RetryConfig};
use jobrunner_domain::{
    JobId, JobRecord, JobState, JobStateChanger, RecurringJobDefinition, SharedClock,
    SharedStorage, StateTransition,
};
use jobrunner_errors::{JobError, JobResult};
use tokio::sync::broadcast;
use tracing::{debug, error, info};

use crate::cron_utils::CronSchedule;
use crate::polling::run_polling;

/// 周期任务注册表
///
/// 每个周期触发 next_fire_at 已到的定义。错过的多次触发合并为一次，
/// 下次触发时间总是从当前时间开始计算。
pub struct RecurringJobRegistry {
    storage: SharedStorage,
    clock: SharedClock,
    poll_interval: Duration,
    default_max_retries: u32,
    created_ttl: chrono::Duration,
    backoff: RetryBackoff,
}

impl RecurringJobRegistry {
    pub fn new(
        storage: SharedStorage,
        clock: SharedClock,
        config: &RecurringConfig,
        retry: &RetryConfig,
        expiration: &ExpirationConfig,
    ) -> Self {
        Self {
            storage,
            clock,
            poll_interval: config.poll_interval(),
            default_max_retries: retry.default_max_retries,
            created_ttl: expiration.created_ttl(),
            backoff: RetryBackoff::for_store_errors(),
        }
    }

    /// 计算定义在 `now` 之后的首次触发时间
    pub fn first_fire_after(cron: &str, now: DateTime<Utc>) -> JobResult<DateTime<Utc>> {
        CronSchedule::parse(cron)?
            .next_after(now)
            .ok_or_else(|| JobError::InvalidCron {
                expr: cron.to_string(),
                message: "表达式没有后续触发时间".to_string(),
            })
    }

    /// 执行一个触发周期，返回本次触发的定义数
    pub async fn tick(&self) -> JobResult<usize> {
        let now = self.clock.now();
        let due = self.storage.list_due_recurring(now).await?;
        let mut fired = 0;

        for definition in due {
            match self.fire(&definition, now).await {
                Ok(true) => fired += 1,
                Ok(false) => {}
                Err(e @ JobError::InvalidCron { .. }) => {
                    error!("周期任务 {} 的CRON表达式无效，跳过: {}", definition.id, e);
                }
                Err(e) => return Err(e),
            }
        }
        Ok(fired)
    }

    async fn fire(&self, definition: &RecurringJobDefinition, now: DateTime<Utc>) -> JobResult<bool> {
        let next_fire = Self::first_fire_after(&definition.cron, now)?;
        let job = JobRecord::new(definition.payload.clone(), now)
            .with_queue(definition.queue.clone())
            .with_max_retries(self.default_max_retries);

        let fired = self
            .storage
            .fire_recurring(&definition.id, definition.next_fire_at, &job, now, next_fire)
            .await?;

        if fired {
            info!(
                "周期任务 {} 已触发，创建任务 {}，下次触发时间: {}",
                definition.id,
                job.id,
                next_fire.format("%Y-%m-%d %H:%M:%S UTC")
            );
        } else {
            debug!("周期任务 {} 已被其他实例触发", definition.id);
        }
        Ok(fired)
    }

    /// 立即触发一次，不影响既有的触发计划
    pub async fn trigger(&self, id: &str) -> JobResult<JobId> {
        let definition = self
            .storage
            .get_recurring(id)
            .await?
            .ok_or_else(|| JobError::recurring_not_found(id))?;

        let now = self.clock.now();
        let job = JobRecord::new(definition.payload.clone(), now)
            .with_queue(definition.queue.clone())
            .with_max_retries(self.default_max_retries)
            .with_expiration(Some(now + self.created_ttl));
        let job_id = self.storage.create_job(&job).await?;

        let enqueue = StateTransition::to(JobState::Enqueued, now)
            .with_reason(format!("手动触发周期任务 {id}"));
        JobStateChanger::new(self.storage.as_ref())
            .transition(&job_id, JobState::Created, enqueue)
            .await?;

        info!("手动触发周期任务 {}，创建任务 {}", id, job_id);
        Ok(job_id)
    }

    pub async fn run(self: Arc<Self>, shutdown_rx: broadcast::Receiver<()>) -> JobResult<()> {
        let registry = Arc::clone(&self);
        run_polling(
            "周期任务注册表",
            self.poll_interval,
            &self.backoff,
            shutdown_rx,
            move || {
                let registry = Arc::clone(&registry);
                async move { registry.tick().await }
            },
        )
        .await
    }
}

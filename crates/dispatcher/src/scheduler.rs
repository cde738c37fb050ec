use std::sync::Arc;
use std::time::Duration;

use futures::TryStreamExt;
use jobrunner_core::{RetryBackoff, SchedulerConfig};
use jobrunner_domain::{
    due_scheduled_stream, JobState, JobStateChanger, SharedClock, SharedStorage,
    StateTransition,
};
use jobrunner_errors::JobResult;
use tokio::sync::broadcast;
use tracing::{debug, info};

use crate::polling::run_polling;

/// 延迟任务调度器
///
/// 周期性扫描到期的 Scheduled 任务并移入队列。多个实例可以同时运行，
/// 条件更新保证每个任务只被移动一次，竞争失败的一方直接跳过。
pub struct JobScheduler {
    storage: SharedStorage,
    clock: SharedClock,
    poll_interval: Duration,
    page_size: usize,
    backoff: RetryBackoff,
}

impl JobScheduler {
    pub fn new(storage: SharedStorage, clock: SharedClock, config: &SchedulerConfig) -> Self {
        Self {
            storage,
            clock,
            poll_interval: config.poll_interval(),
            page_size: config.page_size.max(1),
            backoff: RetryBackoff::for_store_errors(),
        }
    }

    /// 执行一个调度周期，返回移入队列的任务数
    pub async fn run_once(&self) -> JobResult<usize> {
        let now = self.clock.now();
        let changer = JobStateChanger::new(self.storage.as_ref());
        let mut due = Box::pin(due_scheduled_stream(
            self.storage.as_ref(),
            now,
            self.page_size,
        ));

        let mut enqueued = 0;
        while let Some(job) = due.try_next().await? {
            let transition =
                StateTransition::to(JobState::Enqueued, now).with_reason("到达计划执行时间");
            if changer
                .try_transition(&job.id, JobState::Scheduled, transition)
                .await?
            {
                debug!("延迟任务已入队: {}", job.entity_description());
                enqueued += 1;
            } else {
                debug!("任务 {} 已被其他调度器处理，跳过", job.id);
            }
        }

        if enqueued > 0 {
            info!("本次调度将 {} 个延迟任务移入队列", enqueued);
        }
        Ok(enqueued)
    }

    pub async fn run(self: Arc<Self>, shutdown_rx: broadcast::Receiver<()>) -> JobResult<()> {
        let scheduler = Arc::clone(&self);
        run_polling(
            "延迟任务调度器",
            self.poll_interval,
            &self.backoff,
            shutdown_rx,
            move || {
                let scheduler = Arc::clone(&scheduler);
                async move { scheduler.run_once().await }
            },
        )
        .await
    }
}

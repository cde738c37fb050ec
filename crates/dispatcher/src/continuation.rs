use std::sync::Arc;
use std::time::Duration;

use jobrunner_core::{ContinuationConfig, RetryBackoff};
use jobrunner_domain::{
    JobId, JobRecord, JobState, JobStateChanger, SharedClock, SharedStorage, StateTransition,
};
use jobrunner_errors::JobResult;
use tokio::sync::broadcast;
use tracing::{debug, info};

use crate::polling::run_polling;

/// 延续任务管理器
///
/// 父任务进入终态后检查其子任务，所有父任务都满足子任务的触发策略时
/// 把子任务从 AwaitingContinuation 移入队列。
#[derive(Clone)]
pub struct ContinuationManager {
    storage: SharedStorage,
    clock: SharedClock,
    page_size: usize,
    reconcile_interval: Duration,
}

impl ContinuationManager {
    pub fn new(storage: SharedStorage, clock: SharedClock, config: &ContinuationConfig) -> Self {
        Self {
            storage,
            clock,
            page_size: config.page_size.max(1),
            reconcile_interval: config.reconcile_interval(),
        }
    }

    /// 父任务完成后调用，返回被激活的子任务数
    pub async fn on_parent_finished(&self, parent_id: &JobId) -> JobResult<usize> {
        let children = self.storage.find_children(parent_id).await?;
        let mut activated = 0;
        for child in children
            .iter()
            .filter(|child| child.state == JobState::AwaitingContinuation)
        {
            if self.try_activate(child).await? {
                activated += 1;
            }
        }
        if activated > 0 {
            debug!("父任务 {} 完成，激活了 {} 个延续任务", parent_id, activated);
        }
        Ok(activated)
    }

    /// 检查一个等待中的子任务，条件满足则移入队列
    pub async fn try_activate(&self, child: &JobRecord) -> JobResult<bool> {
        if child.state != JobState::AwaitingContinuation {
            return Ok(false);
        }
        if !self.parents_satisfied(child).await? {
            return Ok(false);
        }

        let transition = StateTransition::to(JobState::Enqueued, self.clock.now())
            .with_reason("所有父任务已完成");
        let activated = JobStateChanger::new(self.storage.as_ref())
            .try_transition(&child.id, JobState::AwaitingContinuation, transition)
            .await?;
        if activated {
            debug!("延续任务已入队: {}", child.entity_description());
        }
        Ok(activated)
    }

    async fn parents_satisfied(&self, child: &JobRecord) -> JobResult<bool> {
        for parent_id in &child.parents {
            // 已被清理的父任务视为不满足
            let satisfied = self
                .storage
                .get_job(parent_id)
                .await?
                .is_some_and(|parent| child.continuation_policy.is_satisfied_by(parent.state));
            if !satisfied {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// 扫描所有等待中的子任务，修复父任务提交与子任务激活之间崩溃留下的遗漏
    pub async fn reconcile(&self) -> JobResult<usize> {
        let mut cursor = None;
        let mut activated = 0;
        loop {
            let page = self
                .storage
                .list_awaiting_continuations(cursor, self.page_size)
                .await?;
            for child in &page {
                if self.try_activate(child).await? {
                    activated += 1;
                }
            }
            if page.len() < self.page_size {
                break;
            }
            cursor = page.last().map(|job| job.id);
        }
        if activated > 0 {
            info!("巡检激活了 {} 个延续任务", activated);
        }
        Ok(activated)
    }

    pub async fn run(self: Arc<Self>, shutdown_rx: broadcast::Receiver<()>) -> JobResult<()> {
        let manager = Arc::clone(&self);
        run_polling(
            "延续任务巡检",
            self.reconcile_interval,
            &RetryBackoff::for_store_errors(),
            shutdown_rx,
            move || {
                let manager = Arc::clone(&manager);
                async move { manager.reconcile().await }
            },
        )
        .await
    }
}

use std::sync::Arc;

use jobrunner_core::HandlerRegistry;
use jobrunner_dispatcher::{shutdown_requested, ContinuationManager};
use jobrunner_domain::{SharedClock, SharedStorage};
use jobrunner_errors::{JobError, JobResult};
use tokio::sync::broadcast;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use super::{ExecutionOutcome, JobExecutor};
use crate::settings::WorkerSettings;

/// Worker池
///
/// 固定数量的执行槽位，每个槽位按队列优先级依次取任务执行。
/// 关闭时不再取新任务，等待执行中的任务完成，超过 `shutdown_timeout` 后放弃，
/// 未完成的任务在租约过期后由其他 Worker 回收。
pub struct WorkerPool {
    storage: SharedStorage,
    clock: SharedClock,
    executor: JobExecutor,
    settings: WorkerSettings,
    server_id: String,
}

impl WorkerPool {
    pub fn new(
        storage: SharedStorage,
        clock: SharedClock,
        handlers: HandlerRegistry,
        continuations: Arc<ContinuationManager>,
        settings: WorkerSettings,
    ) -> Self {
        let executor = JobExecutor::new(
            Arc::clone(&storage),
            Arc::clone(&clock),
            handlers,
            continuations,
            settings.clone(),
        );
        Self {
            storage,
            clock,
            executor,
            settings,
            server_id: generate_server_id(),
        }
    }

    pub fn server_id(&self) -> &str {
        &self.server_id
    }

    /// 槽位的租约持有者标识: `{hostname}:{pid}:{uuid}:{slot}`
    pub fn owner_id(&self, slot: usize) -> String {
        format!("{}:{}", self.server_id, slot)
    }

    /// 按队列优先级取出并执行一个任务，队列全部为空时返回 None
    pub async fn process_next(&self, owner: &str) -> JobResult<Option<ExecutionOutcome>> {
        for queue in &self.settings.queues {
            let now = self.clock.now();
            let lease_until = now + self.settings.lease_duration();
            if let Some(leased) = self
                .storage
                .fetch_next_eligible(queue, owner, now, lease_until)
                .await?
            {
                debug!("{} 从队列 {} 取到任务 {}", owner, queue, leased.job.id);
                return self.executor.execute(leased).await.map(Some);
            }
        }
        Ok(None)
    }

    async fn run_slot(
        self: Arc<Self>,
        slot: usize,
        mut stop_rx: broadcast::Receiver<()>,
    ) -> JobResult<()> {
        let owner = self.owner_id(slot);
        debug!("执行槽位 {} 启动", owner);
        let mut consecutive_failures: u32 = 0;

        loop {
            if shutdown_requested(&mut stop_rx) {
                break;
            }

            let wait = match self.process_next(&owner).await {
                Ok(Some(_)) => {
                    consecutive_failures = 0;
                    continue;
                }
                Ok(None) => {
                    consecutive_failures = 0;
                    self.settings.poll_interval
                }
                Err(e) if e.is_fatal() => {
                    error!("执行槽位 {} 遇到致命错误: {}", owner, e);
                    return Err(e);
                }
                Err(e) if e.is_retryable() => {
                    let delay = self.settings.backoff.delay(consecutive_failures);
                    consecutive_failures = consecutive_failures.saturating_add(1);
                    warn!("执行槽位 {} 存储暂时不可用，{:?} 后重试: {}", owner, delay, e);
                    delay
                }
                Err(e) => {
                    warn!("执行槽位 {} 处理任务失败: {}", owner, e);
                    self.settings.poll_interval
                }
            };

            if wait.is_zero() {
                tokio::task::yield_now().await;
                continue;
            }
            tokio::select! {
                _ = stop_rx.recv() => break,
                _ = tokio::time::sleep(wait) => {}
            }
        }

        debug!("执行槽位 {} 已停止", owner);
        Ok(())
    }

    /// 运行到收到关闭信号或某个槽位遇到致命错误
    pub async fn run(self: Arc<Self>, mut shutdown_rx: broadcast::Receiver<()>) -> JobResult<()> {
        info!(
            "Worker池 {} 启动，槽位数: {}，队列: {:?}",
            self.server_id, self.settings.worker_count, self.settings.queues
        );

        let (stop_tx, _) = broadcast::channel::<()>(1);
        let mut slots = JoinSet::new();
        for slot in 0..self.settings.worker_count {
            let pool = Arc::clone(&self);
            slots.spawn(pool.run_slot(slot, stop_tx.subscribe()));
        }

        let mut failure: Option<JobError> = None;
        tokio::select! {
            _ = shutdown_rx.recv() => {
                info!("Worker池收到关闭信号，等待执行中的任务完成");
            }
            Some(joined) = slots.join_next() => {
                failure = slot_error(joined);
            }
        }
        let _ = stop_tx.send(());

        let drained = tokio::time::timeout(self.settings.shutdown_timeout, async {
            let mut first_error = None;
            while let Some(joined) = slots.join_next().await {
                if let Some(e) = slot_error(joined) {
                    first_error.get_or_insert(e);
                }
            }
            first_error
        })
        .await;

        match drained {
            Ok(error) => {
                if failure.is_none() {
                    failure = error;
                }
            }
            Err(_) => {
                warn!(
                    "等待执行中的任务超过 {:?}，强制停止剩余槽位",
                    self.settings.shutdown_timeout
                );
                slots.abort_all();
                while slots.join_next().await.is_some() {}
            }
        }

        info!("Worker池 {} 已停止", self.server_id);
        match failure {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

fn slot_error(joined: Result<JobResult<()>, tokio::task::JoinError>) -> Option<JobError> {
    match joined {
        Ok(Ok(())) => None,
        Ok(Err(e)) => Some(e),
        Err(e) if e.is_cancelled() => None,
        Err(e) => Some(JobError::Internal(format!("执行槽位异常退出: {e}"))),
    }
}

fn generate_server_id() -> String {
    let host = hostname::get()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|_| "unknown-host".to_string());
    format!(
        "{}:{}:{}",
        host,
        std::process::id(),
        uuid::Uuid::new_v4().simple()
    )
}

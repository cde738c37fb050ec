use std::sync::Arc;
use std::time::{Duration, Instant};

use jobrunner_core::ExpirationConfig;
use jobrunner_domain::{JobStorage, SharedClock, SharedStorage};
use jobrunner_errors::JobResult;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Default)]
pub struct CleanupStats {
    pub removed: u64,
    pub duration: Duration,
}

/// 过期记录清理服务
///
/// 周期性删除 expire_at 已到的 Created 与终态任务，防止存储无限增长。
pub struct CleanupService {
    repository: SharedStorage,
    clock: SharedClock,
    interval: Duration,
    shutdown_tx: Option<tokio::sync::oneshot::Sender<()>>,
    cleanup_handle: Option<tokio::task::JoinHandle<()>>,
}

impl CleanupService {
    pub fn new(
        repository: SharedStorage,
        clock: SharedClock,
        config: &ExpirationConfig,
    ) -> Self {
        Self {
            repository,
            clock,
            interval: config.cleanup_interval(),
            shutdown_tx: None,
            cleanup_handle: None,
        }
    }

    pub fn start(&mut self) {
        if self.cleanup_handle.is_some() {
            warn!("清理服务已经在运行");
            return;
        }
        info!("启动过期任务清理服务，间隔: {:?}", self.interval);

        let (shutdown_tx, mut shutdown_rx) = tokio::sync::oneshot::channel();
        self.shutdown_tx = Some(shutdown_tx);

        let repository = Arc::clone(&self.repository);
        let clock = Arc::clone(&self.clock);
        let period = self.interval;

        let handle = tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        match Self::perform_cleanup(repository.as_ref(), &clock).await {
                            Ok(stats) if stats.removed > 0 => {
                                info!("清理过期任务 {} 个，耗时 {:?}", stats.removed, stats.duration);
                            }
                            Ok(_) => debug!("没有需要清理的过期任务"),
                            Err(e) if e.is_fatal() => {
                                error!("清理服务遇到致命错误，停止运行: {}", e);
                                break;
                            }
                            Err(e) => warn!("清理过期任务失败，下个周期重试: {}", e),
                        }
                    }
                    _ = &mut shutdown_rx => {
                        info!("清理服务收到关闭信号");
                        break;
                    }
                }
            }

            info!("清理服务已停止");
        });

        self.cleanup_handle = Some(handle);
    }

    pub async fn stop(&mut self) {
        if let Some(shutdown_tx) = self.shutdown_tx.take() {
            let _ = shutdown_tx.send(());
        }
        if let Some(handle) = self.cleanup_handle.take() {
            if let Err(e) = handle.await {
                warn!("等待清理服务停止时出错: {}", e);
            }
        }
    }

    pub async fn cleanup_once(&self) -> JobResult<CleanupStats> {
        Self::perform_cleanup(self.repository.as_ref(), &self.clock).await
    }

    async fn perform_cleanup(
        repository: &dyn JobStorage,
        clock: &SharedClock,
    ) -> JobResult<CleanupStats> {
        let started = Instant::now();
        let removed = repository.sweep_expired(clock.now()).await?;
        Ok(CleanupStats {
            removed,
            duration: started.elapsed(),
        })
    }
}

impl Drop for CleanupService {
    fn drop(&mut self) {
        if let Some(shutdown_tx) = self.shutdown_tx.take() {
            let _ = shutdown_tx.send(());
        }
    }
}

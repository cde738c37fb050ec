use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use jobrunner_core::{AppConfig, HandlerRegistry};
use jobrunner_dispatcher::{ContinuationManager, JobScheduler, RecurringJobRegistry};
use jobrunner_domain::{SharedClock, SharedStorage};
use jobrunner_errors::{JobError, JobResult};
use jobrunner_infrastructure::CleanupService;
use jobrunner_worker::{WorkerPool, WorkerSettings};
use tokio::sync::broadcast;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use crate::client::JobClient;
use crate::recurring_manager::RecurringJobManager;

/// 进程运行模式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ServerMode {
    /// 调度与执行组件全部运行
    #[default]
    Server,
    /// 延迟任务、周期任务、延续巡检与过期清理
    Scheduler,
    /// 只运行Worker池
    Worker,
}

impl ServerMode {
    pub fn runs_dispatch(&self) -> bool {
        matches!(self, ServerMode::Server | ServerMode::Scheduler)
    }

    pub fn runs_workers(&self) -> bool {
        matches!(self, ServerMode::Server | ServerMode::Worker)
    }
}

impl FromStr for ServerMode {
    type Err = JobError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "server" => Ok(ServerMode::Server),
            "scheduler" => Ok(ServerMode::Scheduler),
            "worker" => Ok(ServerMode::Worker),
            _ => Err(JobError::config_error(format!("未知的运行模式: {s}"))),
        }
    }
}

impl fmt::Display for ServerMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ServerMode::Server => "server",
            ServerMode::Scheduler => "scheduler",
            ServerMode::Worker => "worker",
        };
        write!(f, "{name}")
    }
}

/// 任务服务器
///
/// 按运行模式和配置中的开关组装各组件，所有组件共享同一个存储与时钟。
/// 任一组件遇到致命错误时通知其余组件停止，并把该错误返回给调用方。
pub struct JobServer {
    config: AppConfig,
    storage: SharedStorage,
    clock: SharedClock,
    handlers: HandlerRegistry,
    continuations: Arc<ContinuationManager>,
    recurring: Arc<RecurringJobRegistry>,
}

impl JobServer {
    pub fn new(
        config: AppConfig,
        storage: SharedStorage,
        clock: SharedClock,
        handlers: HandlerRegistry,
    ) -> Self {
        let continuations = Arc::new(ContinuationManager::new(
            Arc::clone(&storage),
            Arc::clone(&clock),
            &config.continuation,
        ));
        let recurring = Arc::new(RecurringJobRegistry::new(
            Arc::clone(&storage),
            Arc::clone(&clock),
            &config.recurring,
            &config.retry,
            &config.expiration,
        ));
        Self {
            config,
            storage,
            clock,
            handlers,
            continuations,
            recurring,
        }
    }

    pub fn client(&self) -> JobClient {
        JobClient::new(
            Arc::clone(&self.storage),
            Arc::clone(&self.clock),
            Arc::clone(&self.continuations),
            &self.config.retry,
            &self.config.expiration,
        )
    }

    pub fn recurring_jobs(&self) -> RecurringJobManager {
        RecurringJobManager::new(
            Arc::clone(&self.storage),
            Arc::clone(&self.clock),
            Arc::clone(&self.recurring),
        )
    }

    pub fn handlers(&self) -> &HandlerRegistry {
        &self.handlers
    }

    /// 运行到收到关闭信号或某个组件遇到致命错误
    pub async fn run(
        &self,
        mode: ServerMode,
        mut shutdown_rx: broadcast::Receiver<()>,
    ) -> JobResult<()> {
        let (stop_tx, _) = broadcast::channel::<()>(1);
        let mut components: JoinSet<(&'static str, JobResult<()>)> = JoinSet::new();
        let mut cleanup = None;

        if mode.runs_dispatch() {
            if self.config.scheduler.enabled {
                let scheduler = Arc::new(JobScheduler::new(
                    Arc::clone(&self.storage),
                    Arc::clone(&self.clock),
                    &self.config.scheduler,
                ));
                let rx = stop_tx.subscribe();
                components.spawn(async move { ("延迟任务调度器", scheduler.run(rx).await) });
            }
            if self.config.recurring.enabled {
                let recurring = Arc::clone(&self.recurring);
                let rx = stop_tx.subscribe();
                components.spawn(async move { ("周期任务注册表", recurring.run(rx).await) });
            }
            let continuations = Arc::clone(&self.continuations);
            let rx = stop_tx.subscribe();
            components.spawn(async move { ("延续任务巡检", continuations.run(rx).await) });

            let mut service = CleanupService::new(
                Arc::clone(&self.storage),
                Arc::clone(&self.clock),
                &self.config.expiration,
            );
            service.start();
            cleanup = Some(service);
        }

        if mode.runs_workers() && self.config.worker.enabled {
            let pool = Arc::new(WorkerPool::new(
                Arc::clone(&self.storage),
                Arc::clone(&self.clock),
                self.handlers.clone(),
                Arc::clone(&self.continuations),
                WorkerSettings::from_config(
                    &self.config.worker,
                    &self.config.retry,
                    &self.config.expiration,
                ),
            ));
            let rx = stop_tx.subscribe();
            components.spawn(async move { ("Worker池", pool.run(rx).await) });
        }

        if components.is_empty() && cleanup.is_none() {
            return Err(JobError::config_error(format!(
                "运行模式 {mode} 下没有启用任何组件"
            )));
        }
        info!("任务服务器已启动，运行模式: {}", mode);

        let mut failure: Option<JobError> = None;
        tokio::select! {
            _ = shutdown_rx.recv() => {
                info!("任务服务器收到关闭信号");
            }
            Some(joined) = components.join_next(), if !components.is_empty() => {
                failure = component_error(joined);
            }
        }
        let _ = stop_tx.send(());

        while let Some(joined) = components.join_next().await {
            if let Some(e) = component_error(joined) {
                failure.get_or_insert(e);
            }
        }
        if let Some(mut service) = cleanup {
            service.stop().await;
        }

        info!("任务服务器已停止");
        match failure {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

fn component_error(
    joined: Result<(&'static str, JobResult<()>), tokio::task::JoinError>,
) -> Option<JobError> {
    match joined {
        Ok((_, Ok(()))) => None,
        Ok((name, Err(e))) => {
            error!("{} 异常退出: {}", name, e);
            Some(e)
        }
        Err(e) => {
            warn!("组件任务异常结束: {}", e);
            Some(JobError::Internal(format!("组件任务异常结束: {e}")))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mode_parsing() {
        assert_eq!("server".parse::<ServerMode>().unwrap(), ServerMode::Server);
        assert_eq!("worker".parse::<ServerMode>().unwrap(), ServerMode::Worker);
        assert_eq!(
            "scheduler".parse::<ServerMode>().unwrap(),
            ServerMode::Scheduler
        );
        assert!("dashboard".parse::<ServerMode>().is_err());
        assert_eq!(ServerMode::Scheduler.to_string(), "scheduler");
    }

    #[test]
    fn test_mode_components() {
        assert!(ServerMode::Server.runs_dispatch() && ServerMode::Server.runs_workers());
        assert!(ServerMode::Scheduler.runs_dispatch() && !ServerMode::Scheduler.runs_workers());
        assert!(!ServerMode::Worker.runs_dispatch() && ServerMode::Worker.runs_workers());
    }
}

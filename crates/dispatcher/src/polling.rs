use std::future::Future;
use std::time::Duration;

use jobrunner_core::RetryBackoff;
use jobrunner_errors::JobResult;
use tokio::sync::broadcast::{self, error::TryRecvError};
use tracing::{debug, error, info, warn};

/// 非阻塞地检查是否收到关闭信号，发送端关闭也视为关闭
pub fn shutdown_requested(shutdown_rx: &mut broadcast::Receiver<()>) -> bool {
    !matches!(shutdown_rx.try_recv(), Err(TryRecvError::Empty))
}

/// 通用轮询循环
///
/// 每个周期执行一次 `cycle`，返回值为本周期处理的数量。
/// 间隔为零时连续轮询，只在周期之间让出执行权；
/// 瞬时存储错误按 `backoff` 退避重试，致命错误结束循环并返回。
pub async fn run_polling<F, Fut>(
    component: &str,
    poll_interval: Duration,
    backoff: &RetryBackoff,
    mut shutdown_rx: broadcast::Receiver<()>,
    mut cycle: F,
) -> JobResult<()>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = JobResult<usize>>,
{
    info!("{} 开始运行，轮询间隔: {:?}", component, poll_interval);
    let mut consecutive_failures: u32 = 0;

    loop {
        if shutdown_requested(&mut shutdown_rx) {
            break;
        }

        let wait = match cycle().await {
            Ok(processed) => {
                consecutive_failures = 0;
                if processed > 0 {
                    debug!("{} 本周期处理了 {} 个任务", component, processed);
                }
                poll_interval
            }
            Err(e) if e.is_fatal() => {
                error!("{} 遇到致命错误，停止运行: {}", component, e);
                return Err(e);
            }
            Err(e) if e.is_retryable() => {
                let delay = backoff.delay(consecutive_failures);
                consecutive_failures = consecutive_failures.saturating_add(1);
                warn!(
                    "{} 存储暂时不可用，{:?} 后重试 (连续失败 {} 次): {}",
                    component, delay, consecutive_failures, e
                );
                delay
            }
            Err(e) => {
                warn!("{} 本周期执行失败: {}", component, e);
                poll_interval
            }
        };

        if wait.is_zero() {
            tokio::task::yield_now().await;
            continue;
        }

        tokio::select! {
            _ = shutdown_rx.recv() => break,
            _ = tokio::time::sleep(wait) => {}
        }
    }

    info!("{} 收到关闭信号，已停止", component);
    Ok(())
}

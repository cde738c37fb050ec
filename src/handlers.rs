//! 命令行宿主内置的示例处理器

use std::time::Duration;

use jobrunner_core::{handler_fn, HandlerRegistry, JobContext};
use jobrunner_errors::{JobError, JobResult};
use tracing::info;

pub async fn register_builtin_handlers(registry: &HandlerRegistry) {
    registry
        .register(handler_fn("echo", |ctx: JobContext| async move {
            info!(job_id = %ctx.job_id, attempt = ctx.attempt, "echo: {}", ctx.arguments);
            Ok(())
        }))
        .await;
    registry.register(handler_fn("sleep", sleep)).await;
    registry
        .register(handler_fn("fail", |ctx: JobContext| async move {
            let message = ctx.arguments["message"]
                .as_str()
                .unwrap_or("示例失败")
                .to_string();
            Err(JobError::handler(message))
        }))
        .await;
}

/// 参数 `{"millis": N}`，收到取消请求时提前退出
async fn sleep(ctx: JobContext) -> JobResult<()> {
    let millis = ctx.arguments["millis"].as_u64().unwrap_or(1_000);
    tokio::select! {
        _ = tokio::time::sleep(Duration::from_millis(millis)) => {
            info!(job_id = %ctx.job_id, "sleep 完成: {}ms", millis);
            Ok(())
        }
        _ = ctx.cancelled() => Err(JobError::abort("收到取消请求")),
    }
}

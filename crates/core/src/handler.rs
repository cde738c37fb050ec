//! 任务处理器接口
//!
//! 任务负载只保存处理器名称和不透明的参数，执行时通过 [`HandlerRegistry`]
//! 按名称解析出实际的处理器。
//!
//! ```rust,ignore
//! use jobrunner_core::{handler_fn, HandlerRegistry};
//!
//! let registry = HandlerRegistry::new();
//! registry
//!     .register(handler_fn("send-email", |ctx| async move {
//!         let to = ctx.arguments["to"].as_str().unwrap_or_default();
//!         tracing::info!("发送邮件到 {to}");
//!         Ok(())
//!     }))
//!     .await;
//! ```

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use jobrunner_domain::JobId;
use jobrunner_errors::JobResult;
use tokio::sync::RwLock;
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};

/// 任务执行上下文
#[derive(Debug, Clone)]
pub struct JobContext {
    pub job_id: JobId,
    pub queue: String,
    pub arguments: serde_json::Value,
    /// 第几次执行（从1开始）
    pub attempt: u32,
    cancellation: CancellationToken,
}

impl JobContext {
    pub fn new(
        job_id: JobId,
        queue: impl Into<String>,
        arguments: serde_json::Value,
        attempt: u32,
        cancellation: CancellationToken,
    ) -> Self {
        Self {
            job_id,
            queue: queue.into(),
            arguments,
            attempt,
            cancellation,
        }
    }

    /// 取消请求是建议性的，处理器应在合适的检查点自行退出
    pub fn is_cancellation_requested(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    pub fn cancelled(&self) -> WaitForCancellationFuture<'_> {
        self.cancellation.cancelled()
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancellation.clone()
    }
}

/// 任务处理器
///
/// 返回 `JobError::HandlerAbort` 会跳过剩余重试直接进入 Deleted，
/// 其他错误按可恢复失败处理。
#[async_trait]
pub trait JobHandler: Send + Sync {
    fn name(&self) -> &str;

    async fn handle(&self, ctx: JobContext) -> JobResult<()>;
}

pub struct FnHandler<F> {
    name: String,
    func: F,
}

/// 用闭包构造处理器
pub fn handler_fn<F, Fut>(name: impl Into<String>, func: F) -> FnHandler<F>
where
    F: Fn(JobContext) -> Fut + Send + Sync,
    Fut: Future<Output = JobResult<()>> + Send,
{
    FnHandler {
        name: name.into(),
        func,
    }
}

#[async_trait]
impl<F, Fut> JobHandler for FnHandler<F>
where
    F: Fn(JobContext) -> Fut + Send + Sync,
    Fut: Future<Output = JobResult<()>> + Send,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn handle(&self, ctx: JobContext) -> JobResult<()> {
        (self.func)(ctx).await
    }
}

/// 处理器注册表
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: Arc<RwLock<HashMap<String, Arc<dyn JobHandler>>>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register<H: JobHandler + 'static>(&self, handler: H) {
        self.register_arc(Arc::new(handler)).await;
    }

    pub async fn register_arc(&self, handler: Arc<dyn JobHandler>) {
        let mut registry = self.handlers.write().await;
        registry.insert(handler.name().to_string(), handler);
    }

    pub async fn register_batch(&self, handlers: Vec<Arc<dyn JobHandler>>) {
        let mut registry = self.handlers.write().await;
        for handler in handlers {
            registry.insert(handler.name().to_string(), handler);
        }
    }

    pub async fn get(&self, name: &str) -> Option<Arc<dyn JobHandler>> {
        let registry = self.handlers.read().await;
        registry.get(name).cloned()
    }

    pub async fn contains(&self, name: &str) -> bool {
        self.handlers.read().await.contains_key(name)
    }

    pub async fn unregister(&self, name: &str) -> bool {
        let mut registry = self.handlers.write().await;
        registry.remove(name).is_some()
    }

    pub async fn names(&self) -> Vec<String> {
        let registry = self.handlers.read().await;
        let mut names: Vec<String> = registry.keys().cloned().collect();
        names.sort();
        names
    }
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistry").finish_non_exhaustive()
    }
}

use anyhow::{Context, Result};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::LoggingConfig;

/// 初始化日志系统，`RUST_LOG` 优先于传入的级别
pub fn init_logging(log_level: &str, log_format: &str) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(log_level))
        .with_context(|| format!("无效的日志级别: {log_level}"))?;
    let registry = tracing_subscriber::registry().with(env_filter);

    let installed = match log_format {
        "json" => registry
            .with(fmt::layer().json().with_current_span(true))
            .try_init(),
        "pretty" => registry.with(fmt::layer().pretty()).try_init(),
        other => anyhow::bail!("不支持的日志格式: {other}"),
    };
    installed.context("初始化日志系统失败")
}

pub fn init_from_config(config: &LoggingConfig) -> Result<()> {
    init_logging(&config.level, &config.format)
}

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Arg, ArgAction, Command};
use jobrunner_application::{JobServer, ServerMode};
use jobrunner_core::{init_logging, AppConfig, HandlerRegistry};
use jobrunner_domain::{JobPayload, SharedClock, SystemClock};
use serde_json::json;
use tokio::signal;
use tracing::{error, info, warn};

mod handlers;
mod shutdown;

use shutdown::ShutdownManager;

#[tokio::main]
async fn main() -> Result<()> {
    let matches = Command::new("jobrunner")
        .version(env!("CARGO_PKG_VERSION"))
        .about("持久化后台任务处理引擎")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("配置文件路径，未指定时依次查找 config/jobrunner.toml 与 jobrunner.toml"),
        )
        .arg(
            Arg::new("mode")
                .short('m')
                .long("mode")
                .value_name("MODE")
                .help("运行模式")
                .value_parser(["server", "scheduler", "worker"])
                .default_value("server"),
        )
        .arg(
            Arg::new("log-level")
                .short('l')
                .long("log-level")
                .value_name("LEVEL")
                .help("日志级别，覆盖配置文件")
                .value_parser(["trace", "debug", "info", "warn", "error"]),
        )
        .arg(
            Arg::new("log-format")
                .long("log-format")
                .value_name("FORMAT")
                .help("日志格式，覆盖配置文件")
                .value_parser(["json", "pretty"]),
        )
        .arg(
            Arg::new("demo")
                .long("demo")
                .help("启动后提交一组示例任务")
                .action(ArgAction::SetTrue),
        )
        .get_matches();

    let config_path = matches.get_one::<String>("config").map(String::as_str);
    let config = AppConfig::load(config_path).context("加载配置失败")?;

    let log_level = matches
        .get_one::<String>("log-level")
        .unwrap_or(&config.logging.level);
    let log_format = matches
        .get_one::<String>("log-format")
        .unwrap_or(&config.logging.format);
    init_logging(log_level, log_format)?;

    let mode: ServerMode = matches
        .get_one::<String>("mode")
        .map(String::as_str)
        .unwrap_or("server")
        .parse()?;

    info!("启动任务处理引擎，运行模式: {}", mode);
    if let Some(path) = config_path {
        info!("配置文件: {path}");
    }

    let storage = jobrunner_infrastructure::create_storage(&config.storage)
        .await
        .context("初始化存储失败")?;
    let clock: SharedClock = Arc::new(SystemClock);
    let registry = HandlerRegistry::new();
    handlers::register_builtin_handlers(&registry).await;
    info!("已注册处理器: {:?}", registry.names().await);

    let shutdown_timeout = config.worker.shutdown_timeout() + Duration::from_secs(5);
    let server = Arc::new(JobServer::new(config, storage, clock, registry));

    if matches.get_flag("demo") {
        submit_demo_jobs(&server).await?;
    }

    let shutdown_manager = ShutdownManager::new();
    let mut server_handle = {
        let server = Arc::clone(&server);
        let shutdown_rx = shutdown_manager.subscribe().await;
        tokio::spawn(async move { server.run(mode, shutdown_rx).await })
    };

    let finished = tokio::select! {
        _ = wait_for_shutdown_signal() => {
            info!("收到关闭信号，开始优雅关闭...");
            None
        }
        joined = &mut server_handle => Some(joined),
    };
    shutdown_manager.shutdown().await;

    let joined = match finished {
        Some(joined) => joined,
        None => match tokio::time::timeout(shutdown_timeout, server_handle).await {
            Ok(joined) => joined,
            Err(_) => {
                warn!("任务处理引擎关闭超时，强制退出");
                return Ok(());
            }
        },
    };

    match joined {
        Ok(Ok(())) => info!("任务处理引擎已优雅关闭"),
        Ok(Err(e)) => {
            error!("任务处理引擎异常退出: {e}");
            return Err(e).context("任务处理引擎运行失败");
        }
        Err(e) => error!("等待任务处理引擎退出时出错: {e}"),
    }
    Ok(())
}

async fn submit_demo_jobs(server: &JobServer) -> Result<()> {
    let client = server.client();
    let greeting = client
        .enqueue(JobPayload::new("echo", json!({"message": "hello"})))
        .await?;
    client
        .schedule(
            JobPayload::new("echo", json!({"message": "10 秒后执行"})),
            chrono::Duration::seconds(10),
        )
        .await?;
    client
        .continue_with(
            greeting,
            JobPayload::new("echo", json!({"message": "在 hello 之后执行"})),
        )
        .await?;
    server
        .recurring_jobs()
        .add_or_update(
            "demo-minutely",
            JobPayload::new("echo", json!({"message": "每分钟执行"})),
            &jobrunner_dispatcher::Cron::minutely(),
        )
        .await?;
    info!("示例任务已提交");
    Ok(())
}

async fn wait_for_shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("安装Ctrl+C信号处理器失败: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("安装SIGTERM信号处理器失败: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("收到Ctrl+C信号"),
        _ = terminate => info!("收到SIGTERM信号"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bundled_config_is_valid() {
        let config = AppConfig::from_toml(include_str!("../config/jobrunner.toml")).unwrap();
        assert_eq!(config.worker.queues, vec!["critical", "default"]);
        assert_eq!(config.worker.poll_interval_ms, 0);
        assert_eq!(config.storage.database_url, "sqlite://jobrunner.db");
    }
}

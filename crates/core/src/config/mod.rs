mod models;
mod validation;

use std::path::Path;

use anyhow::{Context, Result};
use config::{Config as ConfigBuilder, Environment, File, FileFormat};
use jobrunner_errors::JobResult;
use serde::{Deserialize, Serialize};

pub use models::*;
pub use validation::{ConfigValidator, ValidationUtils};

pub const ENV_PREFIX: &str = "JOBRUNNER";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub storage: StorageConfig,
    pub scheduler: SchedulerConfig,
    pub worker: WorkerConfig,
    pub retry: RetryConfig,
    pub recurring: RecurringConfig,
    pub expiration: ExpirationConfig,
    pub continuation: ContinuationConfig,
    pub logging: LoggingConfig,
}

impl AppConfig {
    /// 加载配置：TOML文件 + `JOBRUNNER_` 前缀的环境变量覆盖。
    /// 环境变量以双下划线分隔层级，例如 `JOBRUNNER_WORKER__WORKER_COUNT=8`。
    pub fn load(config_path: Option<&str>) -> Result<Self> {
        let mut builder = ConfigBuilder::builder();

        if let Some(path) = config_path {
            if !Path::new(path).exists() {
                return Err(anyhow::anyhow!("配置文件不存在: {}", path));
            }
            builder = builder.add_source(File::new(path, FileFormat::Toml));
        } else {
            let default_paths = ["config/jobrunner.toml", "jobrunner.toml"];
            if let Some(path) = default_paths.iter().find(|p| Path::new(p).exists()) {
                builder = builder.add_source(File::new(path, FileFormat::Toml));
            }
        }

        builder = builder.add_source(
            Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("_")
                .separator("__")
                .list_separator(",")
                .with_list_parse_key("worker.queues")
                .try_parsing(true),
        );

        let config: AppConfig = builder
            .build()
            .context("构建配置失败")?
            .try_deserialize()
            .context("反序列化配置失败")?;

        config.validate().context("配置校验失败")?;

        Ok(config)
    }

    pub fn from_toml(toml_str: &str) -> Result<Self> {
        let config: AppConfig = toml::from_str(toml_str).context("解析TOML配置失败")?;
        config.validate().context("配置校验失败")?;
        Ok(config)
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("序列化配置为TOML失败")
    }
}

impl ConfigValidator for AppConfig {
    fn validate(&self) -> JobResult<()> {
        self.storage.validate()?;
        self.scheduler.validate()?;
        self.worker.validate()?;
        self.retry.validate()?;
        self.recurring.validate()?;
        self.expiration.validate()?;
        self.continuation.validate()?;
        self.logging.validate()?;
        Ok(())
    }
}

pub mod cleanup_service;
pub mod database;
pub mod memory;

use std::sync::Arc;

use jobrunner_core::{StorageBackend, StorageConfig};
use jobrunner_domain::SharedStorage;
use jobrunner_errors::JobResult;
use tracing::info;

pub use cleanup_service::{CleanupService, CleanupStats};
pub use database::SqliteJobStorage;
pub use memory::InMemoryJobStorage;

/// 按配置创建存储实现
pub async fn create_storage(config: &StorageConfig) -> JobResult<SharedStorage> {
    match config.backend {
        StorageBackend::Sqlite => {
            info!("使用SQLite存储: {}", config.database_url);
            Ok(Arc::new(SqliteJobStorage::from_config(config).await?))
        }
        StorageBackend::Memory => {
            info!("使用内存存储，进程退出后数据不会保留");
            Ok(Arc::new(InMemoryJobStorage::new()))
        }
    }
}

//! 任务执行
//!
//! Worker池从共享存储中取出任务，在租约保护下运行处理器并提交结果。

pub mod components;
pub mod settings;

pub use components::{ExecutionOutcome, HeartbeatManager, JobExecutor, WorkerPool};
pub use settings::WorkerSettings;

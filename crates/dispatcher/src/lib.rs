//! 调度组件
//!
//! 延迟任务调度、周期任务触发与延续任务激活。
//! 所有组件只通过共享存储协调，可以在多个进程中同时运行。

pub mod continuation;
pub mod cron_utils;
pub mod polling;
pub mod recurring;
pub mod scheduler;

pub use continuation::ContinuationManager;
pub use cron_utils::{Cron, CronSchedule};
pub use polling::{run_polling, shutdown_requested};
pub use recurring::RecurringJobRegistry;
pub use scheduler::JobScheduler;

//! 应用层
//!
//! 业务代码使用的任务客户端、周期任务管理，以及组装全部组件的任务服务器。

pub mod client;
pub mod recurring_manager;
pub mod server;

pub use client::{JobClient, JobOptions};
pub use recurring_manager::RecurringJobManager;
pub use server::{JobServer, ServerMode};

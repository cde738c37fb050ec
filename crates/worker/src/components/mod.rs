pub mod heartbeat_manager;
pub mod job_execution;
pub mod worker_lifecycle;

pub use heartbeat_manager::HeartbeatManager;
pub use job_execution::{ExecutionOutcome, JobExecutor};
pub use worker_lifecycle::WorkerPool;

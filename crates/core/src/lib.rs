pub mod config;
pub mod handler;
pub mod logging;
pub mod retry;

pub use config::{
    AppConfig, ConfigValidator, ContinuationConfig, ExpirationConfig, LoggingConfig,
    RecurringConfig, RetryConfig, SchedulerConfig, StorageBackend, StorageConfig, WorkerConfig,
};
pub use handler::{handler_fn, FnHandler, HandlerRegistry, JobContext, JobHandler};
pub use logging::init_logging;
pub use retry::RetryBackoff;

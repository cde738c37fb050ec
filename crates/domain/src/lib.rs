pub mod clock;
pub mod entities;
pub mod repositories;
pub mod services;
pub mod state_machine;

pub use clock::*;
pub use entities::*;
pub use jobrunner_errors::{JobError, JobResult};
pub use repositories::*;
pub use services::*;
pub use state_machine::*;

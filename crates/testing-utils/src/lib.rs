//! # Jobrunner Testing Utils
//!
//! Shared testing utilities for the job engine workspace: record builders,
//! a manually advanced clock, handler test doubles and a fault-injecting store.
//!
//! ```toml
//! [dev-dependencies]
//! jobrunner-testing-utils = { path = "../testing-utils" }
//! ```

pub mod builders;
pub mod handlers;
pub mod helpers;
pub mod storage;

pub use builders::*;
pub use handlers::*;
pub use helpers::*;
pub use storage::*;
pub use jobrunner_domain::ManualClock;

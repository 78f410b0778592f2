//! Shared runtime utilities.

pub mod limiter;
pub mod process;

pub use limiter::{ConcurrencyLimiter, LimiterToken};
pub use process::run_command;

//! Infrastructure layer: SQLite job store, workers, pool, config files.

pub mod config;
pub mod jobs;
pub mod liveness;

pub use config::QueuePaths;
pub use liveness::{PidFile, PidGuard, StopOutcome};

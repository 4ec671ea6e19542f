//! Persistent background job queue.
//!
//! ## Design
//!
//! - Jobs are shell command lines stored in SQLite
//! - Workers claim the oldest eligible job atomically
//! - Failures are retried with exponential backoff
//! - Jobs that exhaust their retries land in the dead letter queue
//!
//! ## Components
//!
//! - `JobStore`: persistence and atomic claim (SQLite or in-memory)
//! - `CommandExecutor`: runs a command line, `sh -c` by default
//! - `Worker`: claim/execute/record loop
//! - `PoolManager`: N workers, liveness marker, graceful shutdown

pub mod executor;
pub mod pool;
pub mod sqlite;
pub mod store;
pub mod worker;

pub use executor::{CommandExecutor, ExecutionResult, ExecutionStatus, ShellExecutor};
pub use pool::{PoolManager, PoolSummary};
pub use sqlite::SqliteJobStore;
pub use store::{InMemoryJobStore, JobStats, JobStore};
pub use worker::{JobOutcome, Worker, WorkerStats};

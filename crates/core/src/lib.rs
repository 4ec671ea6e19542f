//! `queuectl-core`: job model and lifecycle rules.
//!
//! This crate is **pure**: no I/O, no clock reads outside of id generation.
//! Storage, execution, and process coordination live in `queuectl-infra`.

pub mod config;
pub mod error;
pub mod id;
pub mod job;
pub mod retry;

pub use config::QueueConfig;
pub use error::{QueueError, QueueResult};
pub use id::JobId;
pub use job::{Job, JobSpec, JobState};
pub use retry::{BackoffBase, FailureOutcome, RetryPolicy};

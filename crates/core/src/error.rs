//! Queue error model.

use std::path::PathBuf;

use thiserror::Error;

use crate::id::JobId;

/// Result type used across the queue.
pub type QueueResult<T> = Result<T, QueueError>;

/// Queue-level error.
///
/// Input mistakes (validation, not-found, duplicate) go back to the caller and
/// are never retried. `Storage` is the only transient variant; workers log it
/// and try again after their idle interval.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum QueueError {
    /// Malformed job spec, unknown state name, invalid config value, or a
    /// transition requested from the wrong state.
    #[error("validation failed: {0}")]
    Validation(String),

    /// No job with this id exists.
    #[error("job not found: {0}")]
    NotFound(JobId),

    /// Enqueue refused because the id is taken.
    #[error("job already exists: {0}")]
    DuplicateId(JobId),

    /// I/O or transaction failure in the job store.
    #[error("storage error: {0}")]
    Storage(String),

    /// Another worker manager holds the liveness marker.
    #[error("a worker manager is already running (marker {})", .path.display())]
    AlreadyRunning { path: PathBuf, pid: Option<u32> },
}

impl QueueError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(msg.into())
    }

    /// Whether retrying the same call later may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, QueueError::Storage(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_storage_errors_are_transient() {
        assert!(QueueError::storage("disk full").is_transient());
        assert!(!QueueError::validation("bad").is_transient());
        assert!(!QueueError::NotFound(JobId::generate()).is_transient());
        assert!(
            !QueueError::AlreadyRunning {
                path: PathBuf::from("/tmp/queuectl.pid"),
                pid: Some(42),
            }
            .is_transient()
        );
    }

    #[test]
    fn messages_name_the_job() {
        let id = JobId::parse("job-7").unwrap();
        assert_eq!(QueueError::NotFound(id.clone()).to_string(), "job not found: job-7");
        assert_eq!(QueueError::DuplicateId(id).to_string(), "job already exists: job-7");
    }
}

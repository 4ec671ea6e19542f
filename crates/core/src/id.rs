//! Job identifiers.

use core::str::FromStr;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::QueueError;

/// Longest caller-supplied id accepted, in bytes.
pub const MAX_JOB_ID_LEN: usize = 255;

/// Opaque, immutable job identifier.
///
/// Callers may pick their own; otherwise one is generated.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct JobId(String);

impl JobId {
    /// Generate a fresh identifier.
    ///
    /// Uses UUIDv7 (time-ordered), so generated ids sort roughly by creation.
    pub fn generate() -> Self {
        Self(Uuid::now_v7().to_string())
    }

    /// Validate a caller-supplied identifier.
    pub fn parse(raw: &str) -> Result<Self, QueueError> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(QueueError::validation("job id must not be empty"));
        }
        if trimmed.len() > MAX_JOB_ID_LEN {
            return Err(QueueError::validation(format!(
                "job id is {} bytes, limit is {MAX_JOB_ID_LEN}",
                trimmed.len()
            )));
        }
        if trimmed.chars().any(char::is_control) {
            return Err(QueueError::validation("job id must not contain control characters"));
        }
        Ok(Self(trimmed.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl core::fmt::Display for JobId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for JobId {
    type Err = QueueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for JobId {
    type Error = QueueError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<JobId> for String {
    fn from(value: JobId) -> Self {
        value.0
    }
}

//! Job record, job specification, and lifecycle transitions.

use core::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{QueueError, QueueResult};
use crate::id::JobId;
use crate::retry::{FailureOutcome, RetryPolicy};

/// Job lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Waiting for `next_run_at`, then claimable
    Pending,
    /// Claimed by exactly one worker
    Processing,
    /// Command exited 0
    Completed,
    /// A failed attempt, before the retry policy resolves it
    Failed,
    /// Retries exhausted; lives in the dead-letter queue
    Dead,
}

impl JobState {
    pub const ALL: [JobState; 5] = [
        JobState::Pending,
        JobState::Processing,
        JobState::Completed,
        JobState::Failed,
        JobState::Dead,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            JobState::Pending => "pending",
            JobState::Processing => "processing",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
            JobState::Dead => "dead",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Completed | JobState::Dead)
    }
}

impl core::fmt::Display for JobState {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobState {
    type Err = QueueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_lowercase();
        JobState::ALL
            .into_iter()
            .find(|state| state.as_str() == wanted)
            .ok_or_else(|| {
                QueueError::validation(format!(
                    "unknown state '{s}'; valid states are pending, processing, completed, failed, dead"
                ))
            })
    }
}

/// Client-facing job specification, as submitted to `enqueue`.
///
/// Wire format: `{"id"?: string, "command": string, "max_retries"?: u32}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobSpec {
    #[serde(default)]
    pub id: Option<String>,
    pub command: String,
    #[serde(default)]
    pub max_retries: Option<u32>,
}

impl JobSpec {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            id: None,
            command: command.into(),
            max_retries: None,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    /// Parse a JSON job specification.
    pub fn from_json(raw: &str) -> QueueResult<Self> {
        serde_json::from_str(raw)
            .map_err(|e| QueueError::validation(format!("invalid job spec: {e}")))
    }

    /// Build a fresh `Pending` job.
    ///
    /// `default_max_retries` comes from configuration and applies when the
    /// spec does not carry its own.
    pub fn into_job(self, default_max_retries: u32, now: DateTime<Utc>) -> QueueResult<Job> {
        if self.command.trim().is_empty() {
            return Err(QueueError::validation("job command must not be empty"));
        }
        let id = match self.id.as_deref() {
            Some(raw) => JobId::parse(raw)?,
            None => JobId::generate(),
        };
        Ok(Job::new(
            id,
            self.command,
            self.max_retries.unwrap_or(default_max_retries),
            now,
        ))
    }
}

/// A background job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    /// Shell command line
    pub command: String,
    pub state: JobState,
    /// Number of claims so far
    pub attempts: u32,
    pub max_retries: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Earliest instant the job may be claimed (only read while `Pending`)
    pub next_run_at: DateTime<Utc>,
}

impl Job {
    pub fn new(id: JobId, command: impl Into<String>, max_retries: u32, now: DateTime<Utc>) -> Self {
        Self {
            id,
            command: command.into(),
            state: JobState::Pending,
            attempts: 0,
            max_retries,
            created_at: now,
            updated_at: now,
            next_run_at: now,
        }
    }

    /// Pending and due at `now`.
    pub fn is_eligible(&self, now: DateTime<Utc>) -> bool {
        self.state == JobState::Pending && self.next_run_at <= now
    }

    /// `Pending` → `Processing`, counting the attempt.
    pub fn claim(&mut self, now: DateTime<Utc>) -> QueueResult<()> {
        self.expect_state(JobState::Pending, "claim")?;
        self.state = JobState::Processing;
        self.attempts = self.attempts.saturating_add(1);
        self.updated_at = now;
        Ok(())
    }

    /// `Processing` → `Completed`.
    ///
    /// Completing an already completed job is a no-op and returns `Ok(false)`.
    pub fn complete(&mut self, now: DateTime<Utc>) -> QueueResult<bool> {
        if self.state == JobState::Completed {
            return Ok(false);
        }
        self.expect_state(JobState::Processing, "complete")?;
        self.state = JobState::Completed;
        self.updated_at = now;
        Ok(true)
    }

    /// `Processing` → `Pending` (rescheduled) or `Dead`, per `policy`.
    pub fn fail(&mut self, policy: &RetryPolicy, now: DateTime<Utc>) -> QueueResult<FailureOutcome> {
        self.expect_state(JobState::Processing, "fail")?;
        let outcome = policy.on_failure(self.attempts, self.max_retries, now);
        match outcome {
            FailureOutcome::Retry { next_run_at, .. } => {
                self.state = JobState::Pending;
                self.next_run_at = next_run_at;
            }
            FailureOutcome::Dead => self.state = JobState::Dead,
        }
        self.updated_at = now;
        Ok(outcome)
    }

    /// Operator retry: `Dead` → `Pending` with a fresh attempt budget.
    pub fn revive(&mut self, now: DateTime<Utc>) -> QueueResult<()> {
        if self.state != JobState::Dead {
            return Err(QueueError::validation(format!(
                "job {} is not in the dead letter queue (state: {})",
                self.id, self.state
            )));
        }
        self.state = JobState::Pending;
        self.attempts = 0;
        self.next_run_at = now;
        self.updated_at = now;
        Ok(())
    }

    fn expect_state(&self, expected: JobState, transition: &str) -> QueueResult<()> {
        if self.state == expected {
            Ok(())
        } else {
            Err(QueueError::validation(format!(
                "cannot {transition} job {}: state is {}, expected {expected}",
                self.id, self.state
            )))
        }
    }
}

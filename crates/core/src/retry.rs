//! Retry policy: exponential backoff and the dead-letter boundary.

use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};

use crate::error::QueueError;

/// Ceiling applied to every computed delay (ten years).
pub const MAX_BACKOFF: Duration = Duration::from_secs(10 * 365 * 24 * 60 * 60);

/// Base of the exponential backoff, in seconds.
///
/// Finite and `>= 1.0`. Validated on construction, including when a config
/// file is deserialized, so delay computation never sees NaN or a negative
/// value.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Serialize, Deserialize)]
#[serde(try_from = "f64", into = "f64")]
pub struct BackoffBase(f64);

impl BackoffBase {
    pub const DEFAULT: BackoffBase = BackoffBase(2.0);

    pub fn new(value: f64) -> Result<Self, QueueError> {
        if !value.is_finite() {
            return Err(QueueError::validation(format!(
                "backoff base must be a finite number, got {value}"
            )));
        }
        if value < 1.0 {
            return Err(QueueError::validation(format!(
                "backoff base must be at least 1.0, got {value}"
            )));
        }
        Ok(Self(value))
    }

    pub fn get(self) -> f64 {
        self.0
    }
}

impl Default for BackoffBase {
    fn default() -> Self {
        Self::DEFAULT
    }
}

impl TryFrom<f64> for BackoffBase {
    type Error = QueueError;

    fn try_from(value: f64) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<BackoffBase> for f64 {
    fn from(value: BackoffBase) -> Self {
        value.0
    }
}

impl core::fmt::Display for BackoffBase {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Display::fmt(&self.0, f)
    }
}

/// What happens to a job after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureOutcome {
    /// Back to `Pending`, claimable again from `next_run_at`.
    Retry {
        delay: Duration,
        next_run_at: DateTime<Utc>,
    },
    /// Retries exhausted; moved to the dead-letter queue.
    Dead,
}

/// Failure policy. Pure: no clock, no state.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct RetryPolicy {
    backoff_base: BackoffBase,
}

impl RetryPolicy {
    pub fn new(backoff_base: BackoffBase) -> Self {
        Self { backoff_base }
    }

    pub fn backoff_base(&self) -> BackoffBase {
        self.backoff_base
    }

    /// Delay before the next attempt: `backoff_base ^ attempts` seconds,
    /// capped at [`MAX_BACKOFF`].
    pub fn delay_for_attempt(&self, attempts: u32) -> Duration {
        let exponent = i32::try_from(attempts).unwrap_or(i32::MAX);
        let secs = self.backoff_base.get().powi(exponent);
        if !secs.is_finite() || secs >= MAX_BACKOFF.as_secs_f64() {
            return MAX_BACKOFF;
        }
        Duration::from_secs_f64(secs)
    }

    /// Decide the fate of a job whose `attempts`-th attempt just failed.
    pub fn on_failure(&self, attempts: u32, max_retries: u32, now: DateTime<Utc>) -> FailureOutcome {
        if attempts >= max_retries {
            return FailureOutcome::Dead;
        }

        let delay = self.delay_for_attempt(attempts);
        let step = TimeDelta::from_std(delay).unwrap_or(TimeDelta::MAX);
        let next_run_at = now.checked_add_signed(step).unwrap_or(DateTime::<Utc>::MAX_UTC);

        FailureOutcome::Retry { delay, next_run_at }
    }
}

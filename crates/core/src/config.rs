//! Queue configuration.
//!
//! A flat key-value set, read once at startup and handed explicitly to the
//! store, retry policy, and pool manager. File persistence lives in
//! `queuectl-infra`.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{QueueError, QueueResult};
use crate::retry::{BackoffBase, RetryPolicy};

pub const DEFAULT_MAX_RETRIES: u32 = 3;
pub const DEFAULT_IDLE_INTERVAL_MS: u64 = 1_000;

/// Keys accepted by [`QueueConfig::get`] and [`QueueConfig::set`].
pub const CONFIG_KEYS: [&str; 5] = [
    "max-retries",
    "backoff-base",
    "idle-interval-ms",
    "command-timeout-secs",
    "shutdown-grace-secs",
];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Attempt ceiling stamped onto new jobs
    pub max_retries: u32,
    pub backoff_base: BackoffBase,
    /// Worker sleep when no job is available or the store errors
    pub idle_interval_ms: u64,
    /// Kill a command that runs longer than this (unbounded when `None`)
    pub command_timeout_secs: Option<u64>,
    /// After a stop request, kill commands still running after this long
    pub shutdown_grace_secs: Option<u64>,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            backoff_base: BackoffBase::DEFAULT,
            idle_interval_ms: DEFAULT_IDLE_INTERVAL_MS,
            command_timeout_secs: None,
            shutdown_grace_secs: None,
        }
    }
}

impl QueueConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.backoff_base)
    }

    pub fn idle_interval(&self) -> Duration {
        Duration::from_millis(self.idle_interval_ms)
    }

    pub fn command_timeout(&self) -> Option<Duration> {
        self.command_timeout_secs.map(Duration::from_secs)
    }

    pub fn shutdown_grace(&self) -> Option<Duration> {
        self.shutdown_grace_secs.map(Duration::from_secs)
    }

    /// Check the cross-field rules serde cannot express.
    pub fn validate(&self) -> QueueResult<()> {
        if self.idle_interval_ms == 0 {
            return Err(QueueError::validation("idle-interval-ms must be greater than 0"));
        }
        if self.command_timeout_secs == Some(0) {
            return Err(QueueError::validation("command-timeout-secs must be greater than 0"));
        }
        Ok(())
    }

    /// Current value of `key`, rendered as text.
    pub fn get(&self, key: &str) -> QueueResult<String> {
        let value = match key {
            "max-retries" => self.max_retries.to_string(),
            "backoff-base" => self.backoff_base.to_string(),
            "idle-interval-ms" => self.idle_interval_ms.to_string(),
            "command-timeout-secs" => render_optional(self.command_timeout_secs),
            "shutdown-grace-secs" => render_optional(self.shutdown_grace_secs),
            other => return Err(unknown_key(other)),
        };
        Ok(value)
    }

    /// Parse and apply `value` to `key`. Nothing changes on error.
    pub fn set(&mut self, key: &str, value: &str) -> QueueResult<()> {
        let mut next = self.clone();
        match key {
            "max-retries" => next.max_retries = parse_number(key, value)?,
            "backoff-base" => {
                let raw: f64 = parse_number(key, value)?;
                next.backoff_base = BackoffBase::new(raw)?;
            }
            "idle-interval-ms" => next.idle_interval_ms = parse_number(key, value)?,
            "command-timeout-secs" => next.command_timeout_secs = parse_optional(key, value)?,
            "shutdown-grace-secs" => next.shutdown_grace_secs = parse_optional(key, value)?,
            other => return Err(unknown_key(other)),
        }
        next.validate()?;
        *self = next;
        Ok(())
    }

    /// All `(key, value)` pairs in display order.
    pub fn entries(&self) -> Vec<(&'static str, String)> {
        CONFIG_KEYS
            .iter()
            .filter_map(|key| self.get(key).ok().map(|value| (*key, value)))
            .collect()
    }
}

fn unknown_key(key: &str) -> QueueError {
    QueueError::validation(format!(
        "unknown configuration key '{key}'; valid keys are {}",
        CONFIG_KEYS.join(", ")
    ))
}

fn parse_number<T: core::str::FromStr>(key: &str, value: &str) -> QueueResult<T> {
    value
        .trim()
        .parse()
        .map_err(|_| QueueError::validation(format!("invalid value for {key}: {value}")))
}

fn parse_optional(key: &str, value: &str) -> QueueResult<Option<u64>> {
    if value.trim().eq_ignore_ascii_case("none") {
        return Ok(None);
    }
    parse_number(key, value).map(Some)
}

fn render_optional(value: Option<u64>) -> String {
    value.map_or_else(|| "none".to_string(), |v| v.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let cfg = QueueConfig::default();
        assert_eq!(cfg.max_retries, 3);
        assert_eq!(cfg.backoff_base.get(), 2.0);
        assert_eq!(cfg.idle_interval(), Duration::from_secs(1));
        assert_eq!(cfg.command_timeout(), None);
        assert_eq!(cfg.shutdown_grace(), None);
        cfg.validate().unwrap();
    }

    #[test]
    fn set_updates_known_keys() {
        let mut cfg = QueueConfig::default();
        cfg.set("max-retries", "5").unwrap();
        cfg.set("backoff-base", "1.5").unwrap();
        cfg.set("command-timeout-secs", "30").unwrap();
        cfg.set("shutdown-grace-secs", "10").unwrap();

        assert_eq!(cfg.max_retries, 5);
        assert_eq!(cfg.get("backoff-base").unwrap(), "1.5");
        assert_eq!(cfg.command_timeout(), Some(Duration::from_secs(30)));

        cfg.set("command-timeout-secs", "none").unwrap();
        assert_eq!(cfg.command_timeout(), None);
        assert_eq!(cfg.get("command-timeout-secs").unwrap(), "none");
    }

    #[test]
    fn invalid_values_leave_config_untouched() {
        let mut cfg = QueueConfig::default();
        let before = cfg.clone();

        assert!(cfg.set("backoff-base", "0").is_err());
        assert!(cfg.set("backoff-base", "-1").is_err());
        assert!(cfg.set("backoff-base", "NaN").is_err());
        assert!(cfg.set("max-retries", "-3").is_err());
        assert!(cfg.set("max-retries", "three").is_err());
        assert!(cfg.set("idle-interval-ms", "0").is_err());
        assert!(cfg.set("command-timeout-secs", "0").is_err());
        assert!(cfg.set("colour", "blue").is_err());

        assert_eq!(cfg, before);
    }

    #[test]
    fn missing_fields_fall_back_to_defaults() {
        let cfg: QueueConfig = serde_json::from_str(r#"{"max_retries": 7}"#).unwrap();
        assert_eq!(cfg.max_retries, 7);
        assert_eq!(cfg.backoff_base, BackoffBase::DEFAULT);
        assert_eq!(cfg.idle_interval_ms, DEFAULT_IDLE_INTERVAL_MS);
    }

    #[test]
    fn invalid_backoff_in_file_is_rejected() {
        assert!(serde_json::from_str::<QueueConfig>(r#"{"backoff_base": -2.0}"#).is_err());
    }

    #[test]
    fn entries_cover_every_key() {
        let entries = QueueConfig::default().entries();
        let keys: Vec<_> = entries.iter().map(|(k, _)| *k).collect();
        assert_eq!(keys, CONFIG_KEYS.to_vec());
    }
}

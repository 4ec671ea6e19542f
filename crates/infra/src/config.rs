//! Data directory layout and the persisted `QueueConfig`.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use queuectl_core::QueueConfig;
use tracing::debug;

/// Overrides the data directory.
pub const HOME_ENV: &str = "QUEUECTL_HOME";

const DEFAULT_DIR_NAME: &str = ".queuectl";
const CONFIG_FILE: &str = "config.json";
const DB_FILE: &str = "jobs.db";
const PID_FILE: &str = "queuectl.pid";

/// Files under one data directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuePaths {
    pub data_dir: PathBuf,
    pub config_path: PathBuf,
    pub db_path: PathBuf,
    pub pid_path: PathBuf,
}

impl QueuePaths {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        let data_dir = data_dir.into();
        Self {
            config_path: data_dir.join(CONFIG_FILE),
            db_path: data_dir.join(DB_FILE),
            pid_path: data_dir.join(PID_FILE),
            data_dir,
        }
    }

    /// `$QUEUECTL_HOME`, else `~/.queuectl`.
    pub fn resolve() -> Result<Self> {
        Self::resolve_from(std::env::var_os(HOME_ENV).map(PathBuf::from))
    }

    fn resolve_from(override_dir: Option<PathBuf>) -> Result<Self> {
        if let Some(dir) = override_dir.filter(|d| !d.as_os_str().is_empty()) {
            return Ok(Self::new(dir));
        }
        let home = dirs::home_dir().context("could not determine home directory")?;
        Ok(Self::new(home.join(DEFAULT_DIR_NAME)))
    }

    /// Load the config; a missing file yields defaults.
    pub fn load_config(&self) -> Result<QueueConfig> {
        load_config(&self.config_path)
    }

    pub fn save_config(&self, config: &QueueConfig) -> Result<()> {
        save_config(&self.config_path, config)
    }
}

pub fn load_config(path: &Path) -> Result<QueueConfig> {
    let raw = match fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            debug!(path = %path.display(), "no config file, using defaults");
            return Ok(QueueConfig::default());
        }
        Err(e) => return Err(e).with_context(|| format!("failed to read {}", path.display())),
    };

    let config: QueueConfig = serde_json::from_str(&raw)
        .with_context(|| format!("malformed config file {}", path.display()))?;
    config
        .validate()
        .with_context(|| format!("invalid config file {}", path.display()))?;
    Ok(config)
}

/// Write via a temporary file and rename, so readers never see a torn file.
pub fn save_config(path: &Path, config: &QueueConfig) -> Result<()> {
    config.validate()?;
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }

    let json = serde_json::to_string_pretty(config).context("failed to serialize config")?;
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, json).with_context(|| format!("failed to write {}", tmp.display()))?;
    fs::rename(&tmp, path).with_context(|| format!("failed to replace {}", path.display()))?;
    debug!(path = %path.display(), "config saved");
    Ok(())
}

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::errors::TrackerError;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackerConfig {
    #[serde(default)]
    pub data_dir: Option<PathBuf>,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_worker_url")]
    pub worker_url: String,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    /// Seconds after submission before a pending job may be reassigned.
    #[serde(default)]
    pub deadline_secs: Option<u64>,
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
}

fn default_poll_interval_ms() -> u64 {
    5000
}

fn default_worker_url() -> String {
    "http://127.0.0.1:8080".to_string()
}

fn default_request_timeout_secs() -> u64 {
    30
}

fn default_event_capacity() -> usize {
    256
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            data_dir: None,
            poll_interval_ms: default_poll_interval_ms(),
            worker_url: default_worker_url(),
            request_timeout_secs: default_request_timeout_secs(),
            deadline_secs: None,
            event_capacity: default_event_capacity(),
        }
    }
}

impl TrackerConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// Reject values the poller cannot run with.
    pub fn validate(&self) -> Result<(), TrackerError> {
        if self.poll_interval_ms == 0 {
            return Err(TrackerError::Validation(
                "poll_interval_ms must be greater than 0".to_string(),
            ));
        }
        if self.event_capacity == 0 {
            return Err(TrackerError::Validation(
                "event_capacity must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }

    pub fn deadline(&self) -> Option<chrono::Duration> {
        self.deadline_secs
            .and_then(|secs| chrono::Duration::try_seconds(secs as i64))
    }
}

fn read_config(path: &Path) -> Result<TrackerConfig> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file {}", path.display()))?;
    let config: TrackerConfig = serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse config file {}", path.display()))?;
    config
        .validate()
        .with_context(|| format!("Invalid config file {}", path.display()))?;
    tracing::info!("Loaded config from: {}", path.display());
    Ok(config)
}

/// Load the TrackerConfig. Resolution order:
///   1. explicit path (`--config`), which must exist
///   2. `JOBWATCH_CONFIG_DIR/config.json`
///   3. platform config dir (`dirs::config_dir()/jobwatch/config.json`)
///   4. `TrackerConfig::default()`
pub fn load_config(config_path: Option<&Path>) -> Result<TrackerConfig> {
    if let Some(path) = config_path {
        if path.exists() {
            return read_config(path);
        }
        return Err(anyhow::anyhow!("Config file not found: {}", path.display()));
    }

    if let Ok(config_dir) = std::env::var("JOBWATCH_CONFIG_DIR") {
        let path = PathBuf::from(&config_dir).join("config.json");
        if path.exists() {
            return read_config(&path);
        }
    }

    if let Some(config_dir) = dirs::config_dir() {
        let path = config_dir.join("jobwatch").join("config.json");
        if path.exists() {
            return read_config(&path);
        }
    }

    tracing::info!("No config file found, using defaults");
    Ok(TrackerConfig::default())
}

/// Resolve the data directory: CLI override, then the config value, then
/// `JOBWATCH_DATA_DIR`, then the platform data dir.
pub fn resolve_data_dir(override_dir: Option<&Path>, config: &TrackerConfig) -> PathBuf {
    if let Some(dir) = override_dir {
        return dir.to_path_buf();
    }
    if let Some(ref dir) = config.data_dir {
        return dir.clone();
    }
    if let Ok(d) = std::env::var("JOBWATCH_DATA_DIR") {
        return PathBuf::from(d);
    }
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("jobwatch")
}

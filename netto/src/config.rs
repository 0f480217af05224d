// Configuration load/save

use crate::arbiter::DEFAULT_ALLOW;
use crate::channel::DEFAULT_SOCKET_PATH;
use crate::events::DEFAULT_EVENT_CAPACITY;
use crate::monitor::MonitorSettings;
use crate::monitor::aggregator::DEFAULT_SMOOTHING_WINDOW;
use crate::monitor::feed::{DEFAULT_DEBOUNCE, FeedCommand};
use crate::policy;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

const CONFIG_DIR: &str = "netto";
const CONFIG_FILE: &str = "config.json";

/// How long the filter waits for a verdict before failing the request
pub const DEFAULT_REPLY_TIMEOUT_MS: u64 = 5_000;

/// Configuration file structure
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Decision channel socket
    pub socket_path: PathBuf,

    /// Policy file; the data directory is used when unset
    pub policy_path: Option<PathBuf>,

    /// Verdict for applications seen for the first time
    pub default_allow: bool,

    pub event_log_capacity: usize,

    /// Filter-side wait for a verdict
    pub reply_timeout_ms: u64,

    /// Accounting feed command
    pub feed: FeedCommand,

    pub debounce_ms: u64,

    pub smoothing_window: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            socket_path: PathBuf::from(DEFAULT_SOCKET_PATH),
            policy_path: None,
            default_allow: DEFAULT_ALLOW,
            event_log_capacity: DEFAULT_EVENT_CAPACITY,
            reply_timeout_ms: DEFAULT_REPLY_TIMEOUT_MS,
            feed: FeedCommand::default(),
            debounce_ms: DEFAULT_DEBOUNCE.as_millis() as u64,
            smoothing_window: DEFAULT_SMOOTHING_WINDOW,
        }
    }
}

impl Config {
    /// Get the config file path
    pub fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir().context("No config directory for this platform")?;
        Ok(config_dir.join(CONFIG_DIR).join(CONFIG_FILE))
    }

    /// Load configuration from the default location
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path()?)
    }

    /// Load configuration from `path`, falling back to defaults when it does not exist
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            log::debug!("Config file {:?} not found, using defaults", path);
            return Ok(Config::default());
        }

        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;

        let config: Config = serde_json::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {:?}", path))?;

        log::info!("Loaded configuration from {:?}", path);
        Ok(config)
    }

    /// Save configuration to `path`
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create config directory: {:?}", parent))?;
        }

        let contents = serde_json::to_string_pretty(self).context("Failed to serialize config")?;
        fs::write(path, contents)
            .with_context(|| format!("Failed to write config file: {:?}", path))?;

        log::info!("Saved configuration to {:?}", path);
        Ok(())
    }

    pub fn policy_path(&self) -> Result<PathBuf> {
        match &self.policy_path {
            Some(path) => Ok(path.clone()),
            None => policy::default_policy_path(),
        }
    }

    pub fn reply_timeout(&self) -> Duration {
        Duration::from_millis(self.reply_timeout_ms)
    }

    pub fn monitor_settings(&self) -> MonitorSettings {
        MonitorSettings {
            feed: self.feed.clone(),
            debounce: Duration::from_millis(self.debounce_ms),
            smoothing_window: self.smoothing_window,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load_from(&dir.path().join("absent.json")).unwrap();
        assert_eq!(config, Config::default());
        assert!(config.default_allow);
        assert_eq!(config.debounce_ms, 200);
        assert_eq!(config.smoothing_window, 3);
    }

    #[test]
    fn test_partial_file_keeps_other_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        fs::write(
            &path,
            r#"{"default_allow": false, "feed": {"program": "/opt/nettop", "args": []}}"#,
        )
        .unwrap();

        let config = Config::load_from(&path).unwrap();
        assert!(!config.default_allow);
        assert_eq!(config.feed.program, "/opt/nettop");
        assert_eq!(config.event_log_capacity, DEFAULT_EVENT_CAPACITY);
        assert_eq!(config.socket_path, PathBuf::from(DEFAULT_SOCKET_PATH));
    }

    #[test]
    fn test_save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.json");

        let config = Config {
            policy_path: Some(dir.path().join("policies.json")),
            debounce_ms: 50,
            ..Config::default()
        };
        config.save_to(&path).unwrap();

        let loaded = Config::load_from(&path).unwrap();
        assert_eq!(loaded, config);
        assert_eq!(loaded.policy_path().unwrap(), dir.path().join("policies.json"));
        assert_eq!(loaded.monitor_settings().debounce, Duration::from_millis(50));
    }

    #[test]
    fn test_invalid_json_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        fs::write(&path, "{ not json").unwrap();
        assert!(Config::load_from(&path).is_err());
    }
}

//! Backend configuration.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::protocol::constants::{DEFAULT_DATA_ROOT, QUIRKS_SUBDIR};

/// Environment variable naming the spooler data directory.
pub const DATA_DIR_ENV: &str = "CUPS_DATADIR";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("Failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),
}

/// Tunables for device discovery and the transfer engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    /// Spooler data root; quirk files live below it.
    pub data_root: PathBuf,
    /// Subdirectory of `data_root` holding quirk files.
    pub quirks_subdir: String,
    /// Pause between enumeration attempts while the printer is absent.
    pub device_retry_secs: u64,
    /// Give up waiting for the printer after this long (forever if unset).
    pub device_wait_secs: Option<u64>,
    /// Bulk-OUT timeout.
    pub write_timeout_ms: u64,
    /// Bulk-IN timeout used by the back-channel reader.
    pub read_timeout_ms: u64,
    /// Back-channel polling period.
    pub read_period_ms: u64,
    /// Side-channel request read timeout.
    pub side_channel_poll_ms: u64,
    /// Shutdown bound for the side-channel thread.
    pub side_thread_wait_secs: u64,
    /// Shutdown bound for the back-channel thread.
    pub read_thread_wait_secs: u64,
    /// Extra bound after the back-channel reader is told to abandon EOF.
    pub read_abort_wait_secs: u64,
    /// Busy retries for interface claim and alt setting.
    pub claim_busy_retries: u32,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            data_root: PathBuf::from(DEFAULT_DATA_ROOT),
            quirks_subdir: QUIRKS_SUBDIR.to_string(),
            device_retry_secs: 5,
            device_wait_secs: None,
            write_timeout_ms: 5000,
            read_timeout_ms: 60_000,
            read_period_ms: 250,
            side_channel_poll_ms: 1000,
            side_thread_wait_secs: 3,
            read_thread_wait_secs: 7,
            read_abort_wait_secs: 1,
            claim_busy_retries: 50,
        }
    }
}

impl BackendConfig {
    /// Load configuration from a TOML file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: BackendConfig = toml::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Apply `CUPS_DATADIR` if it is set.
    pub fn with_env(mut self) -> Self {
        if let Some(root) = std::env::var_os(DATA_DIR_ENV).filter(|v| !v.is_empty()) {
            self.data_root = PathBuf::from(root);
        }
        self
    }

    pub fn quirks_dir(&self) -> PathBuf {
        self.data_root.join(&self.quirks_subdir)
    }

    pub fn device_retry(&self) -> Duration {
        Duration::from_secs(self.device_retry_secs)
    }

    pub fn device_wait(&self) -> Option<Duration> {
        self.device_wait_secs.map(Duration::from_secs)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    pub fn read_period(&self) -> Duration {
        Duration::from_millis(self.read_period_ms)
    }

    pub fn side_channel_poll(&self) -> Duration {
        Duration::from_millis(self.side_channel_poll_ms)
    }

    pub fn side_thread_wait(&self) -> Duration {
        Duration::from_secs(self.side_thread_wait_secs)
    }

    pub fn read_thread_wait(&self) -> Duration {
        Duration::from_secs(self.read_thread_wait_secs)
    }

    pub fn read_abort_wait(&self) -> Duration {
        Duration::from_secs(self.read_abort_wait_secs)
    }
}

//! Configuration loading and defaults for screenlockd.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Main configuration for screenlockd.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Seconds between bus reconnection attempts (default: 10).
    pub reconnect_interval_seconds: u64,

    /// Timeout for mirrored session-manager calls in seconds (default: 5).
    pub mirror_timeout_seconds: u64,

    /// Hardware button name that triggers a lock request (default: "lock").
    pub lock_keyname: String,

    /// Whether idle-triggered activation is enabled (default: true).
    /// Direct SetActive requests are unaffected by this flag.
    pub activation_enabled: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            reconnect_interval_seconds: 10,
            mirror_timeout_seconds: 5,
            lock_keyname: "lock".to_string(),
            activation_enabled: true,
        }
    }
}

impl Config {
    /// Load configuration from a file path.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
        Ok(config)
    }

    /// Load configuration from the default path, or return defaults if not found.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        if let Some(p) = path {
            return Self::load(p);
        }

        if let Some(config_dir) = dirs::config_dir() {
            let default_path = config_dir.join("screenlockd").join("config.toml");
            if default_path.exists() {
                return Self::load(&default_path);
            }
        }

        Ok(Self::default())
    }
}

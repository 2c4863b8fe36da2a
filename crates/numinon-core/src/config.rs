//! Console configuration.

use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
    history::DEFAULT_HISTORY_CAPACITY, latency::DEFAULT_LATENCY_WINDOW,
    queue::DEFAULT_QUEUE_CAPACITY,
};

const APP_DIR: &str = "numinon-console";
const CONFIG_FILE: &str = "config.json";

/// Configuration error.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("No user config directory on this platform")]
    NoConfigDir,
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Invalid config: {0}")]
    Json(#[from] serde_json::Error),
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ConsoleConfig {
    pub connection: ConnectionConfig,
    pub session: SessionConfig,
}

/// Controller connection preferences.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ConnectionConfig {
    pub server_url: String,
    pub auto_connect: bool,
    /// Opaque credential handed to the host on connect.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
    pub reconnect: ReconnectPolicy,
    /// Most recent first.
    pub recent_servers: Vec<String>,
    pub max_recent_servers: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            server_url: "ws://localhost:8080/client".to_string(),
            auto_connect: false,
            credential: None,
            reconnect: ReconnectPolicy::default(),
            recent_servers: Vec::new(),
            max_recent_servers: 5,
        }
    }
}

impl ConnectionConfig {
    /// Move `url` to the front of the recent list, trimming to the limit.
    pub fn add_recent_server(&mut self, url: &str) {
        self.recent_servers.retain(|u| u != url);
        self.recent_servers.insert(0, url.to_string());
        self.recent_servers.truncate(self.max_recent_servers);
    }
}

/// Linear back-off used by hosts that reconnect on their own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ReconnectPolicy {
    pub delay_secs: u64,
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            delay_secs: 5,
            max_attempts: 10,
        }
    }
}

impl ReconnectPolicy {
    /// Delay before `attempt` (1-based), or `None` once attempts are exhausted.
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Option<Duration> {
        if attempt == 0 || attempt > self.max_attempts {
            return None;
        }
        Some(Duration::from_secs(self.delay_secs.saturating_mul(u64::from(attempt))))
    }
}

/// Bounds and subscriptions for the session layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SessionConfig {
    pub queue_capacity: usize,
    /// `None` retries once per drain forever.
    pub max_delivery_attempts: Option<u32>,
    pub latency_window: usize,
    pub history_capacity: usize,
    /// Inbound message kinds the session relays to consumers.
    pub message_kinds: Vec<String>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            max_delivery_attempts: Some(5),
            latency_window: DEFAULT_LATENCY_WINDOW,
            history_capacity: DEFAULT_HISTORY_CAPACITY,
            message_kinds: ["agent:list", "agent:update", "task:result", "notification"]
                .into_iter()
                .map(String::from)
                .collect(),
        }
    }
}

impl ConsoleConfig {
    /// Default config file location.
    ///
    /// # Errors
    /// Returns error if the platform has no config directory.
    pub fn default_path() -> Result<PathBuf, ConfigError> {
        let dir = dirs::config_dir().ok_or(ConfigError::NoConfigDir)?;
        Ok(dir.join(APP_DIR).join(CONFIG_FILE))
    }

    /// Load from the default location, falling back to defaults.
    ///
    /// # Errors
    /// Returns error if the file exists but cannot be read or parsed.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(Self::default_path()?)
    }

    /// Load from `path`; a missing file yields defaults.
    ///
    /// # Errors
    /// Returns error if the file exists but cannot be read or parsed.
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        if !path.exists() {
            tracing::debug!(path = %path.display(), "No config file, using defaults");
            return Ok(Self::default());
        }
        let data = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&data)?)
    }

    /// Save to the default location.
    ///
    /// # Errors
    /// Returns error if the directory or file cannot be written.
    pub fn save(&self) -> Result<(), ConfigError> {
        self.save_to(Self::default_path()?)
    }

    /// Save to `path` as pretty JSON, creating parent directories.
    ///
    /// # Errors
    /// Returns error if the directory or file cannot be written.
    pub fn save_to(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let data = serde_json::to_string_pretty(self)?;
        fs::write(path, data)?;
        Ok(())
    }
}

//! Configuration for remote-pubsub

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::SessionError;

/// Link tuning.
///
/// The defaults are the protocol constants: 2 s initial connect timeout,
/// doubled per attempt, 10 attempts, 2 MiB write high-water mark.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkConfig {
    /// Budget for the first connection attempt, in milliseconds
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    /// Connection attempts before `open` gives up
    #[serde(default = "default_max_connect_attempts")]
    pub max_connect_attempts: u32,

    /// Outbound bytes allowed in flight before `send` starts waiting
    #[serde(default = "default_write_high_water_mark")]
    pub write_high_water_mark: usize,

    /// How often a blocked `send` re-checks the write buffer, in milliseconds
    #[serde(default = "default_backpressure_poll_ms")]
    pub backpressure_poll_ms: u64,
}

fn default_connect_timeout_ms() -> u64 {
    2000
}

fn default_max_connect_attempts() -> u32 {
    10
}

fn default_write_high_water_mark() -> usize {
    2 * 1024 * 1024
}

fn default_backpressure_poll_ms() -> u64 {
    10
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: default_connect_timeout_ms(),
            max_connect_attempts: default_max_connect_attempts(),
            write_high_water_mark: default_write_high_water_mark(),
            backpressure_poll_ms: default_backpressure_poll_ms(),
        }
    }
}

impl LinkConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn backpressure_poll(&self) -> Duration {
        Duration::from_millis(self.backpressure_poll_ms)
    }
}

/// Session configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Broker endpoint, `ws/host:port`, `wss/host:port` or a `ws://` URL
    #[serde(default = "default_endpoint")]
    pub endpoint: String,

    #[serde(default)]
    pub link: LinkConfig,
}

fn default_endpoint() -> String {
    "ws/127.0.0.1:10000".to_string()
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            endpoint: default_endpoint(),
            link: LinkConfig::default(),
        }
    }
}

impl SessionConfig {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            ..Default::default()
        }
    }

    /// Load config from file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, SessionError> {
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content).map_err(|e| SessionError::Config(e.to_string()))
    }

    /// Save config to file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), SessionError> {
        let content =
            toml::to_string_pretty(self).map_err(|e| SessionError::Config(e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }
}

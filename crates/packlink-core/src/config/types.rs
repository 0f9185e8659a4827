//! Configuration types for packlink
//!
//! Defines:
//! - `Settings` - Global settings loaded from `.packlink/config.toml`
//! - `ServerSettings`, `ConnectionSettings`, `PollingSettings` - its sections

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Application settings (.packlink/config.toml)
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct Settings {
    #[serde(default)]
    pub server: ServerSettings,

    #[serde(default)]
    pub connection: ConnectionSettings,

    #[serde(default)]
    pub polling: PollingSettings,
}

/// Development server location
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ServerSettings {
    /// `host:port` of the development server
    #[serde(default = "default_host")]
    pub host: String,

    /// Device name reported in the packager connection URL
    #[serde(default)]
    pub device: Option<String>,

    /// App/package identifier reported in the packager connection URL
    #[serde(default)]
    pub app: Option<String>,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: default_host(),
            device: None,
            app: None,
        }
    }
}

fn default_host() -> String {
    "localhost:8081".to_string()
}

/// Packager connection settings
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ConnectionSettings {
    /// Delay before the first reconnection attempt
    #[serde(default = "default_reconnect_initial_delay_ms")]
    pub reconnect_initial_delay_ms: u64,

    /// Cap on the reconnection delay
    #[serde(default = "default_reconnect_max_delay_ms")]
    pub reconnect_max_delay_ms: u64,

    /// Consecutive failed attempts before the connection gives up
    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: u32,

    /// Default timeout for outbound requests
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            reconnect_initial_delay_ms: default_reconnect_initial_delay_ms(),
            reconnect_max_delay_ms: default_reconnect_max_delay_ms(),
            max_reconnect_attempts: default_max_reconnect_attempts(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

impl ConnectionSettings {
    pub fn reconnect_initial_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_initial_delay_ms)
    }

    pub fn reconnect_max_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_max_delay_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

fn default_reconnect_initial_delay_ms() -> u64 {
    2000
}

fn default_reconnect_max_delay_ms() -> u64 {
    10_000
}

fn default_max_reconnect_attempts() -> u32 {
    10
}

fn default_request_timeout_secs() -> u64 {
    60
}

/// Change-notification long-poll settings
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct PollingSettings {
    /// Delay before re-polling after a failed poll
    #[serde(default = "default_failure_delay_ms")]
    pub failure_delay_ms: u64,

    /// TCP connect timeout; the read itself is never timed out
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
}

impl Default for PollingSettings {
    fn default() -> Self {
        Self {
            failure_delay_ms: default_failure_delay_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
        }
    }
}

impl PollingSettings {
    pub fn failure_delay(&self) -> Duration {
        Duration::from_millis(self.failure_delay_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

fn default_failure_delay_ms() -> u64 {
    5000
}

fn default_connect_timeout_ms() -> u64 {
    5000
}

//! Settings types.
//!
//! Field names are camelCase in the JSON file; every struct fills missing
//! fields from its `Default`.

use serde::{Deserialize, Serialize};

use crate::errors::{Result, SettingsError};

/// Root settings object.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TetherSettings {
    /// HTTP / WebSocket listener.
    pub server: ServerSettings,
    /// Per-channel protocol tuning.
    pub channel: ChannelSettings,
    /// Log output.
    pub logging: LoggingSettings,
}

impl TetherSettings {
    /// Reject values the transport cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.channel.handshake_timeout_ms == 0 {
            return Err(SettingsError::InvalidValue(
                "channel.handshakeTimeoutMs must be positive".into(),
            ));
        }
        if self.channel.inbound_queue_size == 0 || self.channel.outbound_queue_size == 0 {
            return Err(SettingsError::InvalidValue(
                "channel queue sizes must be positive".into(),
            ));
        }
        if self.server.heartbeat_interval_secs == 0 {
            return Err(SettingsError::InvalidValue(
                "server.heartbeatIntervalSecs must be positive".into(),
            ));
        }
        if self.server.heartbeat_timeout_secs < self.server.heartbeat_interval_secs {
            return Err(SettingsError::InvalidValue(
                "server.heartbeatTimeoutSecs must not be shorter than the interval".into(),
            ));
        }
        if !self.server.path.starts_with('/') {
            return Err(SettingsError::InvalidValue(format!(
                "server.path must start with '/', got '{}'",
                self.server.path
            )));
        }
        Ok(())
    }
}

/// Listener settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerSettings {
    /// Bind address.
    pub host: String,
    /// Bind port (`0` auto-assigns).
    pub port: u16,
    /// WebSocket upgrade route.
    pub path: String,
    /// Maximum concurrently tracked channels.
    pub max_connections: usize,
    /// Maximum inbound WebSocket message size in bytes.
    pub max_message_size: usize,
    /// Interval between server pings.
    pub heartbeat_interval_secs: u64,
    /// Close the socket after this long without a pong.
    pub heartbeat_timeout_secs: u64,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8787,
            path: "/ws".to_string(),
            max_connections: 1024,
            max_message_size: 1024 * 1024,
            heartbeat_interval_secs: 30,
            heartbeat_timeout_secs: 90,
        }
    }
}

/// Channel protocol settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ChannelSettings {
    /// Handshake window before a pending connect/disconnect fails closed.
    pub handshake_timeout_ms: u64,
    /// Capacity of each channel's inbound transport queue.
    pub inbound_queue_size: usize,
    /// Capacity of each socket's outbound write queue.
    pub outbound_queue_size: usize,
}

impl Default for ChannelSettings {
    fn default() -> Self {
        Self {
            handshake_timeout_ms: 20_000,
            inbound_queue_size: 256,
            outbound_queue_size: 256,
        }
    }
}

/// Log output settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingSettings {
    /// `EnvFilter` directive used when `RUST_LOG` is unset.
    pub level: String,
    /// Emit JSON lines instead of compact text.
    pub json: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

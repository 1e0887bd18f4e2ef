//! Server configuration.

use std::time::Duration;

use tether_channel::ChannelConfig;
use tether_settings::TetherSettings;

/// Configuration for the tether server.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ServerConfig {
    /// Host to bind.
    pub host: String,
    /// Port to bind (`0` auto-assigns).
    pub port: u16,
    /// Route of the `WebSocket` upgrade.
    pub path: String,
    /// Maximum concurrently tracked channels.
    pub max_connections: usize,
    /// Max `WebSocket` message size in bytes.
    pub max_message_size: usize,
    /// Interval between pings.
    pub heartbeat_interval: Duration,
    /// Close the socket after this long without a pong.
    pub heartbeat_timeout: Duration,
    /// Per-channel protocol tuning.
    pub channel: ChannelConfig,
    /// Capacity of each channel's inbound queue.
    pub inbound_queue_size: usize,
    /// Capacity of each socket's write queue.
    pub outbound_queue_size: usize,
}

impl ServerConfig {
    /// Derive from loaded settings.
    pub fn from_settings(settings: &TetherSettings) -> Self {
        let server = &settings.server;
        Self {
            host: server.host.clone(),
            port: server.port,
            path: server.path.clone(),
            max_connections: server.max_connections,
            max_message_size: server.max_message_size,
            heartbeat_interval: Duration::from_secs(server.heartbeat_interval_secs),
            heartbeat_timeout: Duration::from_secs(server.heartbeat_timeout_secs),
            channel: ChannelConfig {
                handshake_timeout: Duration::from_millis(settings.channel.handshake_timeout_ms),
            },
            inbound_queue_size: settings.channel.inbound_queue_size,
            outbound_queue_size: settings.channel.outbound_queue_size,
        }
    }
}

impl Default for ServerConfig {
    /// Settings defaults, except the port auto-assigns.
    fn default() -> Self {
        Self {
            port: 0,
            ..Self::from_settings(&TetherSettings::default())
        }
    }
}

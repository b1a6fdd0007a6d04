//! Runtime configuration for one server instance.

use std::time::Duration;

use roomcast_settings::RoomcastSettings;
use serde::{Deserialize, Serialize};

/// Flattened server configuration, derived from [`RoomcastSettings`].
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Host to bind (default `"127.0.0.1"`).
    pub host: String,
    /// Port to bind (default `0` for auto-assign).
    pub port: u16,
    /// Maximum concurrent WebSocket connections.
    pub max_connections: usize,
    /// Ping interval in milliseconds.
    pub heartbeat_interval_ms: u64,
    /// Silence after which a connection is closed, in milliseconds.
    pub heartbeat_timeout_ms: u64,
    /// Max inbound WebSocket message size in bytes.
    pub max_message_size: usize,
    /// Per-connection outbound queue depth.
    pub outbound_queue: usize,
    /// Upper bound on one handler invocation, in milliseconds.
    pub handler_timeout_ms: u64,
    /// Send `action.error` to the sender of an unknown action.
    pub notify_unknown_actions: bool,
    /// Recent bus frame ids remembered per room.
    pub dedupe_window: usize,
}

impl ServerConfig {
    /// Heartbeat interval.
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    /// Heartbeat timeout.
    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_millis(self.heartbeat_timeout_ms)
    }

    /// Handler timeout.
    pub fn handler_timeout(&self) -> Duration {
        Duration::from_millis(self.handler_timeout_ms)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 0,
            max_connections: 10_000,
            heartbeat_interval_ms: 30_000,
            heartbeat_timeout_ms: 90_000,
            max_message_size: 64 * 1024,
            outbound_queue: 256,
            handler_timeout_ms: 10_000,
            notify_unknown_actions: false,
            dedupe_window: 512,
        }
    }
}

impl From<&RoomcastSettings> for ServerConfig {
    fn from(settings: &RoomcastSettings) -> Self {
        Self {
            host: settings.server.host.clone(),
            port: settings.server.port,
            max_connections: settings.server.max_connections,
            heartbeat_interval_ms: settings.websocket.heartbeat_interval_ms,
            heartbeat_timeout_ms: settings.websocket.heartbeat_timeout_ms,
            max_message_size: settings.websocket.max_message_size,
            outbound_queue: settings.websocket.outbound_queue,
            handler_timeout_ms: settings.dispatch.handler_timeout_ms,
            notify_unknown_actions: settings.dispatch.notify_unknown_actions,
            dedupe_window: settings.pubsub.dedupe_window,
        }
    }
}

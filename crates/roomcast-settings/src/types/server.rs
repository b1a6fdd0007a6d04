//! Listener, transport and dispatch settings.

use serde::{Deserialize, Serialize};

/// HTTP listener and admission settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerSettings {
    /// Bind address.
    pub host: String,
    /// Listen port. `0` picks a free port.
    pub port: u16,
    /// Upgrades beyond this many live connections get `503`.
    pub max_connections: usize,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8000,
            max_connections: 10_000,
        }
    }
}

/// WebSocket transport settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct WebSocketSettings {
    /// How often the server pings each client.
    pub heartbeat_interval_ms: u64,
    /// A client silent for this long is closed.
    pub heartbeat_timeout_ms: u64,
    /// Largest accepted inbound frame in bytes.
    pub max_message_size: usize,
    /// Outbound frames buffered per connection before new ones are dropped.
    pub outbound_queue: usize,
}

impl Default for WebSocketSettings {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: 30_000,
            heartbeat_timeout_ms: 90_000,
            max_message_size: 64 * 1024,
            outbound_queue: 256,
        }
    }
}

/// Action dispatch settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DispatchSettings {
    /// Upper bound on a single handler invocation.
    pub handler_timeout_ms: u64,
    /// Send an `action.error` event when a client names an unknown action.
    pub notify_unknown_actions: bool,
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self {
            handler_timeout_ms: 10_000,
            notify_unknown_actions: false,
        }
    }
}

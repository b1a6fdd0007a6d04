//! Settings type definitions.
//!
//! All types use `#[serde(rename_all = "camelCase", default)]`, so a settings
//! file only needs the keys it changes.

mod pubsub;
mod server;

pub use pubsub::*;
pub use server::*;

use roomcast_core::logging::LogFormat;
use serde::{Deserialize, Serialize};

use crate::errors::{Result, SettingsError};

/// Root settings type.
///
/// ```json
/// {
///   "server": { "port": 9000 },
///   "pubsub": { "backend": "redis", "redisUrl": "redis://cache:6379" },
///   "logging": { "format": "json" }
/// }
/// ```
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RoomcastSettings {
    /// HTTP listener and admission.
    pub server: ServerSettings,
    /// WebSocket transport tuning.
    pub websocket: WebSocketSettings,
    /// Action dispatch behaviour.
    pub dispatch: DispatchSettings,
    /// Cross-process broadcast backend.
    pub pubsub: PubSubSettings,
    /// Log output.
    pub logging: LoggingSettings,
}

impl RoomcastSettings {
    /// Reject combinations that would make the server misbehave.
    pub fn validate(&self) -> Result<()> {
        let ws = &self.websocket;
        if ws.heartbeat_interval_ms == 0 {
            return Err(invalid("websocket.heartbeatIntervalMs must be non-zero"));
        }
        if ws.heartbeat_timeout_ms <= ws.heartbeat_interval_ms {
            return Err(invalid(
                "websocket.heartbeatTimeoutMs must exceed websocket.heartbeatIntervalMs",
            ));
        }
        if ws.outbound_queue == 0 {
            return Err(invalid("websocket.outboundQueue must be non-zero"));
        }
        if ws.max_message_size == 0 {
            return Err(invalid("websocket.maxMessageSize must be non-zero"));
        }
        if self.dispatch.handler_timeout_ms == 0 {
            return Err(invalid("dispatch.handlerTimeoutMs must be non-zero"));
        }
        if self.pubsub.channel_capacity == 0 {
            return Err(invalid("pubsub.channelCapacity must be non-zero"));
        }
        if self.server.max_connections == 0 {
            return Err(invalid("server.maxConnections must be non-zero"));
        }
        Ok(())
    }
}

fn invalid(message: &str) -> SettingsError {
    SettingsError::InvalidValue(message.to_owned())
}

/// Log output settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingSettings {
    /// Default filter directive when `RUST_LOG` is unset.
    pub level: String,
    /// Compact text or JSON lines.
    pub format: LogFormat,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Compact,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        RoomcastSettings::default().validate().unwrap();
    }

    #[test]
    fn empty_json_produces_defaults() {
        let settings: RoomcastSettings = serde_json::from_str("{}").unwrap();
        assert_eq!(settings.server.port, 8000);
        assert_eq!(settings.websocket.heartbeat_interval_ms, 30_000);
        assert_eq!(settings.pubsub.backend, PubSubBackendKind::Local);
        assert_eq!(settings.logging.level, "info");
    }

    #[test]
    fn json_field_names_are_camel_case() {
        let json = serde_json::to_value(RoomcastSettings::default()).unwrap();
        assert!(json["server"].get("maxConnections").is_some());
        assert!(json["websocket"].get("heartbeatTimeoutMs").is_some());
        assert!(json["dispatch"].get("notifyUnknownActions").is_some());
        assert!(json["pubsub"].get("redisUrl").is_some());
        assert_eq!(json["logging"]["format"], "compact");
    }

    #[test]
    fn default_settings_snapshot() {
        insta::assert_json_snapshot!(RoomcastSettings::default(), @r###"
        {
          "server": {
            "host": "127.0.0.1",
            "port": 8000,
            "maxConnections": 10000
          },
          "websocket": {
            "heartbeatIntervalMs": 30000,
            "heartbeatTimeoutMs": 90000,
            "maxMessageSize": 65536,
            "outboundQueue": 256
          },
          "dispatch": {
            "handlerTimeoutMs": 10000,
            "notifyUnknownActions": false
          },
          "pubsub": {
            "backend": "local",
            "redisUrl": "redis://127.0.0.1:6379",
            "channelCapacity": 1024,
            "dedupeWindow": 512
          },
          "logging": {
            "level": "info",
            "format": "compact"
          }
        }
        "###);
    }

    #[test]
    fn timeout_must_exceed_interval() {
        let mut settings = RoomcastSettings::default();
        settings.websocket.heartbeat_timeout_ms = settings.websocket.heartbeat_interval_ms;
        let err = settings.validate().unwrap_err();
        assert!(err.to_string().contains("heartbeatTimeoutMs"));
    }

    #[test]
    fn zero_queue_rejected() {
        let mut settings = RoomcastSettings::default();
        settings.websocket.outbound_queue = 0;
        assert!(matches!(
            settings.validate(),
            Err(SettingsError::InvalidValue(_))
        ));
    }
}

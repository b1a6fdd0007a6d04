//! Pub/sub backend selection.

use serde::{Deserialize, Serialize};

/// Which bus carries broadcasts between processes.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PubSubBackendKind {
    /// In-process channels. Single-process deployments only.
    #[default]
    Local,
    /// Redis `PUBLISH`/`SUBSCRIBE`.
    Redis,
}

impl PubSubBackendKind {
    /// Parse a backend name (case-insensitive).
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.to_ascii_lowercase().as_str() {
            "local" | "memory" => Some(Self::Local),
            "redis" => Some(Self::Redis),
            _ => None,
        }
    }
}

/// Broadcast bus settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PubSubSettings {
    /// Backend to use.
    pub backend: PubSubBackendKind,
    /// Connection URL for the Redis backend.
    pub redis_url: String,
    /// Per-topic buffer of the local backend.
    pub channel_capacity: usize,
    /// How many recent frame ids each relay remembers for de-duplication.
    pub dedupe_window: usize,
}

impl Default for PubSubSettings {
    fn default() -> Self {
        Self {
            backend: PubSubBackendKind::Local,
            redis_url: "redis://127.0.0.1:6379".to_string(),
            channel_capacity: 1024,
            dedupe_window: 512,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_backend_names() {
        assert_eq!(PubSubBackendKind::parse("redis"), Some(PubSubBackendKind::Redis));
        assert_eq!(PubSubBackendKind::parse("LOCAL"), Some(PubSubBackendKind::Local));
        assert_eq!(PubSubBackendKind::parse("kafka"), None);
    }

    #[test]
    fn backend_serde_lowercase() {
        let json = serde_json::to_string(&PubSubBackendKind::Redis).unwrap();
        assert_eq!(json, "\"redis\"");
    }
}

//! Settings loading with deep merge and environment variable overrides.
//!
//! Loading flow:
//! 1. Start with compiled [`RoomcastSettings::default()`]
//! 2. If the settings file exists, deep-merge its values over the defaults
//! 3. Apply `ROOMCAST_*` environment overrides (highest priority)
//! 4. Validate the result
//!
//! Deep merge rules:
//! - Objects are merged recursively (source overrides target per-key)
//! - Arrays and primitives are replaced entirely by source
//! - Null values in source are skipped (preserving target)

use std::path::{Path, PathBuf};

use roomcast_core::logging::LogFormat;
use serde_json::Value;
use tracing::{debug, warn};

use crate::errors::Result;
use crate::types::{PubSubBackendKind, RoomcastSettings};

/// Resolve the default settings file (`~/.roomcast/settings.json`).
pub fn settings_path() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    PathBuf::from(home).join(".roomcast").join("settings.json")
}

/// Load settings from the default path with env var overrides.
pub fn load_settings() -> Result<RoomcastSettings> {
    load_settings_from_path(&settings_path())
}

/// Load settings from a specific path with env var overrides.
///
/// A missing file yields defaults. Invalid JSON or values that fail
/// [`RoomcastSettings::validate`] are errors.
pub fn load_settings_from_path(path: &Path) -> Result<RoomcastSettings> {
    let mut settings = read_file_layer(path)?;
    apply_env_overrides(&mut settings);
    settings.validate()?;
    Ok(settings)
}

/// Defaults merged with the file at `path`, without env overrides.
pub fn read_file_layer(path: &Path) -> Result<RoomcastSettings> {
    let defaults = serde_json::to_value(RoomcastSettings::default())?;

    let merged = if path.exists() {
        debug!(?path, "loading settings from file");
        let content = std::fs::read_to_string(path)?;
        let user: Value = serde_json::from_str(&content)?;
        deep_merge(defaults, user)
    } else {
        debug!(?path, "settings file not found, using defaults");
        defaults
    };

    Ok(serde_json::from_value(merged)?)
}

/// Recursive deep merge of two JSON values.
pub fn deep_merge(target: Value, source: Value) -> Value {
    match (target, source) {
        (Value::Object(mut target_map), Value::Object(source_map)) => {
            for (key, source_val) in source_map {
                if source_val.is_null() {
                    continue;
                }
                let merged = if let Some(target_val) = target_map.remove(&key) {
                    deep_merge(target_val, source_val)
                } else {
                    source_val
                };
                let _ = target_map.insert(key, merged);
            }
            Value::Object(target_map)
        }
        (_, source) => source,
    }
}

/// Apply `ROOMCAST_*` environment overrides from the process environment.
pub fn apply_env_overrides(settings: &mut RoomcastSettings) {
    apply_env_overrides_from(settings, |name| std::env::var(name).ok());
}

/// Apply overrides read through `lookup`.
///
/// Invalid values are ignored with a warning and the file/default value is
/// kept:
/// - integers must parse and fall within the documented range
/// - booleans accept `true`/`1`/`yes`/`on` or `false`/`0`/`no`/`off`
pub fn apply_env_overrides_from(
    settings: &mut RoomcastSettings,
    lookup: impl Fn(&str) -> Option<String>,
) {
    let env = EnvReader { lookup };

    // ── Server ──────────────────────────────────────────────────────
    if let Some(v) = env.string("ROOMCAST_HOST") {
        settings.server.host = v;
    }
    if let Some(v) = env.parsed("ROOMCAST_PORT", |s| parse_u16_range(s, 0, 65535)) {
        settings.server.port = v;
    }
    if let Some(v) = env.parsed("ROOMCAST_MAX_CONNECTIONS", |s| {
        parse_usize_range(s, 1, 1_000_000)
    }) {
        settings.server.max_connections = v;
    }

    // ── WebSocket ───────────────────────────────────────────────────
    if let Some(v) = env.parsed("ROOMCAST_HEARTBEAT_INTERVAL_MS", |s| {
        parse_u64_range(s, 100, 600_000)
    }) {
        settings.websocket.heartbeat_interval_ms = v;
    }
    if let Some(v) = env.parsed("ROOMCAST_HEARTBEAT_TIMEOUT_MS", |s| {
        parse_u64_range(s, 200, 3_600_000)
    }) {
        settings.websocket.heartbeat_timeout_ms = v;
    }
    if let Some(v) = env.parsed("ROOMCAST_MAX_MESSAGE_SIZE", |s| {
        parse_usize_range(s, 64, 16 * 1024 * 1024)
    }) {
        settings.websocket.max_message_size = v;
    }

    // ── Dispatch ────────────────────────────────────────────────────
    if let Some(v) = env.parsed("ROOMCAST_HANDLER_TIMEOUT_MS", |s| {
        parse_u64_range(s, 1, 600_000)
    }) {
        settings.dispatch.handler_timeout_ms = v;
    }
    if let Some(v) = env.parsed("ROOMCAST_NOTIFY_UNKNOWN_ACTIONS", parse_bool) {
        settings.dispatch.notify_unknown_actions = v;
    }

    // ── Pub/sub ─────────────────────────────────────────────────────
    if let Some(v) = env.parsed("ROOMCAST_PUBSUB_BACKEND", PubSubBackendKind::parse) {
        settings.pubsub.backend = v;
    }
    if let Some(v) = env.string("ROOMCAST_REDIS_URL") {
        settings.pubsub.redis_url = v;
    }

    // ── Logging ─────────────────────────────────────────────────────
    if let Some(v) = env.string("ROOMCAST_LOG_LEVEL") {
        settings.logging.level = v;
    }
    if let Some(v) = env.parsed("ROOMCAST_LOG_FORMAT", LogFormat::parse) {
        settings.logging.format = v;
    }
}

// ── Pure parsing functions (testable without env vars) ──────────────────────

/// Parse a string as a boolean.
///
/// Accepts (case-insensitive): `true`/`1`/`yes`/`on` or `false`/`0`/`no`/`off`.
pub fn parse_bool(val: &str) -> Option<bool> {
    match val.to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Parse a string as a `u16` within a range.
pub fn parse_u16_range(val: &str, min: u16, max: u16) -> Option<u16> {
    let n: u16 = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

/// Parse a string as a `u64` within a range.
pub fn parse_u64_range(val: &str, min: u64, max: u64) -> Option<u64> {
    let n: u64 = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

/// Parse a string as a `usize` within a range.
pub fn parse_usize_range(val: &str, min: usize, max: usize) -> Option<usize> {
    let n: usize = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

struct EnvReader<F> {
    lookup: F,
}

impl<F: Fn(&str) -> Option<String>> EnvReader<F> {
    fn string(&self, name: &str) -> Option<String> {
        (self.lookup)(name).filter(|v| !v.is_empty())
    }

    fn parsed<T>(&self, name: &str, parse: impl Fn(&str) -> Option<T>) -> Option<T> {
        let val = self.string(name)?;
        let result = parse(&val);
        if result.is_none() {
            warn!(key = name, value = %val, "invalid env override, ignoring");
        }
        result
    }
}

//! Message types flowing through the router.
//!
//! [`InboundMessage`] is what a client sends: an action name, the room it
//! believes it is in, and the submitted form fields. [`OutboundMessage`] is
//! what a handler returns: a DOM insertion instruction plus the explicit
//! [`FanOut`] mode that decides who receives it. [`ServerEvent`] covers the
//! control frames the server pushes on its own.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ids::{ConnectionId, RoomId};

/// A decoded action request from a client.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct InboundMessage {
    /// Action name used to resolve the handler.
    pub action: String,
    /// Room named by the client, if any.
    pub room: Option<RoomId>,
    /// Submitted form fields.
    pub form: BTreeMap<String, String>,
}

impl InboundMessage {
    /// Create a message with no room and no fields.
    pub fn new(action: impl Into<String>) -> Self {
        Self {
            action: action.into(),
            ..Self::default()
        }
    }

    /// Builder: set the room.
    #[must_use]
    pub fn with_room(mut self, room: impl Into<RoomId>) -> Self {
        self.room = Some(room.into());
        self
    }

    /// Builder: add a form field.
    #[must_use]
    pub fn with_field(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        let _ = self.form.insert(name.into(), value.into());
        self
    }

    /// Look up a form field.
    pub fn field(&self, name: &str) -> Option<&str> {
        self.form.get(name).map(String::as_str)
    }
}

/// How rendered content is applied at the target.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum InsertMode {
    /// Replace the target's content.
    #[default]
    Replace,
    /// Append to the target's content.
    Append,
}

/// Who receives an outbound message.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum FanOut {
    /// Only the connection that sent the action.
    #[default]
    Unicast,
    /// Every connection in the sender's room, on every process.
    Broadcast,
}

/// A rendering instruction produced by a handler.
///
/// `fan_out` is routing metadata; it never appears on the wire.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OutboundMessage {
    /// DOM selector of the insertion point. Opaque to the router.
    pub target: String,
    /// Rendered HTML fragment.
    pub html: String,
    /// Replace or append.
    pub mode: InsertMode,
    /// Unicast or broadcast.
    pub fan_out: FanOut,
}

impl OutboundMessage {
    /// Unicast message replacing the target's content.
    pub fn replace(target: impl Into<String>, html: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            html: html.into(),
            mode: InsertMode::Replace,
            fan_out: FanOut::Unicast,
        }
    }

    /// Unicast message appending to the target's content.
    pub fn append(target: impl Into<String>, html: impl Into<String>) -> Self {
        Self {
            mode: InsertMode::Append,
            ..Self::replace(target, html)
        }
    }

    /// Builder: deliver to the whole room.
    #[must_use]
    pub fn broadcast(mut self) -> Self {
        self.fan_out = FanOut::Broadcast;
        self
    }

    /// Whether this message goes to the whole room.
    pub fn is_broadcast(&self) -> bool {
        self.fan_out == FanOut::Broadcast
    }

    /// Whether the content is appended rather than replaced.
    pub fn is_append(&self) -> bool {
        self.mode == InsertMode::Append
    }
}

/// Control event pushed by the server.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServerEvent {
    /// Event type (e.g. `connection.established`).
    #[serde(rename = "type")]
    pub event_type: String,
    /// RFC 3339 timestamp.
    pub timestamp: String,
    /// Event payload.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// Event type sent once a connection is open.
pub const CONNECTION_ESTABLISHED: &str = "connection.established";
/// Event type sent when an action could not be served.
pub const ACTION_ERROR: &str = "action.error";

impl ServerEvent {
    /// Create an event stamped with the current UTC time.
    pub fn new(event_type: impl Into<String>, data: Option<Value>) -> Self {
        Self {
            event_type: event_type.into(),
            timestamp: chrono::Utc::now().to_rfc3339(),
            data,
        }
    }

    /// Tell a freshly opened connection its id and room.
    pub fn connection_established(connection_id: &ConnectionId, room: &RoomId) -> Self {
        Self::new(
            CONNECTION_ESTABLISHED,
            Some(serde_json::json!({
                "connectionId": connection_id,
                "room": room,
            })),
        )
    }

    /// Tell a client its action was not served.
    pub fn action_error(action: &str, code: &str, message: impl Into<String>) -> Self {
        Self::new(
            ACTION_ERROR,
            Some(serde_json::json!({
                "action": action,
                "code": code,
                "message": message.into(),
            })),
        )
    }
}

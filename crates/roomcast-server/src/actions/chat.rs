//! `send_message`: append a chat line for everyone in the room.

use async_trait::async_trait;
use chrono::{Local, NaiveTime};
use roomcast_core::{HandlerError, InboundMessage, OutboundMessage};

use super::registry::{ActionContext, ActionHandler};
use crate::templates::{CHAT_MESSAGE, TemplateContext};

/// Action name.
pub const ACTION: &str = "send_message";
/// DOM target of the chat log.
pub const CHAT_TARGET: &str = "#chat-messages";
/// Username used when the form has no `username` field.
pub const DEFAULT_USERNAME: &str = "Anônimo";

const TIMESTAMP_FORMAT: &str = "%H:%M:%S";

/// Broadcasts a rendered chat line to the sender's room.
///
/// Blank messages produce nothing.
#[derive(Clone, Copy, Debug)]
pub struct SendMessage {
    clock: fn() -> NaiveTime,
}

impl SendMessage {
    /// Use `clock` instead of local wall time for timestamps.
    pub fn with_clock(clock: fn() -> NaiveTime) -> Self {
        Self { clock }
    }
}

impl Default for SendMessage {
    fn default() -> Self {
        Self {
            clock: || Local::now().time(),
        }
    }
}

#[async_trait]
impl ActionHandler for SendMessage {
    async fn handle(
        &self,
        ctx: &ActionContext,
        message: &InboundMessage,
    ) -> Result<Option<OutboundMessage>, HandlerError> {
        let text = message.field("message").unwrap_or_default().trim();
        if text.is_empty() {
            return Ok(None);
        }
        let username = message.field("username").unwrap_or(DEFAULT_USERNAME).trim();
        let timestamp = (self.clock)().format(TIMESTAMP_FORMAT).to_string();

        let context = TemplateContext::new()
            .with("username", username)
            .with("message", text)
            .with("timestamp", timestamp);
        let html = ctx.render(CHAT_MESSAGE, &context)?;
        Ok(Some(OutboundMessage::append(CHAT_TARGET, html).broadcast()))
    }
}

//! `say_hello`: greet the sender, and only the sender.

use async_trait::async_trait;
use roomcast_core::{HandlerError, InboundMessage, OutboundMessage};

use super::registry::{ActionContext, ActionHandler};
use crate::templates::{HELLO_MESSAGE, TemplateContext};

/// Action name.
pub const ACTION: &str = "say_hello";
/// DOM target of the greeting.
pub const GREETING_TARGET: &str = "#greeting";
/// Name used when the form has no `name` field.
pub const DEFAULT_NAME: &str = "World";

/// Renders `Hello, {name}!` into the sender's `#greeting`.
#[derive(Clone, Copy, Debug, Default)]
pub struct SayHello;

#[async_trait]
impl ActionHandler for SayHello {
    async fn handle(
        &self,
        ctx: &ActionContext,
        message: &InboundMessage,
    ) -> Result<Option<OutboundMessage>, HandlerError> {
        let name = message.field("name").unwrap_or(DEFAULT_NAME);
        let context = TemplateContext::new().with("message", format!("Hello, {name}!"));
        let html = ctx.render(HELLO_MESSAGE, &context)?;
        Ok(Some(OutboundMessage::replace(GREETING_TARGET, html)))
    }
}

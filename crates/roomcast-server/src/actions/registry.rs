//! Action name to handler table.
//!
//! Handlers are registered on an [`ActionRegistryBuilder`] during startup and
//! frozen into an immutable [`ActionRegistry`], which is then shared behind an
//! `Arc` by every connection. Lookup is a plain string match.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use roomcast_core::{
    ActionError, ConnectionId, HandlerError, InboundMessage, OutboundMessage, RoomId,
};

use crate::templates::{TemplateContext, TemplateRenderer};

/// Trait implemented by every action handler.
///
/// Returns `Ok(None)` when the action produces no DOM update.
#[async_trait]
pub trait ActionHandler: Send + Sync {
    /// Execute the action for one inbound message.
    async fn handle(
        &self,
        ctx: &ActionContext,
        message: &InboundMessage,
    ) -> Result<Option<OutboundMessage>, HandlerError>;
}

/// What a handler knows about the request beyond the message itself.
#[derive(Clone)]
pub struct ActionContext {
    /// Connection that sent the action.
    pub connection_id: ConnectionId,
    /// Room of that connection.
    pub room: RoomId,
    /// Fragment renderer.
    pub templates: Arc<dyn TemplateRenderer>,
}

impl ActionContext {
    /// Render a named template.
    pub fn render(&self, name: &str, context: &TemplateContext) -> Result<String, HandlerError> {
        Ok(self.templates.render(name, context)?)
    }
}

impl std::fmt::Debug for ActionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActionContext")
            .field("connection_id", &self.connection_id)
            .field("room", &self.room)
            .finish_non_exhaustive()
    }
}

/// Collects handlers during startup.
#[derive(Default)]
pub struct ActionRegistryBuilder {
    handlers: HashMap<String, Arc<dyn ActionHandler>>,
}

impl ActionRegistryBuilder {
    /// Create an empty builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `name` to `handler`. Each name may be bound once.
    pub fn register(
        &mut self,
        name: &str,
        handler: impl ActionHandler + 'static,
    ) -> Result<(), ActionError> {
        if self.handlers.contains_key(name) {
            return Err(ActionError::DuplicateAction(name.to_owned()));
        }
        let _ = self.handlers.insert(name.to_owned(), Arc::new(handler));
        Ok(())
    }

    /// Freeze the table.
    pub fn build(self) -> ActionRegistry {
        ActionRegistry {
            handlers: self.handlers,
        }
    }
}

/// Immutable action table.
pub struct ActionRegistry {
    handlers: HashMap<String, Arc<dyn ActionHandler>>,
}

impl ActionRegistry {
    /// Find the handler bound to `name`.
    pub fn resolve(&self, name: &str) -> Result<Arc<dyn ActionHandler>, ActionError> {
        self.handlers
            .get(name)
            .cloned()
            .ok_or_else(|| ActionError::UnknownAction(name.to_owned()))
    }

    /// All registered action names (sorted).
    pub fn actions(&self) -> Vec<String> {
        let mut names: Vec<String> = self.handlers.keys().cloned().collect();
        names.sort();
        names
    }

    /// Whether `name` is registered.
    pub fn has_action(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    /// Number of registered actions.
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    /// Whether no actions are registered.
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

/// Adapter turning an async closure into an [`ActionHandler`].
///
/// The closure receives owned copies of the context and message.
pub struct FnAction<F>(F);

impl<F> FnAction<F> {
    /// Wrap `f`.
    pub fn new(f: F) -> Self {
        Self(f)
    }
}

#[async_trait]
impl<F, Fut> ActionHandler for FnAction<F>
where
    F: Fn(ActionContext, InboundMessage) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Option<OutboundMessage>, HandlerError>> + Send + 'static,
{
    async fn handle(
        &self,
        ctx: &ActionContext,
        message: &InboundMessage,
    ) -> Result<Option<OutboundMessage>, HandlerError> {
        (self.0)(ctx.clone(), message.clone()).await
    }
}

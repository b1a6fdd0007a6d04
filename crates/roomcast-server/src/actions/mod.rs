//! Action handlers and their registry.

pub mod chat;
pub mod hello;
pub mod registry;

pub use chat::SendMessage;
pub use hello::SayHello;
pub use registry::{ActionContext, ActionHandler, ActionRegistry, ActionRegistryBuilder, FnAction};

use roomcast_core::ActionError;

/// Register the built-in demo actions (`say_hello`, `send_message`).
pub fn register_builtin(builder: &mut ActionRegistryBuilder) -> Result<(), ActionError> {
    builder.register(hello::ACTION, SayHello)?;
    builder.register(chat::ACTION, SendMessage::default())?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_actions_registered() {
        let mut builder = ActionRegistryBuilder::new();
        register_builtin(&mut builder).unwrap();
        let registry = builder.build();
        assert_eq!(registry.actions(), vec!["say_hello", "send_message"]);
    }

    #[test]
    fn registering_builtins_twice_fails() {
        let mut builder = ActionRegistryBuilder::new();
        register_builtin(&mut builder).unwrap();
        let err = register_builtin(&mut builder).unwrap_err();
        assert!(err.is_fatal());
    }
}

//! Error taxonomy.
//!
//! Each failure domain has its own [`thiserror`] enum so callers can decide
//! locally whether an error is recoverable:
//!
//! | error                                | handling                                   |
//! |--------------------------------------|--------------------------------------------|
//! | [`CodecError::Malformed`]            | drop the message, keep the connection      |
//! | [`ActionError::UnknownAction`]       | drop the message, optionally notify        |
//! | [`ActionError::DuplicateAction`]     | fatal at startup                           |
//! | [`RegistryError::DuplicateConnection`] | reject that registration only            |
//! | [`HandlerError`]                     | isolated to the connection that caused it  |
//! | [`BackendError::Unavailable`]        | broadcast degrades to unicast              |

use thiserror::Error;

use crate::ids::ConnectionId;

/// Machine-readable code for [`ActionError::UnknownAction`].
pub const UNKNOWN_ACTION: &str = "UNKNOWN_ACTION";

/// Wire decoding failures.
#[derive(Debug, Error)]
pub enum CodecError {
    /// The envelope is not well-formed or lacks an action name.
    #[error("malformed message: {reason}")]
    Malformed {
        /// What was wrong with the envelope.
        reason: String,
    },
}

impl CodecError {
    pub(crate) fn malformed(reason: impl Into<String>) -> Self {
        Self::Malformed {
            reason: reason.into(),
        }
    }
}

/// Action registration and lookup failures.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ActionError {
    /// An action name was registered twice.
    #[error("action '{0}' is already registered")]
    DuplicateAction(String),
    /// No handler is bound to the action name.
    #[error("no handler registered for action '{0}'")]
    UnknownAction(String),
}

impl ActionError {
    /// Whether the error should stop the process.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::DuplicateAction(_))
    }
}

/// Connection registry failures.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    /// A connection with the same id is already registered.
    #[error("connection '{0}' is already registered")]
    DuplicateConnection(ConnectionId),
}

/// Template rendering failures.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RenderError {
    /// No template with that name exists.
    #[error("unknown template '{0}'")]
    UnknownTemplate(String),
    /// The template needs a variable the context does not provide.
    #[error("template '{template}' requires variable '{variable}'")]
    MissingVariable {
        /// Template name.
        template: String,
        /// Missing variable.
        variable: String,
    },
}

/// Errors returned by action handlers.
#[derive(Debug, Error)]
pub enum HandlerError {
    /// A form field was missing or invalid.
    #[error("invalid form field '{field}': {message}")]
    InvalidForm {
        /// Field name.
        field: String,
        /// What is wrong with it.
        message: String,
    },
    /// Rendering the response failed.
    #[error(transparent)]
    Render(#[from] RenderError),
    /// Anything else.
    #[error("{message}")]
    Internal {
        /// Description.
        message: String,
    },
}

/// Shared pub/sub backend failures.
#[derive(Debug, Error)]
pub enum BackendError {
    /// The backend could not be reached or rejected the operation.
    #[error("pub/sub backend unavailable: {message}")]
    Unavailable {
        /// Description of the failure.
        message: String,
    },
    /// A frame on the bus could not be encoded or decoded.
    #[error("invalid bus frame: {0}")]
    Frame(#[from] serde_json::Error),
}

impl BackendError {
    /// Build an `Unavailable` error from any displayable cause.
    pub fn unavailable(cause: impl std::fmt::Display) -> Self {
        Self::Unavailable {
            message: cause.to_string(),
        }
    }
}

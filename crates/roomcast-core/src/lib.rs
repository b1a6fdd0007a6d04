//! # roomcast-core
//!
//! Foundation types shared by every roomcast crate.
//!
//! - [`ids`]: branded connection and room identifiers
//! - [`messages`]: inbound action envelopes and outbound render instructions
//! - [`codec`]: JSON wire encoding and decoding
//! - [`errors`]: the error taxonomy (malformed input, unknown actions,
//!   duplicate registrations, handler failures, backend outages)
//! - [`logging`]: `tracing` subscriber setup

#![deny(unsafe_code)]

pub mod codec;
pub mod errors;
pub mod ids;
pub mod logging;
pub mod messages;

pub use errors::{ActionError, BackendError, CodecError, HandlerError, RegistryError, RenderError};
pub use ids::{ConnectionId, RoomId};
pub use messages::{FanOut, InboundMessage, InsertMode, OutboundMessage, ServerEvent};

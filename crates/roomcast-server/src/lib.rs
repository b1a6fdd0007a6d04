//! # roomcast-server
//!
//! Room-scoped WebSocket broadcast router on axum.
//!
//! - Connection registry: live connections grouped by room
//! - Action registry: action name to async handler, frozen at startup
//! - Dispatch: decode, resolve, invoke under a timeout, route the output
//! - Broadcast: publish once per room to a pub/sub bus, fan out locally
//! - HTTP: demo page, `/ws` upgrade, `/health`, `/metrics`

#![deny(unsafe_code)]

pub mod actions;
pub mod broadcast;
pub mod config;
pub mod health;
pub mod metrics;
pub mod pubsub;
pub mod server;
pub mod shutdown;
pub mod templates;
pub mod websocket;

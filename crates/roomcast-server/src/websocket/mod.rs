//! WebSocket connection management, heartbeat, dispatch and session lifecycle.

pub mod connection;
pub mod dispatch;
pub mod heartbeat;
pub mod registry;
pub mod session;

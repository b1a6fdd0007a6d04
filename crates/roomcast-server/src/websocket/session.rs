//! WebSocket session lifecycle: one connected client from upgrade through
//! disconnect.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{CloseFrame, Message, Utf8Bytes, WebSocket, close_code};
use bytes::Bytes;
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use metrics::{counter, gauge, histogram};
use roomcast_core::codec;
use roomcast_core::{ConnectionId, RoomId, ServerEvent};
use tokio::sync::mpsc;
use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::connection::{ClientConnection, ConnectionState};
use super::dispatch::Dispatcher;
use super::heartbeat::{HeartbeatResult, run_heartbeat};
use crate::config::ServerConfig;
use crate::metrics::{
    WS_CONNECTION_DURATION_SECONDS, WS_CONNECTIONS_ACTIVE, WS_CONNECTIONS_TOTAL,
    WS_DISCONNECTIONS_TOTAL, WS_REJECTED_TOTAL,
};

/// Per-session timing and buffering.
#[derive(Clone, Copy, Debug)]
pub struct SessionSettings {
    /// Interval between server Ping frames.
    pub heartbeat_interval: Duration,
    /// Silence after which the client is disconnected.
    pub heartbeat_timeout: Duration,
    /// Outbound queue depth.
    pub outbound_queue: usize,
}

impl From<&ServerConfig> for SessionSettings {
    fn from(config: &ServerConfig) -> Self {
        Self {
            heartbeat_interval: config.heartbeat_interval(),
            heartbeat_timeout: config.heartbeat_timeout(),
            outbound_queue: config.outbound_queue.max(1),
        }
    }
}

/// Why a session ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DisconnectReason {
    /// The client closed the socket.
    ClientClosed,
    /// The client went silent past the heartbeat timeout.
    HeartbeatTimeout,
    /// The server is shutting down.
    ServerShutdown,
    /// Reading or writing the socket failed.
    TransportError,
    /// The connection could not be registered.
    Rejected,
}

impl DisconnectReason {
    /// Metric label.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ClientClosed => "client_closed",
            Self::HeartbeatTimeout => "heartbeat_timeout",
            Self::ServerShutdown => "shutdown",
            Self::TransportError => "transport_error",
            Self::Rejected => "rejected",
        }
    }
}

/// Run a WebSocket session for a connected client.
///
/// 1. Registers the connection in its room and subscribes the room's relay
/// 2. Queues a `connection.established` event carrying the id and room
/// 3. Dispatches inbound frames in arrival order
/// 4. Forwards queued frames and sends periodic Pings from a writer task
/// 5. Unregisters and releases the room on disconnect
#[instrument(skip_all, fields(conn_id = %connection_id, room = %room))]
pub async fn run_ws_session(
    ws: WebSocket,
    connection_id: ConnectionId,
    room: RoomId,
    dispatcher: Arc<Dispatcher>,
    settings: SessionSettings,
    shutdown: CancellationToken,
) -> DisconnectReason {
    let (mut ws_tx, mut ws_rx) = ws.split();
    let (send_tx, send_rx) = mpsc::channel::<Bytes>(settings.outbound_queue);
    let connection = Arc::new(ClientConnection::new(connection_id, room.clone(), send_tx));
    let registry = Arc::clone(dispatcher.registry());
    let distributor = Arc::clone(dispatcher.distributor());

    if let Err(error) = registry.register(Arc::clone(&connection)) {
        counter!(WS_REJECTED_TOTAL, "reason" => "duplicate").increment(1);
        warn!(%error, "rejecting connection");
        let _ = ws_tx.send(Message::Close(None)).await;
        return DisconnectReason::Rejected;
    }

    info!("client connected");
    counter!(WS_CONNECTIONS_TOTAL).increment(1);
    gauge!(WS_CONNECTIONS_ACTIVE).increment(1.0);

    if let Err(error) = distributor.subscribe_room(&room).await {
        warn!(%error, "room relay unavailable, broadcasts will reach this client only");
    }

    let established = ServerEvent::connection_established(&connection.id, &room);
    let _ = connection.send(codec::encode_event(&established));
    let _ = connection.transition(ConnectionState::Open);

    let cancel = shutdown.child_token();
    let writer = tokio::spawn(write_loop(
        ws_tx,
        send_rx,
        settings.heartbeat_interval,
        cancel.clone(),
    ));
    let heartbeat = {
        let connection = Arc::clone(&connection);
        let cancel = cancel.clone();
        tokio::spawn(async move {
            let result = run_heartbeat(
                connection,
                settings.heartbeat_interval,
                settings.heartbeat_timeout,
                cancel.clone(),
            )
            .await;
            if result == HeartbeatResult::TimedOut {
                warn!("client unresponsive, disconnecting");
                cancel.cancel();
            }
            result
        })
    };

    let reason = loop {
        let next = tokio::select! {
            biased;
            () = cancel.cancelled() => break None,
            next = ws_rx.next() => next,
        };
        match next {
            Some(Ok(Message::Text(text))) => {
                connection.mark_alive();
                let _ = dispatcher.dispatch(&connection, text.as_str().as_bytes()).await;
            }
            Some(Ok(Message::Binary(data))) => {
                connection.mark_alive();
                let _ = dispatcher.dispatch(&connection, &data).await;
            }
            Some(Ok(Message::Ping(_) | Message::Pong(_))) => connection.mark_alive(),
            Some(Ok(Message::Close(_))) | None => break Some(DisconnectReason::ClientClosed),
            Some(Err(error)) => {
                debug!(%error, "websocket read failed");
                break Some(DisconnectReason::TransportError);
            }
        }
    };

    let _ = connection.transition(ConnectionState::Closing);
    cancel.cancel();
    let _ = writer.await;
    let heartbeat = heartbeat.await.unwrap_or(HeartbeatResult::Cancelled);

    let reason = match reason {
        Some(reason) => reason,
        None if heartbeat == HeartbeatResult::TimedOut => DisconnectReason::HeartbeatTimeout,
        None if shutdown.is_cancelled() => DisconnectReason::ServerShutdown,
        // The writer failed and cancelled the session.
        None => DisconnectReason::TransportError,
    };

    let _ = registry.unregister(&connection.id);
    distributor.release_room(&room).await;
    let _ = connection.transition(ConnectionState::Closed);

    info!(
        reason = reason.as_str(),
        dropped = connection.drop_count(),
        "client disconnected"
    );
    counter!(WS_DISCONNECTIONS_TOTAL, "reason" => reason.as_str()).increment(1);
    gauge!(WS_CONNECTIONS_ACTIVE).decrement(1.0);
    histogram!(WS_CONNECTION_DURATION_SECONDS).record(connection.age().as_secs_f64());
    reason
}

/// Forward queued frames to the socket and send a Ping every `ping_interval`.
///
/// On cancel, flushes what is already queued and sends a Close frame. A
/// failed write cancels the session.
async fn write_loop(
    mut ws_tx: SplitSink<WebSocket, Message>,
    mut send_rx: mpsc::Receiver<Bytes>,
    ping_interval: Duration,
    cancel: CancellationToken,
) {
    let mut ping = time::interval_at(time::Instant::now() + ping_interval, ping_interval);
    ping.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => {
                while let Ok(frame) = send_rx.try_recv() {
                    if ws_tx.send(to_ws_message(frame)).await.is_err() {
                        return;
                    }
                }
                let close = CloseFrame {
                    code: close_code::AWAY,
                    reason: Utf8Bytes::from_static("connection closing"),
                };
                let _ = ws_tx.send(Message::Close(Some(close))).await;
                return;
            }
            frame = send_rx.recv() => {
                let Some(frame) = frame else { break };
                if ws_tx.send(to_ws_message(frame)).await.is_err() {
                    break;
                }
            }
            _ = ping.tick() => {
                if ws_tx.send(Message::Ping(Bytes::new())).await.is_err() {
                    break;
                }
            }
        }
    }
    cancel.cancel();
}

/// Encoded frames are JSON, so they go out as Text. Anything that is not
/// UTF-8 goes out as Binary.
fn to_ws_message(frame: Bytes) -> Message {
    match String::from_utf8(frame.to_vec()) {
        Ok(text) => Message::Text(text.into()),
        Err(error) => Message::Binary(Bytes::from(error.into_bytes())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_frames_are_text() {
        let msg = to_ws_message(Bytes::from_static(br##"{"target":"#x"}"##));
        assert!(matches!(msg, Message::Text(ref t) if t.as_str() == r##"{"target":"#x"}"##));
    }

    #[test]
    fn non_utf8_frames_are_binary() {
        let msg = to_ws_message(Bytes::from_static(&[0xff, 0xfe]));
        assert!(matches!(msg, Message::Binary(ref b) if b.as_ref() == [0xff, 0xfe]));
    }

    #[test]
    fn settings_from_config() {
        let config = ServerConfig {
            heartbeat_interval_ms: 1_000,
            heartbeat_timeout_ms: 3_000,
            outbound_queue: 0,
            ..ServerConfig::default()
        };
        let settings = SessionSettings::from(&config);
        assert_eq!(settings.heartbeat_interval, Duration::from_secs(1));
        assert_eq!(settings.heartbeat_timeout, Duration::from_secs(3));
        assert_eq!(settings.outbound_queue, 1);
    }

    #[test]
    fn disconnect_reason_labels() {
        assert_eq!(DisconnectReason::ClientClosed.as_str(), "client_closed");
        assert_eq!(DisconnectReason::HeartbeatTimeout.as_str(), "heartbeat_timeout");
        assert_eq!(DisconnectReason::ServerShutdown.as_str(), "shutdown");
    }
}

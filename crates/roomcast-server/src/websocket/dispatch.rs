//! Inbound frame dispatch.
//!
//! One frame in, at most one rendering instruction out:
//!
//! 1. decode the envelope (malformed frames are dropped)
//! 2. check the named room against the connection's room
//! 3. resolve the action (unknown actions are dropped)
//! 4. run the handler under a timeout, catching panics
//! 5. route the result: unicast to the sender or broadcast to the room
//!
//! Every failure is contained to the frame that caused it. The connection
//! stays open and keeps being served.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::FutureExt;
use metrics::{counter, histogram};
use roomcast_core::codec;
use roomcast_core::errors::UNKNOWN_ACTION;
use roomcast_core::{HandlerError, InboundMessage, OutboundMessage, ServerEvent};
use thiserror::Error;
use tracing::{Span, debug, error, instrument, warn};

use super::connection::ClientConnection;
use super::registry::ConnectionRegistry;
use crate::actions::{ActionContext, ActionRegistry};
use crate::broadcast::{BroadcastDistributor, BroadcastOutcome};
use crate::metrics::{
    ACTION_DURATION_SECONDS, ACTION_ERRORS_TOTAL, ACTION_REQUESTS_TOTAL, ACTIONS_UNKNOWN_TOTAL,
    MESSAGES_MALFORMED_TOTAL,
};
use crate::templates::TemplateRenderer;

/// Default upper bound on one handler invocation.
pub const DEFAULT_HANDLER_TIMEOUT: Duration = Duration::from_secs(10);

/// Why a frame produced no output.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DropReason {
    /// The connection is not open (still connecting, or closing).
    NotOpen,
    /// The frame could not be decoded.
    Malformed,
    /// The frame named a room other than the connection's.
    RoomMismatch,
    /// No handler is bound to the action.
    UnknownAction,
    /// The handler failed, timed out or panicked.
    HandlerFailed,
}

/// What happened to one inbound frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Sent to the sender only.
    Unicast {
        /// Whether the sender's queue accepted it.
        delivered: bool,
    },
    /// Published to the room.
    Broadcast,
    /// A broadcast that fell back to the sender because the bus was down.
    DegradedToUnicast {
        /// Whether the sender's queue accepted it.
        delivered: bool,
    },
    /// The handler ran and chose not to render anything.
    NoOutput,
    /// The frame was discarded.
    Dropped(DropReason),
}

/// Failure of one handler invocation.
#[derive(Debug, Error)]
pub enum HandlerExecutionError {
    /// The handler returned an error.
    #[error(transparent)]
    Failed(#[from] HandlerError),
    /// The handler did not finish in time.
    #[error("handler timed out after {0:?}")]
    TimedOut(Duration),
    /// The handler panicked.
    #[error("handler panicked: {0}")]
    Panicked(String),
}

impl HandlerExecutionError {
    fn error_type(&self) -> &'static str {
        match self {
            Self::Failed(_) => "failed",
            Self::TimedOut(_) => "timeout",
            Self::Panicked(_) => "panic",
        }
    }
}

/// Routes inbound frames to action handlers and their output to clients.
pub struct Dispatcher {
    actions: Arc<ActionRegistry>,
    registry: Arc<ConnectionRegistry>,
    distributor: Arc<BroadcastDistributor>,
    templates: Arc<dyn TemplateRenderer>,
    handler_timeout: Duration,
    notify_unknown_actions: bool,
}

impl Dispatcher {
    /// Create a dispatcher with the default handler timeout.
    pub fn new(
        actions: Arc<ActionRegistry>,
        registry: Arc<ConnectionRegistry>,
        distributor: Arc<BroadcastDistributor>,
        templates: Arc<dyn TemplateRenderer>,
    ) -> Self {
        Self {
            actions,
            registry,
            distributor,
            templates,
            handler_timeout: DEFAULT_HANDLER_TIMEOUT,
            notify_unknown_actions: false,
        }
    }

    /// Builder: bound every handler invocation by `timeout`.
    #[must_use]
    pub fn with_handler_timeout(mut self, timeout: Duration) -> Self {
        self.handler_timeout = timeout;
        self
    }

    /// Builder: tell senders when their action is unknown.
    #[must_use]
    pub fn with_unknown_action_notices(mut self, enabled: bool) -> Self {
        self.notify_unknown_actions = enabled;
        self
    }

    /// Connection registry shared with the sessions.
    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    /// Broadcast distributor shared with the sessions.
    pub fn distributor(&self) -> &Arc<BroadcastDistributor> {
        &self.distributor
    }

    /// Action table.
    pub fn actions(&self) -> &Arc<ActionRegistry> {
        &self.actions
    }

    /// Handle one inbound frame from `conn`.
    #[instrument(skip_all, fields(conn_id = %conn.id, room = %conn.room, action))]
    pub async fn dispatch(&self, conn: &Arc<ClientConnection>, raw: &[u8]) -> DispatchOutcome {
        if !conn.is_open() {
            debug!(state = ?conn.state(), "connection not open, discarding frame");
            return DispatchOutcome::Dropped(DropReason::NotOpen);
        }

        let message = match codec::decode(raw) {
            Ok(message) => message,
            Err(error) => {
                counter!(MESSAGES_MALFORMED_TOTAL).increment(1);
                warn!(%error, len = raw.len(), "discarding malformed frame");
                return DispatchOutcome::Dropped(DropReason::Malformed);
            }
        };
        let _ = Span::current().record("action", message.action.as_str());

        if let Some(named) = &message.room {
            if *named != conn.room {
                warn!(named_room = %named, "frame names another room, discarding");
                return DispatchOutcome::Dropped(DropReason::RoomMismatch);
            }
        }

        let handler = match self.actions.resolve(&message.action) {
            Ok(handler) => handler,
            Err(error) => {
                counter!(ACTIONS_UNKNOWN_TOTAL).increment(1);
                warn!(%error, "discarding unknown action");
                if self.notify_unknown_actions {
                    let event =
                        ServerEvent::action_error(&message.action, UNKNOWN_ACTION, error.to_string());
                    let _ = conn.send(codec::encode_event(&event));
                }
                return DispatchOutcome::Dropped(DropReason::UnknownAction);
            }
        };

        let ctx = ActionContext {
            connection_id: conn.id.clone(),
            room: conn.room.clone(),
            templates: Arc::clone(&self.templates),
        };

        match self.invoke(&*handler, &ctx, &message).await {
            Ok(Some(output)) => self.route(conn, &output).await,
            Ok(None) => {
                debug!("handler produced no output");
                DispatchOutcome::NoOutput
            }
            Err(error) => {
                counter!(
                    ACTION_ERRORS_TOTAL,
                    "action" => message.action.clone(),
                    "error_type" => error.error_type()
                )
                .increment(1);
                error!(%error, "action handler failed");
                DispatchOutcome::Dropped(DropReason::HandlerFailed)
            }
        }
    }

    async fn invoke(
        &self,
        handler: &dyn crate::actions::ActionHandler,
        ctx: &ActionContext,
        message: &InboundMessage,
    ) -> Result<Option<OutboundMessage>, HandlerExecutionError> {
        counter!(ACTION_REQUESTS_TOTAL, "action" => message.action.clone()).increment(1);
        let started = Instant::now();

        let guarded = AssertUnwindSafe(handler.handle(ctx, message)).catch_unwind();
        let result = match tokio::time::timeout(self.handler_timeout, guarded).await {
            Err(_) => Err(HandlerExecutionError::TimedOut(self.handler_timeout)),
            Ok(Err(panic)) => Err(HandlerExecutionError::Panicked(panic_message(&*panic))),
            Ok(Ok(result)) => result.map_err(HandlerExecutionError::from),
        };

        histogram!(ACTION_DURATION_SECONDS, "action" => message.action.clone())
            .record(started.elapsed().as_secs_f64());
        result
    }

    async fn route(&self, conn: &Arc<ClientConnection>, output: &OutboundMessage) -> DispatchOutcome {
        if !output.is_broadcast() {
            let delivered = self.registry.send_to(&conn.id, codec::encode(output));
            debug!(delivered, target = %output.target, "unicast reply");
            return DispatchOutcome::Unicast { delivered };
        }
        match self.distributor.broadcast(output, conn).await {
            BroadcastOutcome::Published => {
                debug!(target = %output.target, "broadcast published");
                DispatchOutcome::Broadcast
            }
            BroadcastOutcome::DegradedToUnicast { delivered } => {
                DispatchOutcome::DegradedToUnicast { delivered }
            }
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_owned()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_owned()
    }
}

//! HTTP surface: demo page, WebSocket upgrade, health and metrics.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::Router;
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Query, State};
use axum::http::{StatusCode, header};
use axum::response::{Html, IntoResponse, Json, Response};
use axum::routing::get;
use metrics::counter;
use metrics_exporter_prometheus::PrometheusHandle;
use roomcast_core::{ConnectionId, RoomId};
use serde::Deserialize;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use crate::actions::ActionRegistry;
use crate::broadcast::BroadcastDistributor;
use crate::config::ServerConfig;
use crate::health::{self, HealthResponse};
use crate::metrics::WS_REJECTED_TOTAL;
use crate::pubsub::PubSubBackend;
use crate::shutdown::ShutdownCoordinator;
use crate::templates::{self, MaudTemplates, TemplateRenderer};
use crate::websocket::dispatch::Dispatcher;
use crate::websocket::registry::ConnectionRegistry;
use crate::websocket::session::{SessionSettings, run_ws_session};

/// Shared state for axum handlers.
#[derive(Clone)]
pub struct AppState {
    /// Server configuration.
    pub config: Arc<ServerConfig>,
    /// Frame dispatcher (owns the registries and the distributor).
    pub dispatcher: Arc<Dispatcher>,
    /// Shutdown coordinator tracking session tasks.
    pub shutdown: ShutdownCoordinator,
    /// Server start time for uptime.
    pub start_time: Instant,
    /// Prometheus handle for `/metrics`.
    pub metrics: Option<PrometheusHandle>,
    /// One permit per admitted connection, held for the session's lifetime.
    pub admission: Arc<Semaphore>,
}

/// The roomcast server.
pub struct RoomcastServer {
    config: Arc<ServerConfig>,
    dispatcher: Arc<Dispatcher>,
    shutdown: ShutdownCoordinator,
    start_time: Instant,
    metrics: Option<PrometheusHandle>,
    admission: Arc<Semaphore>,
}

impl RoomcastServer {
    /// Create a server rendering the built-in templates.
    pub fn new(
        config: ServerConfig,
        actions: ActionRegistry,
        backend: Arc<dyn PubSubBackend>,
    ) -> Self {
        Self::with_templates(config, actions, backend, Arc::new(MaudTemplates))
    }

    /// Create a server with a custom template renderer.
    pub fn with_templates(
        config: ServerConfig,
        actions: ActionRegistry,
        backend: Arc<dyn PubSubBackend>,
        templates: Arc<dyn TemplateRenderer>,
    ) -> Self {
        let registry = Arc::new(ConnectionRegistry::new());
        let distributor = Arc::new(BroadcastDistributor::new(
            backend,
            Arc::clone(&registry),
            config.dedupe_window,
        ));
        let dispatcher = Dispatcher::new(Arc::new(actions), registry, distributor, templates)
            .with_handler_timeout(config.handler_timeout())
            .with_unknown_action_notices(config.notify_unknown_actions);

        let admission = Arc::new(Semaphore::new(
            config.max_connections.min(Semaphore::MAX_PERMITS),
        ));

        Self {
            config: Arc::new(config),
            dispatcher: Arc::new(dispatcher),
            shutdown: ShutdownCoordinator::new(),
            start_time: Instant::now(),
            metrics: None,
            admission,
        }
    }

    /// Builder: serve `/metrics` from `handle`.
    #[must_use]
    pub fn with_metrics(mut self, handle: PrometheusHandle) -> Self {
        self.metrics = Some(handle);
        self
    }

    /// Build the axum router.
    pub fn router(&self) -> Router {
        let state = AppState {
            config: Arc::clone(&self.config),
            dispatcher: Arc::clone(&self.dispatcher),
            shutdown: self.shutdown.clone(),
            start_time: self.start_time,
            metrics: self.metrics.clone(),
            admission: Arc::clone(&self.admission),
        };

        Router::new()
            .route("/", get(index_handler))
            .route("/ws", get(ws_handler))
            .route("/health", get(health_handler))
            .route("/metrics", get(metrics_handler))
            .with_state(state)
            .layer(TraceLayer::new_for_http())
            .layer(CorsLayer::permissive())
    }

    /// Bind the configured address and serve until shutdown.
    ///
    /// Returns the bound address (useful with port 0) and the serve task.
    pub async fn listen(&self) -> std::io::Result<(SocketAddr, JoinHandle<()>)> {
        let addr = format!("{}:{}", self.config.host, self.config.port);
        let listener = tokio::net::TcpListener::bind(&addr).await?;
        let local_addr = listener.local_addr()?;
        info!(%local_addr, "roomcast server listening");

        let router = self.router();
        let token = self.shutdown.token();
        let handle = tokio::spawn(async move {
            if let Err(error) = axum::serve(listener, router)
                .with_graceful_shutdown(async move { token.cancelled().await })
                .await
            {
                warn!(%error, "server stopped with error");
            }
        });
        Ok((local_addr, handle))
    }

    /// Stop accepting connections, close every session and stop the relays.
    pub async fn shutdown_gracefully(&self, timeout: std::time::Duration) -> bool {
        let drained = self.shutdown.drain(timeout).await;
        self.dispatcher.distributor().shutdown().await;
        drained
    }

    /// Live connections.
    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        self.dispatcher.registry()
    }

    /// Broadcast distributor.
    pub fn distributor(&self) -> &Arc<BroadcastDistributor> {
        self.dispatcher.distributor()
    }

    /// Shutdown coordinator.
    pub fn shutdown(&self) -> &ShutdownCoordinator {
        &self.shutdown
    }

    /// Connections that can still be admitted.
    pub fn available_slots(&self) -> usize {
        self.admission.available_permits()
    }

    /// Server configuration.
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }
}

#[derive(Debug, Default, Deserialize)]
struct WsQuery {
    room: Option<String>,
}

async fn index_handler() -> Html<String> {
    Html(templates::index_page().into_string())
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(query): Query<WsQuery>,
    State(state): State<AppState>,
) -> Response {
    if state.shutdown.is_shutting_down() {
        counter!(WS_REJECTED_TOTAL, "reason" => "shutting_down").increment(1);
        return (StatusCode::SERVICE_UNAVAILABLE, "server is shutting down").into_response();
    }
    let Ok(permit) = Arc::clone(&state.admission).try_acquire_owned() else {
        counter!(WS_REJECTED_TOTAL, "reason" => "capacity").increment(1);
        warn!(
            max_connections = state.config.max_connections,
            "connection limit reached, rejecting upgrade"
        );
        return (StatusCode::SERVICE_UNAVAILABLE, "too many connections").into_response();
    };

    let room = resolve_room(query.room.as_deref());
    let connection_id = ConnectionId::new();
    let settings = SessionSettings::from(&*state.config);
    let dispatcher = Arc::clone(&state.dispatcher);
    let shutdown = state.shutdown.clone();
    debug!(conn_id = %connection_id, %room, "upgrading websocket");

    ws.max_message_size(state.config.max_message_size)
        .on_upgrade(move |socket| {
            let token = shutdown.token();
            let session = shutdown.track(async move {
                let _permit = permit;
                run_ws_session(socket, connection_id, room, dispatcher, settings, token).await
            });
            async move {
                let _ = session.await;
            }
        })
}

/// Room from the `room` query parameter, or a fresh one when it is absent
/// or not a valid token.
fn resolve_room(raw: Option<&str>) -> RoomId {
    match raw.filter(|raw| !raw.is_empty()) {
        Some(raw) => RoomId::parse(raw).unwrap_or_else(|| {
            warn!("invalid room token in upgrade request, generating a new room");
            RoomId::generate()
        }),
        None => RoomId::generate(),
    }
}

async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    let registry = state.dispatcher.registry();
    Json(health::health_check(
        state.start_time,
        registry.len(),
        registry.room_count(),
        state.shutdown.is_shutting_down(),
    ))
}

async fn metrics_handler(State(state): State<AppState>) -> Response {
    match &state.metrics {
        Some(handle) => (
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            crate::metrics::render(handle),
        )
            .into_response(),
        None => (StatusCode::NOT_FOUND, "metrics recorder not installed").into_response(),
    }
}

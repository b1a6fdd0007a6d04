//! # roomcast
//!
//! Server binary: loads settings, installs logging and metrics, registers the
//! built-in actions, connects the pub/sub bus and serves until Ctrl-C.

#![deny(unsafe_code)]

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use roomcast_core::logging::{LogFormat, init_subscriber};
use roomcast_server::actions::{ActionRegistryBuilder, register_builtin};
use roomcast_server::config::ServerConfig;
use roomcast_server::pubsub::{LocalPubSub, PubSubBackend};
use roomcast_server::server::RoomcastServer;
use roomcast_settings::{PubSubBackendKind, RoomcastSettings};
use tracing::{info, warn};

/// Time allowed for open sessions to close on shutdown.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

/// Room-scoped WebSocket broadcast server.
#[derive(Parser, Debug)]
#[command(name = "roomcast", about = "Room-scoped WebSocket broadcast server")]
struct Cli {
    /// Host to bind (overrides settings).
    #[arg(long)]
    host: Option<String>,

    /// Port to bind, 0 for auto-assign (overrides settings).
    #[arg(long)]
    port: Option<u16>,

    /// Settings file (default `~/.roomcast/settings.json`).
    #[arg(long)]
    config: Option<PathBuf>,

    /// Pub/sub backend: `local` or `redis` (overrides settings).
    #[arg(long, value_parser = parse_backend)]
    pubsub: Option<PubSubBackendKind>,

    /// Redis URL for the `redis` backend (overrides settings).
    #[arg(long)]
    redis_url: Option<String>,

    /// Log level or `EnvFilter` directive (overrides settings; `RUST_LOG` wins).
    #[arg(long)]
    log_level: Option<String>,

    /// Log format: `compact` or `json` (overrides settings).
    #[arg(long, value_parser = parse_log_format)]
    log_format: Option<LogFormat>,
}

fn parse_backend(raw: &str) -> std::result::Result<PubSubBackendKind, String> {
    PubSubBackendKind::parse(raw).ok_or_else(|| format!("unknown pub/sub backend '{raw}'"))
}

fn parse_log_format(raw: &str) -> std::result::Result<LogFormat, String> {
    LogFormat::parse(raw).ok_or_else(|| format!("unknown log format '{raw}'"))
}

impl Cli {
    /// Apply flags on top of the loaded settings.
    fn apply(&self, settings: &mut RoomcastSettings) {
        if let Some(host) = &self.host {
            settings.server.host.clone_from(host);
        }
        if let Some(port) = self.port {
            settings.server.port = port;
        }
        if let Some(backend) = self.pubsub {
            settings.pubsub.backend = backend;
        }
        if let Some(url) = &self.redis_url {
            settings.pubsub.redis_url.clone_from(url);
        }
        if let Some(level) = &self.log_level {
            settings.logging.level.clone_from(level);
        }
        if let Some(format) = self.log_format {
            settings.logging.format = format;
        }
    }
}

fn load_settings(cli: &Cli) -> Result<RoomcastSettings> {
    let path = cli
        .config
        .clone()
        .unwrap_or_else(roomcast_settings::settings_path);
    let mut settings = roomcast_settings::load_settings_from_path(&path)
        .with_context(|| format!("Failed to load settings from {}", path.display()))?;
    cli.apply(&mut settings);
    settings.validate().context("Invalid settings")?;
    Ok(settings)
}

async fn build_backend(settings: &RoomcastSettings) -> Result<Arc<dyn PubSubBackend>> {
    match settings.pubsub.backend {
        PubSubBackendKind::Local => {
            info!(
                capacity = settings.pubsub.channel_capacity,
                "using in-process pub/sub; broadcasts stay within this process"
            );
            Ok(Arc::new(LocalPubSub::new(settings.pubsub.channel_capacity)))
        }
        PubSubBackendKind::Redis => connect_redis(&settings.pubsub.redis_url).await,
    }
}

#[cfg(feature = "redis")]
async fn connect_redis(url: &str) -> Result<Arc<dyn PubSubBackend>> {
    let backend = roomcast_server::pubsub::RedisPubSub::connect(url)
        .await
        .with_context(|| format!("Failed to connect to redis at {url}"))?;
    Ok(Arc::new(backend))
}

#[cfg(not(feature = "redis"))]
#[allow(clippy::unused_async)]
async fn connect_redis(_url: &str) -> Result<Arc<dyn PubSubBackend>> {
    anyhow::bail!("the redis pub/sub backend requires building with `--features redis`")
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let settings = load_settings(&cli)?;
    init_subscriber(&settings.logging.level, settings.logging.format);

    let metrics = match roomcast_server::metrics::install_recorder() {
        Ok(handle) => Some(handle),
        Err(error) => {
            warn!(%error, "metrics recorder not installed, /metrics disabled");
            None
        }
    };

    let mut actions = ActionRegistryBuilder::new();
    register_builtin(&mut actions).context("Failed to register built-in actions")?;
    let actions = actions.build();
    info!(actions = ?actions.actions(), "actions registered");

    let backend = build_backend(&settings).await?;
    let mut server = RoomcastServer::new(ServerConfig::from(&settings), actions, backend);
    if let Some(handle) = metrics {
        server = server.with_metrics(handle);
    }

    let (addr, serve) = server
        .listen()
        .await
        .with_context(|| format!("Failed to bind {}:{}", settings.server.host, settings.server.port))?;
    info!(%addr, "roomcast ready");

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result.context("Failed to listen for Ctrl-C")?;
            info!("shutdown requested");
        }
        () = server.shutdown().token().cancelled_owned() => {}
    }

    if !server.shutdown_gracefully(DRAIN_TIMEOUT).await {
        warn!("some sessions did not close in time");
    }
    let _ = serve.await;
    info!("roomcast stopped");
    Ok(())
}

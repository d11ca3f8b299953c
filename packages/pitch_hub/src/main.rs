use anyhow::{Context, Result};
use axum::{
    Router,
    routing::{get, post},
};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::{net::SocketAddr, sync::Arc};
use tower_http::cors::CorsLayer;
use tower_http::trace::MakeSpan;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use tracing_subscriber::prelude::*;
use uuid::Uuid;

mod cli;
mod config;
mod db;
mod error;
mod handlers;
mod hub;
mod metrics;
mod repository;
#[cfg(test)]
mod test_helpers;

use crate::config::{FileConfig, HubConfig, PitchHubConfig, ServerConfig, load_config};
use crate::db::Database;
use crate::hub::actor::{HubActor, HubHandle, SpawnOptions};
use crate::hub::handler::ConnectionDeps;
use crate::hub::hibernation::HibernationAdapter;
use crate::hub::queue::OfflineMessageQueue;
use crate::hub::state::HubContext;
use crate::hub::transport::{CloseReason, TransportSockets};
use crate::metrics::HubMetrics;
use crate::repository::HubRepository;

/// Custom span maker that adds a unique request ID to each incoming request
#[derive(Clone)]
struct RequestIdMakeSpan;

impl<B> MakeSpan<B> for RequestIdMakeSpan {
    fn make_span(&mut self, request: &axum::http::Request<B>) -> tracing::Span {
        let request_id = Uuid::new_v4().to_string();
        tracing::info_span!(
            "request",
            method = %request.method(),
            uri = %request.uri(),
            request_id = %request_id,
        )
    }
}

#[derive(Parser)]
#[command(name = "pitch-hub")]
#[command(about = "Real-time notification and presence hub")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Custom data directory (defaults to ~/.pitch_hub)
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the hub server in the foreground (default)
    Serve(ServerArgs),

    /// Show connection, presence and queue stats of a running hub
    Stats(StatsArgs),

    /// Print the effective configuration as TOML
    Config,
}

#[derive(Parser, Default)]
struct ServerArgs {
    /// Port for the web server (overrides config)
    #[arg(short, long)]
    port: Option<u16>,

    /// Host to bind to (overrides config)
    #[arg(short = 'b', long)]
    host: Option<String>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

#[derive(Parser)]
struct StatsArgs {
    /// Output as JSON
    #[arg(long)]
    json: bool,

    /// Hub base URL (defaults to the configured host and port)
    #[arg(long)]
    url: Option<String>,
}

#[derive(Clone)]
pub(crate) struct AppState {
    pub hub: HubHandle,
    /// Open sockets; outlives hub hibernation
    pub transport: Arc<TransportSockets>,
    pub metrics: Arc<HubMetrics>,
    pub db: Arc<Database>,
    pub server_config: Arc<ServerConfig>,
}

impl AppState {
    pub fn connection_deps(&self) -> ConnectionDeps {
        ConnectionDeps {
            hub: self.hub.clone(),
            transport: self.transport.clone(),
            metrics: self.metrics.clone(),
            send_channel_capacity: self.server_config.send_channel_capacity,
        }
    }
}

/// Wire storage, transport and metrics together and start the hub actor.
pub(crate) fn build_app_state(
    db: Arc<Database>,
    hub_config: &HubConfig,
    server_config: ServerConfig,
) -> AppState {
    let metrics = Arc::new(HubMetrics::new());
    let transport = Arc::new(HibernationAdapter::configure_transport(hub_config));
    let queue = OfflineMessageQueue::new(
        HubRepository::new(db.pool.clone()),
        hub_config.queue_capacity,
        hub_config.default_ttl_secs,
    );

    let hub = HubActor::spawn(
        HubContext {
            queue,
            transport: transport.clone(),
            metrics: metrics.clone(),
        },
        SpawnOptions {
            inbox_capacity: hub_config.inbox_capacity,
            hibernate_when_idle: hub_config.hibernate_when_idle,
        },
    );

    AppState {
        hub,
        transport,
        metrics,
        db,
        server_config: Arc::new(server_config.with_backlog_room(hub_config.queue_capacity)),
    }
}

pub(crate) fn build_router(state: AppState) -> Router {
    Router::new()
        // Hub connections
        .route("/ws", get(handlers::hub_websocket_handler))
        // Control surface
        .route("/broadcast", post(handlers::broadcast_handler))
        .route("/send", post(handlers::send_handler))
        .route("/presence", post(handlers::presence_handler))
        .route("/stats", get(handlers::stats_handler))
        .route("/stats/storage", get(handlers::storage_stats_handler))
        // Health endpoints
        .route("/health", get(handlers::health_handler))
        .route("/health/live", get(handlers::health_live_handler))
        .route("/health/ready", get(handlers::health_ready_handler))
        .route("/metrics", get(handlers::metrics_handler))
        .layer(TraceLayer::new_for_http().make_span_with(RequestIdMakeSpan))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = PitchHubConfig::new(cli.data_dir.clone())?;

    match cli.command {
        None => run_server(ServerArgs::default(), config).await,
        Some(Commands::Serve(args)) => run_server(args, config).await,
        Some(Commands::Stats(args)) => {
            let base_url = match args.url {
                Some(url) => url,
                None => cli::hub_base_url(&file_config(&config)?.server),
            };
            cli::stats_command(&base_url, args.json).await
        }
        Some(Commands::Config) => cli::config_command(&file_config(&config)?),
    }
}

fn file_config(config: &PitchHubConfig) -> Result<FileConfig> {
    load_config(&config.data_dir).extract().with_context(|| {
        format!(
            "Invalid configuration in {}",
            config.config_toml_path().display()
        )
    })
}

async fn run_server(args: ServerArgs, config: PitchHubConfig) -> Result<()> {
    // Setup logging
    let default_directive = if args.debug {
        "pitch_hub=debug,tower_http=debug,info"
    } else {
        "pitch_hub=info,tower_http=info,warn"
    };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_directive));
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(env_filter)
        .init();

    info!("Starting pitch hub");

    // CLI flags sit above config.toml and env
    let mut settings = file_config(&config)?;
    if let Some(host) = args.host {
        settings.server.host = host;
    }
    if let Some(port) = args.port {
        settings.server.port = port;
    }
    let server_config = ServerConfig::from_file(&settings.server);
    let hub_config = HubConfig::from_file(&settings.hub);

    info!(
        "Hub config: queue_capacity={}, default_ttl={}s, max_idle={:?}, hibernate_when_idle={}",
        hub_config.queue_capacity,
        hub_config.default_ttl_secs,
        hub_config.max_idle,
        hub_config.hibernate_when_idle
    );

    // Initialize database
    info!("Initializing database...");
    let db = Arc::new(Database::new(&config).await?);

    let app_state = build_app_state(db.clone(), &hub_config, server_config.clone());
    let transport_for_shutdown = app_state.transport.clone();
    let app = build_router(app_state);

    let addr = format!("{}:{}", server_config.host, server_config.port)
        .parse::<SocketAddr>()
        .with_context(|| {
            format!(
                "Invalid listen address {}:{}",
                server_config.host, server_config.port
            )
        })?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    let actual_addr = listener.local_addr()?;

    info!("Pitch hub listening on http://{}", actual_addr);
    info!("Endpoints:");
    info!("  GET    /ws          - Hub connection (X-User-Id, X-Portal-Type)");
    info!("  POST   /broadcast   - Broadcast an event");
    info!("  POST   /send        - Send an event to one user");
    info!("  POST   /presence    - Override a user's presence");
    info!("  GET    /stats       - Hub stats");
    info!("  GET    /stats/storage - Offline queue storage stats");

    // Create shutdown signal handler
    let shutdown_signal = async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
        info!("Received shutdown signal, cleaning up...");
        info!(
            "Closing {} open connections...",
            transport_for_shutdown.len()
        );
        for socket in transport_for_shutdown.open_sockets() {
            socket.close(CloseReason::ServerShutdown);
        }
    };

    // Run server with graceful shutdown
    let server_result = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal)
    .await
    .context("Server error");

    db.pool.close().await;

    info!("Shutdown complete");
    server_result
}

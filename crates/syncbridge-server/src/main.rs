//! syncbridge server
//!
//! Runs a sync engine over in-memory source services and exposes it over
//! HTTP.
//!
//! ## Modes
//!
//! - **Hub**: owns the root catalog and accepts spokes on `/sync`
//! - **Spoke**: started with `--remote-url`, discovers the hub's root catalog
//!   and replicates every document with it

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use syncbridge::{
    Config, MemoryService, Query, QueryMatchStrategy, ServiceBacking, ServiceRegistry, StaticToken,
    Store, SyncEngine,
};
use tokio::sync::watch;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use syncbridge_server::{api, db::TokenRegistry, link::Link, AppState};

/// syncbridge server - CRDT partitions over CRUD services
#[derive(Parser, Debug)]
#[command(name = "syncbridge-server")]
#[command(version, about, long_about = None)]
struct Args {
    /// Data directory for documents and tokens
    #[arg(long, env = "SYNCBRIDGE_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// HTTP API port
    #[arg(long, default_value = "8080", env = "SYNCBRIDGE_PORT")]
    port: u16,

    /// Hub base URL; runs this node as a spoke when set
    #[arg(long, env = "SYNCBRIDGE_REMOTE_URL")]
    remote_url: Option<String>,

    /// Access token presented to the hub
    #[arg(long, env = "SYNCBRIDGE_ACCESS_TOKEN", requires = "remote_url")]
    access_token: Option<String>,

    /// Password guarding token management
    #[arg(long, env = "SYNCBRIDGE_ADMIN_PASSWORD")]
    admin_password: String,

    /// Service paths to register
    #[arg(long, value_delimiter = ',', default_value = "todos", env = "SYNCBRIDGE_SERVICES")]
    services: Vec<String>,

    /// Record id field shared by all services
    #[arg(long, default_value = "id", env = "SYNCBRIDGE_ID_FIELD")]
    id_field: String,

    /// Record field naming the owning user
    #[arg(long, env = "SYNCBRIDGE_OWNER_FIELD")]
    owner_field: Option<String>,

    /// Partition query (JSON object) a spoke asks the hub for at startup
    #[arg(long = "initial-query", env = "SYNCBRIDGE_INITIAL_QUERY")]
    initial_queries: Vec<String>,

    /// Seconds between flushes of dirty documents
    #[arg(long, default_value = "1", env = "SYNCBRIDGE_FLUSH_INTERVAL")]
    flush_interval: u64,

    /// Seconds allowed for one authentication call
    #[arg(long, default_value = "10", env = "SYNCBRIDGE_AUTH_TIMEOUT")]
    auth_timeout: u64,

    /// Log level
    #[arg(long, default_value = "info", env = "SYNCBRIDGE_LOG_LEVEL")]
    log_level: Level,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    let subscriber = FmtSubscriber::builder()
        .with_max_level(args.log_level)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .context("Failed to set tracing subscriber")?;

    let data_dir = args.data_dir.clone().unwrap_or_else(Config::default_storage_path);
    info!("Starting syncbridge server");
    info!(data_dir = %data_dir.display(), "Data directory");
    info!(port = args.port, "HTTP API port");

    tokio::fs::create_dir_all(&data_dir)
        .await
        .context("Failed to create data directory")?;

    let mut config = Config::new(&data_dir)
        .with_flush_interval(args.flush_interval)
        .with_auth_timeout(args.auth_timeout);
    if let Some(remote) = &args.remote_url {
        config = config.with_remote_url(remote);
    }

    let initial_queries = args
        .initial_queries
        .iter()
        .map(|raw| serde_json::from_str::<Query>(raw))
        .collect::<Result<Vec<_>, _>>()
        .context("Invalid --initial-query, expected a JSON object")?;

    let store = Arc::new(Store::new(&config).context("Failed to open document store")?);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let flush = store.spawn_flush_loop(config.flush_interval(), shutdown_rx.clone());

    let tokens = Arc::new(
        TokenRegistry::open(&config.tokens_db_path()).context("Failed to open token database")?,
    );
    info!(path = %config.tokens_db_path().display(), "Token database initialized");

    let mut services = ServiceRegistry::new();
    for path in &args.services {
        let backing = ServiceBacking::Local(Arc::new(MemoryService::new(&args.id_field)));
        services
            .register(path.as_str(), Arc::new(backing))
            .with_context(|| format!("Failed to register service {path}"))?;
        info!(path = %path, "Service registered");
    }

    let mut strategy = QueryMatchStrategy::new(services.clone());
    if let Some(owner) = &args.owner_field {
        strategy = strategy.with_owner_field(owner);
    }

    let link = if config.is_spoke() {
        let token = StaticToken::new(args.access_token.clone().unwrap_or_default());
        Link::spoke(
            Arc::clone(&store),
            &config,
            Arc::new(token),
            &initial_queries,
            shutdown_rx.clone(),
        )
        .await
        .context("Failed to join hub")?
    } else {
        if !initial_queries.is_empty() {
            warn!("--initial-query only applies to spokes, ignoring");
        }
        Link::hub(&store, &config)
            .await
            .context("Failed to open root catalog")?
    };

    let engine = SyncEngine::start(
        Arc::clone(&store),
        link.root().clone(),
        services,
        Arc::new(strategy),
        &config,
    )
    .await
    .context("Failed to start sync engine")?;
    info!(root = %link.root().url(), spoke = link.is_spoke(), "Sync engine started");

    let state = Arc::new(AppState::new(
        engine.clone(),
        Arc::clone(&store),
        tokens,
        args.admin_password,
        config.auth_timeout(),
        shutdown_rx,
    ));

    let api_addr: SocketAddr = ([0, 0, 0, 0], args.port).into();
    let app = api::router(state);

    info!(addr = %api_addr, "Starting HTTP API server");

    let listener = tokio::net::TcpListener::bind(api_addr)
        .await
        .context("Failed to bind API server")?;

    // Sync sockets watch the same channel, so they close with the server
    let signal_tx = shutdown_tx.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            signal_tx.send_replace(true);
        })
        .await
        .context("API server error")?;

    info!("syncbridge server shutting down");
    shutdown_tx.send_replace(true);
    engine.shutdown().await;
    link.stop().await;
    if flush.await.is_err() {
        warn!("Flush task panicked");
    }
    store.flush().await.context("Final flush failed")?;
    Ok(())
}

/// Wait for a ctrl-c signal for graceful shutdown
async fn shutdown_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Received ctrl-c, initiating graceful shutdown"),
        Err(e) => warn!(error = %e, "Failed to listen for ctrl-c, shutting down"),
    }
}

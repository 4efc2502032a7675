use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::routing::{delete, get, post};
use axum::Router as AxumRouter;
use clap::Parser;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use ucr_rust::config::{self, ConfigManager};
use ucr_rust::credentials::CredentialStore;
use ucr_rust::latency::EwmaTracker;
use ucr_rust::proxy::{self, AppState};
use ucr_rust::router::{CustomRouter, ProcessCustomRouter};
use ucr_rust::transformer::TransformerRegistry;
use ucr_rust::{cache, circuit_breaker, logging};

#[derive(Parser)]
#[command(name = "ucr-rust")]
#[command(about = "Universal chat-completion reverse proxy", long_about = None)]
struct Cli {
    /// Path to the UCR config file.
    #[arg(short, long, env = "UCR_CONFIG", default_value = "~/.ucr/config.json")]
    config: String,

    /// Server host, overriding config.server.host.
    #[arg(long, env = "UCR_HOST")]
    host: Option<String>,

    /// Server port, overriding config.server.port.
    #[arg(short, long, env = "UCR_PORT")]
    port: Option<u16>,

    /// Log level, overriding config.logging.level (RUST_LOG still wins).
    #[arg(long, env = "UCR_LOG_LEVEL")]
    log_level: Option<String>,
}

fn pid_file_path(install_dir: &Path) -> PathBuf {
    install_dir.join("ucr-server.pid")
}

fn write_pid_file(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, std::process::id().to_string())
        .with_context(|| format!("writing pid file {}", path.display()))
}

#[tokio::main]
async fn main() -> Result<()> {
    if let Err(err) = run().await {
        eprintln!("ucr-rust: {err:#}");
        std::process::exit(1);
    }
    Ok(())
}

async fn run() -> Result<()> {
    let cli = Cli::parse();
    let config_path = shellexpand::tilde(&cli.config).to_string();
    let config_path = PathBuf::from(config_path);

    let install_dir = config_path
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));

    let credential_store_path = install_dir.join("credentials.json");
    let credential_store = Arc::new(CredentialStore::load(&credential_store_path)?);

    let config = config::load(&config_path, &credential_store)?;

    let mut logging_config = config.file().logging.clone();
    if let Some(level) = &cli.log_level {
        logging_config.level = level.clone();
    }
    logging::init(&logging_config)?;

    tracing::info!(path = %config_path.display(), "loaded config");

    let host = cli.host.unwrap_or_else(|| config.server().host.clone());
    let port = cli.port.unwrap_or(config.server().port);

    let config_manager = ConfigManager::new(config.clone(), config_path.clone());
    let _watcher = config_manager
        .watch(credential_store.clone())
        .context("starting config file watcher")?;

    write_pid_file(&pid_file_path(&install_dir))?;

    let custom_router: Option<Arc<dyn CustomRouter>> = config
        .router()
        .custom_router
        .as_ref()
        .map(|cmd| Arc::new(ProcessCustomRouter::new(cmd.clone())) as Arc<dyn CustomRouter>);

    let response_cache = Arc::new(cache::ResponseCache::new());
    let tiered_cache = Arc::new(cache::TieredCache::new());
    tokio::spawn(cache::run_memory_watchdog(response_cache.clone(), tiered_cache.clone()));

    let stream_semaphore = proxy::build_stream_semaphore(config.server().max_concurrent_streams);

    let state = AppState {
        config_manager,
        credential_store,
        transformers: Arc::new(TransformerRegistry::with_builtins()),
        circuit_breaker: Arc::new(circuit_breaker::CircuitBreaker::new()),
        latency: Arc::new(EwmaTracker::new()),
        response_cache,
        tiered_cache,
        custom_router,
        stream_semaphore,
    };

    ucr_rust::metrics::init();

    let mut app = AxumRouter::new()
        .route("/v1/messages", post(proxy::handle_messages))
        .route("/v1/providers", get(proxy::providers_handler))
        .route("/v1/config", get(proxy::config_handler))
        .route("/v1/usage", get(ucr_rust::metrics::usage_handler))
        .route("/health", get(proxy::health_handler))
        .route("/metrics", get(ucr_rust::metrics::metrics_handler))
        .route("/debug/metrics", get(proxy::debug_metrics_handler))
        .route("/cache/stats", get(proxy::cache_stats_handler))
        .route("/cache", delete(proxy::cache_flush_handler))
        .with_state(state);

    if config.server().cors {
        app = app.layer(CorsLayer::permissive());
    }
    if config.file().logging.requests {
        app = app.layer(TraceLayer::new_for_http());
    }

    let addr = SocketAddr::from((host.parse::<std::net::IpAddr>()?, port));
    tracing::info!(%addr, "ucr-rust listening");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    let _ = std::fs::remove_file(pid_file_path(&install_dir));
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    tracing::info!("shutdown signal received, draining in-flight requests");
}

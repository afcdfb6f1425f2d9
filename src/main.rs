use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use windowguard::config::{LogFormat, LoggingConfig, StoreBackend, WindowGuardConfig};
use windowguard::http::HttpServer;
use windowguard::metrics::PrometheusRecorder;
use windowguard::ratelimit::{
    Clock, MemoryWindowStore, RedisWindowStore, SystemClock, WindowLimiter, WindowStore,
};

/// Sliding-window rate limiting in front of a simple HTTP endpoint.
#[derive(Parser, Debug)]
#[command(name = "windowguard", version)]
struct Args {
    /// Configuration file (YAML or TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// HTTP listen address
    #[arg(long)]
    http_addr: Option<SocketAddr>,

    /// Store backend
    #[arg(long, value_parser = parse_backend)]
    backend: Option<StoreBackend>,

    /// Maximum admissions per window
    #[arg(long)]
    limit: Option<u64>,

    /// Window length in milliseconds
    #[arg(long)]
    window_ms: Option<u64>,
}

fn parse_backend(value: &str) -> Result<StoreBackend, String> {
    match value {
        "redis" => Ok(StoreBackend::Redis),
        "memory" => Ok(StoreBackend::Memory),
        other => Err(format!("unknown backend '{}', expected redis or memory", other)),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = load_config(&args)?;

    init_tracing(&config.logging);

    info!("Starting Windowguard Rate Limiting Service");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));
    info!(
        http_addr = %config.server.http_addr,
        backend = ?config.store.backend,
        limit = config.rate_limiting.limit,
        window_ms = config.rate_limiting.window_ms,
        failure_policy = ?config.rate_limiting.failure_policy,
        "Configuration loaded"
    );

    // Connect the store and make sure it answers before taking traffic
    let (store, sweeper): (Arc<dyn WindowStore>, _) = match config.store.backend {
        StoreBackend::Redis => {
            let store = RedisWindowStore::connect(&config.store.url)
                .await
                .with_context(|| format!("could not connect to Redis at {}", config.store.url))?;
            (Arc::new(store) as Arc<dyn WindowStore>, None)
        }
        StoreBackend::Memory => {
            let store = Arc::new(MemoryWindowStore::new());
            let sweeper = spawn_sweeper(store.clone(), config.rate_limiting.policy().window());
            (store as Arc<dyn WindowStore>, Some(sweeper))
        }
    };
    store.ping().await.context("window store did not answer ping")?;
    info!("Window store reachable");

    let mut limiter = WindowLimiter::new(store.clone(), config.rate_limiting.policy())
        .with_failure_policy(config.rate_limiting.failure_policy);
    if let Some(timeout) = config.store.timeout() {
        limiter = limiter.with_store_timeout(timeout);
    }
    let limiter = Arc::new(limiter);
    info!("Rate limiter initialized");

    let recorder = Arc::new(PrometheusRecorder::new()?);
    let server = HttpServer::new(
        config.server.http_addr,
        limiter,
        recorder,
        config.rate_limiting.key_prefix.clone(),
    );
    let handle = server.start().await?;
    info!(addr = %handle.local_addr(), "Serving");

    shutdown_signal().await;

    // Stop accepting, drain for a bounded time, then release the store
    if let Err(e) = handle.shutdown(config.server.shutdown_grace_period()).await {
        error!(error = %e, "Server forced to shut down");
    }
    if let Some(sweeper) = sweeper {
        sweeper.abort();
    }
    if let Err(e) = store.close().await {
        error!(error = %e, "Error closing window store");
    }

    info!("Windowguard Rate Limiting Service stopped");
    Ok(())
}

fn load_config(args: &Args) -> anyhow::Result<WindowGuardConfig> {
    let mut config =
        WindowGuardConfig::load(args.config.as_deref()).context("failed to load configuration")?;

    if let Some(addr) = args.http_addr {
        config.server.http_addr = addr;
    }
    if let Some(backend) = args.backend {
        config.store.backend = backend;
    }
    if let Some(limit) = args.limit {
        config.rate_limiting.limit = limit;
    }
    if let Some(window_ms) = args.window_ms {
        config.rate_limiting.window_ms = window_ms;
    }

    config.validate().context("invalid configuration")?;
    Ok(config)
}

fn init_tracing(logging: &LoggingConfig) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true);

    match logging.format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Text => builder.init(),
    }
}

/// Periodically drop idle histories from the in-memory store.
fn spawn_sweeper(store: Arc<MemoryWindowStore>, window: Duration) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(window.max(Duration::from_secs(1)));
        loop {
            interval.tick().await;
            store.sweep_expired(SystemClock.now_millis());
        }
    })
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}

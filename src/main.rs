use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use tollgate::config::{CliArgs, LogFormat, LoggingConfig, StoreBackend, TollgateConfig};
use tollgate::error::TollgateError;
use tollgate::http::{AppState, HttpServer};
use tollgate::ratelimit::{SystemClock, TokenBucketLimiter};
use tollgate::store::{BucketStore, MemoryStore, RedisStore};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = CliArgs::parse();
    let config = TollgateConfig::load(&args)?;

    init_tracing(&config.logging);

    info!("Starting Tollgate admission control service");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));
    info!(
        instance_id = %config.server.instance_id,
        listen_addr = %config.server.listen_addr,
        failure_mode = ?config.limiter.failure_mode,
        "Configuration loaded"
    );

    let store = build_store(&config).await?;
    info!(backend = store.backend(), "Bucket store initialized");

    let limiter = Arc::new(TokenBucketLimiter::with_settings(
        store,
        Arc::new(SystemClock),
        config.limiter.settings(),
    ));
    let state = Arc::new(AppState::from_config(&config, limiter)?);

    HttpServer::new(config.server.listen_addr, state)
        .serve_with_shutdown(shutdown_signal())
        .await?;

    info!("Tollgate stopped");
    Ok(())
}

/// Initialize tracing; `RUST_LOG` takes precedence over the configured level.
fn init_tracing(logging: &LoggingConfig) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.level));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true);

    match logging.format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

async fn build_store(config: &TollgateConfig) -> anyhow::Result<Arc<dyn BucketStore>> {
    match config.store.backend {
        StoreBackend::Memory => {
            let store = MemoryStore::new();
            store.spawn_sweeper(Duration::from_secs(config.store.sweep_interval_secs));
            Ok(Arc::new(store))
        }
        StoreBackend::Redis => {
            let url = config.store.redis_url.as_deref().ok_or_else(|| {
                TollgateError::Configuration("store.redis_url is not set".to_string())
            })?;
            Ok(Arc::new(RedisStore::connect(url).await?))
        }
    }
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
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

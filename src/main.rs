use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio::signal;
use tracing::info;

use talktime_ratelimit::config::{BackendKind, LogFormat, TalkTimeConfig};
use talktime_ratelimit::http::HttpServer;
use talktime_ratelimit::mesh::{Cluster, ClusterConfig};
use talktime_ratelimit::ratelimit::{
    DistributedRateLimiter, LimitConfig, RateLimitStore, RateLimiter, RateLimiterBackend, RedisStore,
    RedisStoreConfig, Sweeper,
};
use talktime_ratelimit::telemetry;

/// Sliding-log rate limiting service for TalkTime.
#[derive(Parser, Debug)]
#[command(name = "talktime-ratelimit", version)]
struct Args {
    /// YAML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the HTTP listen address
    #[arg(long)]
    http_addr: Option<SocketAddr>,

    /// Override the log output format
    #[arg(long, value_enum)]
    log_format: Option<LogFormat>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = TalkTimeConfig::load(args.config.as_deref())?;
    if let Some(addr) = args.http_addr {
        config.server.http_addr = addr;
    }
    if let Some(format) = args.log_format {
        config.logging.format = format;
    }

    telemetry::init_tracing(&config.logging)?;

    info!("Starting TalkTime rate limit service");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let limits = config.rate_limiting.limit_config()?;
    info!(
        http_addr = %config.server.http_addr,
        window_ms = limits.window_ms(),
        max_requests = limits.max_requests(),
        backend = ?config.backend.kind,
        "Configuration loaded"
    );

    match config.backend.kind {
        BackendKind::Memory => {
            let rate_limiter = Arc::new(RateLimiter::new(limits));
            info!("In-memory rate limiter initialized");
            run(&config, rate_limiter).await?;
        }
        BackendKind::Redis => {
            let store = Arc::new(RedisStore::new(RedisStoreConfig::from(&config.backend.redis))?);
            run(&config, distributed(&config, store, limits)).await?;
        }
        BackendKind::Cluster => {
            let cluster = Arc::new(Cluster::start(ClusterConfig::from(&config.backend.cluster)).await?);
            run(&config, distributed(&config, Arc::clone(&cluster), limits)).await?;
            if let Ok(cluster) = Arc::try_unwrap(cluster) {
                cluster.shutdown().await?;
            }
        }
    }

    info!("TalkTime rate limit service stopped");
    Ok(())
}

fn distributed<S: RateLimitStore + 'static>(
    config: &TalkTimeConfig,
    store: Arc<S>,
    limits: LimitConfig,
) -> Arc<DistributedRateLimiter<S>> {
    info!(
        store = store.name(),
        failure_policy = ?config.backend.failure_policy,
        store_timeout_ms = config.backend.store_timeout_ms,
        "Distributed rate limiter initialized"
    );
    Arc::new(
        DistributedRateLimiter::new(store, limits)
            .with_store_timeout(config.backend.store_timeout())
            .with_failure_policy(config.backend.failure_policy),
    )
}

/// Serve HTTP and sweep until a shutdown signal arrives.
async fn run<R: RateLimiterBackend + 'static>(
    config: &TalkTimeConfig,
    rate_limiter: Arc<R>,
) -> anyhow::Result<()> {
    let sweeper = Sweeper::spawn(
        Arc::clone(&rate_limiter),
        config.rate_limiting.sweep_interval()?,
    );

    let server = HttpServer::new(config.server.http_addr, rate_limiter);
    let served = server.serve_with_shutdown(shutdown_signal()).await;

    sweeper.shutdown().await;
    served?;
    Ok(())
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

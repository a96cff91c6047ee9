//! Reliable Queue Sweeper Service
//!
//! Periodically scans the staging list of one queue and pushes messages
//! whose reservation expired back onto the queue.
//!
//! ```text
//! <queue>:ack  (expiry|payload entries)
//!   ↓ every RQ_SWEEP_INTERVAL_SECS, windows of RQ_SWEEP_BATCH_SIZE
//! Sweeper
//!   ↓ expired → LREM entry, then RPUSH/LPUSH payload (one script)
//!   ↓ malformed → LREM entry
//! <queue>
//! ```
//!
//! One sweeper per queue is enough. Overlapping passes, such as a manual
//! `POST /admin/sweep`, never restore the same entry twice.

use axum::Router;
use core_config::{
    Environment, FromEnv, app_info, redis::RedisConfig, server::ServerConfig,
};
use eyre::{Result, WrapErr};
use reliable_queue::{HealthState, QueueConfig, ReliableQueue, health_router, metrics};
use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::watch;
use tower_http::trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer};
use tracing::{Level, error, info};

/// Serve health, queue info, metrics and admin endpoints
async fn start_health_server(health_state: HealthState, server: ServerConfig) -> Result<()> {
    let app: Router = health_router(health_state).layer(
        TraceLayer::new_for_http()
            .make_span_with(DefaultMakeSpan::new().level(Level::DEBUG))
            .on_response(DefaultOnResponse::new().level(Level::DEBUG)),
    );

    let addr = server.address();
    let listener = TcpListener::bind(&addr)
        .await
        .wrap_err_with(|| format!("Failed to bind health server to {}", addr))?;

    info!(address = %addr, "Health server listening");

    axum::serve(listener, app)
        .await
        .wrap_err("Health server failed")?;

    Ok(())
}

/// Run the sweeper until SIGINT or SIGTERM.
///
/// # Errors
///
/// Returns an error if configuration is missing or invalid, or if Redis
/// cannot be reached at startup.
pub async fn run() -> Result<()> {
    let environment = Environment::from_env();
    core_config::tracing::init_tracing(&environment);
    metrics::init_metrics();

    let app_info = app_info!();
    info!(name = %app_info.name, version = %app_info.version, ?environment, "Starting sweeper service");

    let redis_config = RedisConfig::from_env().wrap_err("Failed to load Redis configuration")?;
    let queue_config = QueueConfig::from_env().wrap_err("Failed to load queue configuration")?;
    let server_config = ServerConfig::from_env().wrap_err("Failed to load health server configuration")?;

    info!("Connecting to Redis...");
    let redis = reliable_queue::connect(&redis_config.url)
        .await
        .wrap_err("Failed to connect to Redis")?;
    info!("Connected to Redis successfully");

    let queue = ReliableQueue::redis(redis, queue_config).wrap_err("Invalid queue configuration")?;
    info!(
        queue = %queue.name(),
        ack_key = %queue.ack_key(),
        message_timeout_secs = queue.config().message_timeout_secs(),
        "Queue configuration loaded"
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    tokio::spawn(async move {
        if let Err(e) = shutdown_signal().await {
            error!("Error waiting for shutdown signal: {}", e);
        }
        let _ = shutdown_tx.send(true);
    });

    let health_state = HealthState::new(queue.clone(), app_info.name, app_info.version);
    tokio::spawn(async move {
        if let Err(e) = start_health_server(health_state, server_config).await {
            error!(error = %e, "Health server failed");
        }
    });

    queue
        .sweeper()
        .run(shutdown_rx)
        .await
        .wrap_err("Sweeper failed")?;

    info!("Sweeper service stopped");
    Ok(())
}

/// Wait for a shutdown signal (SIGINT or SIGTERM)
async fn shutdown_signal() -> Result<()> {
    #[cfg(unix)]
    {
        let mut terminate = signal::unix::signal(signal::unix::SignalKind::terminate())
            .wrap_err("Failed to install SIGTERM handler")?;

        tokio::select! {
            result = signal::ctrl_c() => {
                result.wrap_err("Failed to listen for Ctrl+C")?;
                info!("Received Ctrl+C, initiating shutdown...");
            },
            _ = terminate.recv() => {
                info!("Received SIGTERM, initiating shutdown...");
            },
        }
    }

    #[cfg(not(unix))]
    {
        signal::ctrl_c()
            .await
            .wrap_err("Failed to listen for Ctrl+C")?;
        info!("Received Ctrl+C, initiating shutdown...");
    }

    Ok(())
}

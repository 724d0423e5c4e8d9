//! huddle server entry point.

mod api;

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use huddle_common::Config;
use huddle_queue::{
    DelayedQueue, DispatcherConfig, HttpServiceClient, InstantQueue, RedisStore, RetryConfig,
    RoutingSink, Sink,
};
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::api::{AppState, router};

/// Waits for a shutdown signal (SIGINT or SIGTERM).
///
/// On Unix systems, this listens for both SIGINT (Ctrl+C) and SIGTERM.
/// On Windows, this only listens for Ctrl+C.
#[allow(clippy::expect_used)]
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            info!("Received SIGINT, initiating graceful shutdown...");
        },
        () = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown...");
        },
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "huddle=debug,tower_http=debug".into()),
        )
        .init();

    info!("Starting huddle server...");

    let config = Config::load().context("Failed to load configuration")?;

    info!("Connecting to Redis...");
    let redis = Arc::new(
        RedisStore::connect(&config.redis)
            .await
            .context("Failed to connect to Redis")?,
    );

    let services = Arc::new(
        HttpServiceClient::from_config(&config.services)
            .context("Failed to build service clients")?,
    );
    info!(count = services.len(), "Registered downstream services");

    let sink: Arc<dyn Sink> = Arc::new(RoutingSink::new(services.clone()));
    let dispatcher_config = DispatcherConfig::from(&config.queue);
    let backoff = Arc::new(RetryConfig::from(&config.queue.retry));
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // One dispatcher per delayed queue
    let mut queues = HashMap::new();
    let mut dispatchers = Vec::new();
    for (name, delay_secs) in &config.queue.heads {
        let queue = DelayedQueue::head(name.clone(), *delay_secs, redis.clone());
        let dispatcher = queue
            .dispatcher(sink.clone(), dispatcher_config)
            .with_backoff(backoff.clone());
        dispatchers.push(tokio::spawn(dispatcher.run(shutdown_rx.clone())));
        info!(queue = %name, delay_secs, "Started dispatcher");
        queues.insert(name.clone(), queue);
    }

    let state = AppState::new(redis.clone(), queues, InstantQueue::new(services));
    let app = router(state);

    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port)
        .parse()
        .context("Invalid server address")?;
    info!("Listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Let in-flight drains finish
    info!("Stopping dispatchers...");
    let _ = shutdown_tx.send(true);
    for handle in dispatchers {
        if let Err(e) = handle.await {
            error!(error = %e, "Dispatcher task failed");
        }
    }

    if let Err(e) = redis.quit().await {
        error!(error = %e, "Failed to close Redis connections");
    }

    info!("Server shutdown complete");
    Ok(())
}

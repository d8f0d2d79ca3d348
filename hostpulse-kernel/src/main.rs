/**
 * HOSTPULSE KERNEL - entry point
 *
 * Loads config, opens the metric store, starts the ingest consumer and the
 * query API, and shuts everything down on Ctrl-C.
 */

use anyhow::Context;
use hostpulse_bus::amqp::redact;
use hostpulse_kernel::config::load_config;
use hostpulse_kernel::health::HealthTracker;
use hostpulse_kernel::http::{build_router, AppState};
use hostpulse_kernel::ingest::{build_consumer, spawn_ingest};
use hostpulse_kernel::store::MetricStore;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // .env is optional
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,hostpulse=info")),
        )
        .init();

    let cfg = load_config().await;
    info!(
        broker = %redact(&cfg.broker.url),
        queue = %cfg.broker.queue,
        db = %cfg.store.path,
        "HostPulse kernel starting"
    );

    let store = MetricStore::connect(&cfg.store.path, cfg.store.max_connections)
        .await
        .context("failed to open metric store")?;

    let cancel = CancellationToken::new();
    let mut health_tracker = HealthTracker::new();

    let ingest = if cfg.ingest.enabled {
        let consumer = Arc::new(build_consumer(&cfg.broker, store.clone()));
        health_tracker = health_tracker.with_ingest(consumer.clone());
        Some(spawn_ingest(consumer, cancel.clone()))
    } else {
        info!("ingest disabled");
        None
    };

    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => info!("shutdown requested"),
                Err(e) => error!("cannot listen for shutdown signal: {}", e),
            }
            cancel.cancel();
        });
    }

    if cfg.api.enabled {
        let app = build_router(AppState::new(
            store.clone(),
            health_tracker,
            cfg.api.api_key.clone(),
        ));
        let listener = TcpListener::bind(&cfg.api.listen)
            .await
            .with_context(|| format!("failed to bind {}", cfg.api.listen))?;
        info!("listening on http://{}", cfg.api.listen);

        let shutdown = cancel.clone();
        axum::serve(listener, app)
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await
            .context("HTTP server failed")?;
    } else {
        cancel.cancelled().await;
    }

    if let Some(task) = ingest {
        task.await.context("ingest task panicked")?;
    }
    store.close().await;
    info!("HostPulse kernel stopped");
    Ok(())
}

//! HostPulse Agent - samples the local host and publishes metric messages
//!
//! Every interval the agent:
//! - collects a snapshot (CPU, RAM, disks, network interfaces)
//! - publishes it as JSON to the durable `metrics` queue
//!
//! The AMQP link is kept alive by the publisher run-loop. Samples taken while
//! the broker is unreachable are logged and dropped.

mod config;
mod metrics;

use anyhow::{Context, Result};
use config::AgentConfig;
use hostpulse_bus::{AmqpTransport, Publisher, Transport};
use metrics::{SnapshotSource, SystemCollector};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Main agent state
struct Agent<T: Transport> {
    publisher: Arc<Publisher<T>>,
    source: Box<dyn SnapshotSource>,
    interval: Duration,
    published: u64,
}

impl Agent<AmqpTransport> {
    fn from_config(config: &AgentConfig) -> Self {
        let publisher = Publisher::new(AmqpTransport::new(config.broker.url.clone()))
            .with_queue(config.broker.queue.clone())
            .with_retry_delay(config.retry_delay());
        Self::new(publisher, Box::new(SystemCollector::new()), config.interval())
    }
}

impl<T: Transport> Agent<T> {
    fn new(publisher: Publisher<T>, source: Box<dyn SnapshotSource>, interval: Duration) -> Self {
        Self {
            publisher: Arc::new(publisher),
            source,
            interval,
            published: 0,
        }
    }

    /// Sample and publish until `cancel` fires, then close the link
    async fn run(&mut self, cancel: CancellationToken) -> Result<()> {
        let link = {
            let publisher = Arc::clone(&self.publisher);
            let cancel = cancel.clone();
            tokio::spawn(async move { publisher.run(cancel).await })
        };

        let mut ticker = interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!(
            queue = %self.publisher.queue(),
            interval_secs = self.interval.as_secs(),
            "Agent started"
        );

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => self.tick().await,
            }
        }

        link.await.context("Publisher task panicked")?;
        info!(published = self.published, "Agent stopped");
        Ok(())
    }

    /// One collect-and-send cycle
    async fn tick(&mut self) {
        let Some(message) = self.source.snapshot() else {
            return;
        };

        match self.publisher.publish(&message).await {
            Ok(()) => {
                self.published += 1;
                debug!(hostname = %message.hostname(), "Published snapshot");
            }
            Err(e) => warn!("Failed to publish snapshot: {}", e),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,hostpulse=info".into()),
        )
        .init();

    let config = AgentConfig::load()
        .await
        .context("Failed to load agent configuration")?;

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("Failed to listen for Ctrl-C: {}", e);
                return;
            }
            info!("Shutdown requested");
            cancel.cancel();
        });
    }

    let mut agent = Agent::from_config(&config);
    agent.run(cancel).await
}

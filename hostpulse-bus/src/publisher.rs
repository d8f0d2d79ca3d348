//! Resilient metric publisher
//!
//! The publisher owns one broker session at a time. [`Publisher::run`] keeps
//! it alive: connect, wait for a close notification, back off, reconnect.
//! [`Publisher::publish`] never reconnects on its own; without a live session
//! it fails fast and the caller decides what to do with the sample.

use crate::link::{backoff, Link, LinkState};
use crate::models::MetricMessage;
use crate::transport::{Session, Transport};
use crate::{Result, METRICS_QUEUE};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Wait between reconnect attempts
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(5);

pub struct Publisher<T: Transport> {
    link: Link<T>,
    retry_delay: Duration,
}

impl<T: Transport> Publisher<T> {
    pub fn new(transport: T) -> Self {
        Self {
            link: Link::new(transport, METRICS_QUEUE.to_string()),
            retry_delay: DEFAULT_RETRY_DELAY,
        }
    }

    #[must_use]
    pub fn with_queue(mut self, queue: impl Into<String>) -> Self {
        self.link.set_queue(queue.into());
        self
    }

    #[must_use]
    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    pub fn queue(&self) -> &str {
        self.link.queue()
    }

    pub fn state(&self) -> LinkState {
        self.link.state()
    }

    pub fn reconnects(&self) -> u64 {
        self.link.reconnects()
    }

    /// Open a session and declare the queue, unless already connected
    pub async fn connect(&self) -> Result<()> {
        self.link.connect().await.map(|_| ())
    }

    /// Validate, encode and publish one sample as a persistent message
    pub async fn publish(&self, message: &MetricMessage) -> Result<()> {
        message.validate()?;
        let body = serde_json::to_vec(message)?;

        let guard = self.link.session().await;
        let session = Link::<T>::live(&guard, "publisher has no live session")?;
        session.publish(self.link.queue(), body).await?;

        debug!(hostname = %message.hostname(), queue = %self.link.queue(), "metric published");
        Ok(())
    }

    /// Keep the session alive until `cancel` fires, then close it
    pub async fn run(&self, cancel: CancellationToken) {
        info!(queue = %self.link.queue(), "publisher started");

        while !cancel.is_cancelled() {
            match self.link.connect().await {
                Ok(closed) => {
                    info!(queue = %self.link.queue(), "publisher connected");
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        reason = closed.wait() => {
                            warn!(%reason, "publisher connection closed");
                            self.link.drop_session().await;
                        }
                    }
                }
                Err(e) => warn!("publisher connect failed: {}", e),
            }

            if !backoff(&cancel, self.retry_delay).await {
                break;
            }
        }

        if let Err(e) = self.close().await {
            warn!("publisher close failed: {}", e);
        }
        info!("publisher stopped");
    }

    /// Release channel and connection. Safe to call more than once.
    pub async fn close(&self) -> Result<()> {
        self.link.close().await
    }
}

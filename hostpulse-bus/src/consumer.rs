//! Manual-ack metric consumer
//!
//! Every delivery is settled exactly once:
//!
//! | Outcome                          | Settlement            |
//! |----------------------------------|-----------------------|
//! | body is not a valid message      | nack, no requeue      |
//! | sink failed, retryable           | nack, requeue + pause |
//! | sink rejected the message        | nack, no requeue      |
//! | sink saved the message           | ack                   |
//!
//! The ack is sent only after the sink returns, so a crash between commit and
//! ack leads to redelivery rather than loss.

use crate::link::{backoff, Link, LinkState};
use crate::models::MetricMessage;
use crate::transport::{Delivery, Session, Transport};
use crate::{Result, METRICS_QUEUE};
use async_trait::async_trait;
use futures::StreamExt;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(5);
/// Pause after a requeue so a store outage does not turn into a hot loop
pub const DEFAULT_REQUEUE_DELAY: Duration = Duration::from_secs(1);
pub const DEFAULT_CONSUMER_TAG: &str = "hostpulse-kernel";

/// Failure reported by a [`MetricSink`]
#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    /// Retryable, the message goes back on the queue
    #[error("transient sink failure: {0}")]
    Transient(String),
    /// Not retryable, the message is dropped
    #[error("message rejected: {0}")]
    Rejected(String),
}

/// Destination for consumed messages
#[async_trait]
pub trait MetricSink: Send + Sync + 'static {
    /// Persist one message. Must return only after the write is durable.
    async fn save(&self, message: &MetricMessage) -> std::result::Result<(), SinkError>;
}

/// How a delivery was settled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Ack,
    Requeue,
    Drop,
}

/// Why [`Consumer::consume`] returned
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamEnd {
    Cancelled,
    Closed,
}

/// Settlement counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ConsumerStats {
    pub acked: u64,
    pub requeued: u64,
    pub dropped: u64,
}

#[derive(Default)]
struct Counters {
    acked: AtomicU64,
    requeued: AtomicU64,
    dropped: AtomicU64,
}

/// Decode and store one body, deciding how the delivery must be settled
pub async fn settle<S: MetricSink + ?Sized>(sink: &S, body: &[u8]) -> Disposition {
    let message: MetricMessage = match serde_json::from_slice(body) {
        Ok(message) => message,
        Err(e) => {
            warn!(outcome = "drop", "undecodable message: {}", e);
            return Disposition::Drop;
        }
    };

    if let Err(e) = message.validate() {
        warn!(hostname = %message.hostname(), outcome = "drop", "invalid message: {}", e);
        return Disposition::Drop;
    }

    match sink.save(&message).await {
        Ok(()) => {
            debug!(hostname = %message.hostname(), outcome = "ack", "metric stored");
            Disposition::Ack
        }
        Err(SinkError::Transient(reason)) => {
            warn!(
                hostname = %message.hostname(),
                outcome = "requeue",
                %reason,
                "store unavailable"
            );
            Disposition::Requeue
        }
        Err(SinkError::Rejected(reason)) => {
            warn!(
                hostname = %message.hostname(),
                outcome = "drop",
                %reason,
                "store rejected message"
            );
            Disposition::Drop
        }
    }
}

pub struct Consumer<T: Transport, S: MetricSink> {
    link: Link<T>,
    sink: S,
    tag: String,
    retry_delay: Duration,
    requeue_delay: Duration,
    counters: Counters,
}

impl<T: Transport, S: MetricSink> Consumer<T, S> {
    pub fn new(transport: T, sink: S) -> Self {
        Self {
            link: Link::new(transport, METRICS_QUEUE.to_string()),
            sink,
            tag: DEFAULT_CONSUMER_TAG.to_string(),
            retry_delay: DEFAULT_RETRY_DELAY,
            requeue_delay: DEFAULT_REQUEUE_DELAY,
            counters: Counters::default(),
        }
    }

    #[must_use]
    pub fn with_queue(mut self, queue: impl Into<String>) -> Self {
        self.link.set_queue(queue.into());
        self
    }

    #[must_use]
    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tag = tag.into();
        self
    }

    #[must_use]
    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    #[must_use]
    pub fn with_requeue_delay(mut self, delay: Duration) -> Self {
        self.requeue_delay = delay;
        self
    }

    pub fn state(&self) -> LinkState {
        self.link.state()
    }

    pub fn reconnects(&self) -> u64 {
        self.link.reconnects()
    }

    pub fn stats(&self) -> ConsumerStats {
        ConsumerStats {
            acked: self.counters.acked.load(Ordering::Relaxed),
            requeued: self.counters.requeued.load(Ordering::Relaxed),
            dropped: self.counters.dropped.load(Ordering::Relaxed),
        }
    }

    /// Consume until cancelled or until the broker ends the stream.
    ///
    /// A delivery that has been received is always settled before this
    /// returns, even when `cancel` fires while it is being stored.
    pub async fn consume(&self, cancel: &CancellationToken) -> Result<StreamEnd> {
        self.link.connect().await?;
        let mut deliveries = {
            let guard = self.link.session().await;
            let session = Link::<T>::live(&guard, "consumer has no live session")?;
            session.consume(self.link.queue(), &self.tag).await?
        };
        info!(queue = %self.link.queue(), tag = %self.tag, "consuming");

        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(StreamEnd::Cancelled),
                next = deliveries.next() => next,
            };

            let delivery = match next {
                Some(delivery) => delivery?,
                None => return Ok(StreamEnd::Closed),
            };

            let disposition = settle(&self.sink, delivery.body()).await;
            match disposition {
                Disposition::Ack => {
                    delivery.ack().await?;
                    self.counters.acked.fetch_add(1, Ordering::Relaxed);
                }
                Disposition::Requeue => {
                    delivery.nack(true).await?;
                    self.counters.requeued.fetch_add(1, Ordering::Relaxed);
                    if !backoff(cancel, self.requeue_delay).await {
                        return Ok(StreamEnd::Cancelled);
                    }
                }
                Disposition::Drop => {
                    delivery.nack(false).await?;
                    self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
    }

    /// Consume with reconnects until `cancel` fires, then close the session
    pub async fn run(&self, cancel: CancellationToken) {
        info!(queue = %self.link.queue(), "consumer started");

        while !cancel.is_cancelled() {
            match self.consume(&cancel).await {
                Ok(StreamEnd::Cancelled) => break,
                Ok(StreamEnd::Closed) => warn!("delivery stream closed by broker"),
                Err(e) => warn!("consumer failed: {}", e),
            }
            self.link.drop_session().await;

            if !backoff(&cancel, self.retry_delay).await {
                break;
            }
        }

        if let Err(e) = self.close().await {
            warn!("consumer close failed: {}", e);
        }
        info!(stats = ?self.stats(), "consumer stopped");
    }

    pub async fn close(&self) -> Result<()> {
        self.link.close().await
    }
}

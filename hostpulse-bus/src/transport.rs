//! Broker seam used by the publisher and consumer
//!
//! A [`Transport`] opens [`Session`]s (one connection + one channel). The AMQP
//! implementation lives in [`crate::amqp`]; tests plug an in-memory broker in
//! through the same traits.

use crate::Result;
use async_trait::async_trait;
use futures::stream::BoxStream;
use std::sync::Arc;
use tokio::sync::watch;

/// Stream of deliveries from a manual-ack consumer
pub type Deliveries<D> = BoxStream<'static, Result<D>>;

/// Opens sessions to the broker
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    type Session: Session;

    /// Establish a connection and a channel
    async fn open(&self) -> Result<Self::Session>;
}

/// A live connection + channel pair
#[async_trait]
pub trait Session: Send + Sync + 'static {
    type Delivery: Delivery;

    fn is_open(&self) -> bool;

    /// Declare a durable queue, idempotent
    async fn declare_queue(&self, queue: &str) -> Result<()>;

    /// Publish a persistent JSON message on the default exchange
    async fn publish(&self, queue: &str, body: Vec<u8>) -> Result<()>;

    /// Open a manual-ack delivery stream, one unacknowledged message at a time
    async fn consume(&self, queue: &str, tag: &str) -> Result<Deliveries<Self::Delivery>>;

    /// Resolves once the broker closes this session
    fn closed(&self) -> CloseSignal;

    async fn close(&self) -> Result<()>;
}

/// A message awaiting settlement
#[async_trait]
pub trait Delivery: Send + Sync + 'static {
    fn body(&self) -> &[u8];

    async fn ack(&self) -> Result<()>;

    async fn nack(&self, requeue: bool) -> Result<()>;
}

/// Sending half of a close notification
#[derive(Clone, Debug)]
pub struct CloseNotifier(Arc<watch::Sender<Option<String>>>);

/// Receiving half of a close notification
#[derive(Clone, Debug)]
pub struct CloseSignal(watch::Receiver<Option<String>>);

/// Create a linked notifier/signal pair
#[must_use]
pub fn close_signal() -> (CloseNotifier, CloseSignal) {
    let (tx, rx) = watch::channel(None);
    (CloseNotifier(Arc::new(tx)), CloseSignal(rx))
}

impl CloseNotifier {
    /// Record the close reason. Only the first reason is kept.
    pub fn notify(&self, reason: impl Into<String>) {
        let reason = reason.into();
        self.0.send_if_modified(|current| {
            if current.is_none() {
                *current = Some(reason);
                true
            } else {
                false
            }
        });
    }
}

impl CloseSignal {
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.0.borrow().is_some()
    }

    /// Wait for the close reason
    pub async fn wait(mut self) -> String {
        match self.0.wait_for(Option::is_some).await {
            Ok(reason) => reason.clone().unwrap_or_default(),
            Err(_) => "close notifier dropped".to_string(),
        }
    }
}

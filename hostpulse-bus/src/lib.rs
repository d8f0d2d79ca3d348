//! HostPulse message bus
//!
//! Shared pieces of the telemetry pipeline:
//! - [`models`]: the `MetricMessage` carried on the queue, with validation
//! - [`transport`]: broker seam ([`Transport`], [`Session`], [`Delivery`])
//! - [`amqp`]: RabbitMQ implementation of the seam
//! - [`Publisher`]: reconnecting producer used by agents
//! - [`Consumer`]: manual-ack consumer feeding a [`MetricSink`]

pub mod amqp;
pub mod consumer;
mod error;
mod link;
pub mod models;
pub mod publisher;
pub mod transport;

pub use amqp::AmqpTransport;
pub use consumer::{
    settle, Consumer, ConsumerStats, Disposition, MetricSink, SinkError, StreamEnd,
};
pub use error::{BusError, Result};
pub use link::LinkState;
pub use models::{DiskMetric, Host, Metric, MetricMessage, NetMetric, ValidationError};
pub use publisher::Publisher;
pub use transport::{
    close_signal, CloseNotifier, CloseSignal, Deliveries, Delivery, Session, Transport,
};

/// Durable queue carrying metric messages
pub const METRICS_QUEUE: &str = "metrics";

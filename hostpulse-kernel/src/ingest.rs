//! Wiring between the broker consumer and the metric store

use crate::config::BrokerConf;
use crate::store::MetricStore;
use hostpulse_bus::{AmqpTransport, Consumer, MetricSink, Transport};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub type IngestConsumer = Consumer<AmqpTransport, MetricStore>;

/// Consumer reading the configured queue into `store`
pub fn build_consumer(cfg: &BrokerConf, store: MetricStore) -> IngestConsumer {
    configure(Consumer::new(AmqpTransport::new(cfg.url.clone()), store), cfg)
}

/// Apply queue name, delays and a unique consumer tag
pub fn configure<T: Transport, S: MetricSink>(
    consumer: Consumer<T, S>,
    cfg: &BrokerConf,
) -> Consumer<T, S> {
    consumer
        .with_queue(cfg.queue.clone())
        .with_tag(format!("hostpulse-kernel-{}", uuid::Uuid::new_v4()))
        .with_retry_delay(cfg.retry_delay())
        .with_requeue_delay(cfg.requeue_delay())
}

/// Run the consumer until `cancel` fires
pub fn spawn_ingest<T: Transport, S: MetricSink>(
    consumer: Arc<Consumer<T, S>>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move { consumer.run(cancel).await })
}

/*!
Test harness for HostPulse pipelines

Bundles an in-memory broker, a recording sink and a cancellation token, and
provides polling helpers for asserting on asynchronous effects.
*/

use crate::broker_stub::MockBroker;
use crate::fixtures::MessageBuilder;
use crate::sink_stub::RecordingSink;
use anyhow::Result;
use hostpulse_bus::METRICS_QUEUE;
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Default deadline for [`wait_until`]
pub const DEFAULT_WAIT: Duration = Duration::from_secs(5);
const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Install a test subscriber once. `RUST_LOG` controls verbosity.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}

/// Poll `condition` until it holds or `deadline` elapses
pub async fn wait_until<F>(deadline: Duration, mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    let start = tokio::time::Instant::now();
    loop {
        if condition() {
            return true;
        }
        if start.elapsed() >= deadline {
            return false;
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
}

/// Await `future`, failing when it takes longer than `deadline`
pub async fn within<T>(deadline: Duration, future: impl Future<Output = T>) -> Result<T> {
    tokio::time::timeout(deadline, future)
        .await
        .map_err(|_| anyhow::anyhow!("timed out after {:?}", deadline))
}

/// Broker, sink and shutdown token for one test
pub struct TestHarness {
    pub broker: MockBroker,
    pub sink: RecordingSink,
    pub cancel: CancellationToken,
    pub queue: String,
}

impl TestHarness {
    pub fn new() -> Self {
        init_tracing();
        Self {
            broker: MockBroker::new(),
            sink: RecordingSink::new(),
            cancel: CancellationToken::new(),
            queue: METRICS_QUEUE.to_string(),
        }
    }

    /// Put a built message on the queue
    pub fn enqueue(&self, builder: &MessageBuilder) {
        self.broker.inject(&self.queue, builder.json());
    }

    /// Put raw bytes on the queue
    pub fn enqueue_raw(&self, body: &[u8]) {
        self.broker.inject(&self.queue, body.to_vec());
    }

    /// Wait until the sink holds `count` messages
    pub async fn wait_for_saved(&self, count: usize) -> Result<()> {
        let sink = self.sink.clone();
        if wait_until(DEFAULT_WAIT, || sink.saved_count() >= count).await {
            Ok(())
        } else {
            anyhow::bail!(
                "expected {} saved messages, got {}",
                count,
                self.sink.saved_count()
            )
        }
    }

    /// Wait until `count` messages were acknowledged on the queue
    pub async fn wait_for_acked(&self, count: usize) -> Result<()> {
        let broker = self.broker.clone();
        let queue = self.queue.clone();
        if wait_until(DEFAULT_WAIT, || broker.acked(&queue) >= count).await {
            Ok(())
        } else {
            anyhow::bail!(
                "expected {} acked messages, got {}",
                count,
                self.broker.acked(&self.queue)
            )
        }
    }
}

impl Default for TestHarness {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_wait_until_times_out() {
        assert!(!wait_until(Duration::from_millis(30), || false).await);
        assert!(wait_until(Duration::from_millis(30), || true).await);
    }

    #[tokio::test]
    async fn test_harness_enqueue() {
        let harness = TestHarness::new();
        harness.enqueue(&MessageBuilder::host_a());
        harness.enqueue_raw(b"garbage");
        assert_eq!(harness.broker.ready(METRICS_QUEUE), 2);
        assert_eq!(harness.broker.published_messages(METRICS_QUEUE).len(), 1);
    }
}

use crate::store::MetricStore;
use hostpulse_bus::{Consumer, ConsumerStats, LinkState, MetricSink, Transport};
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;

/// Snapshot served on `/system/health`
#[derive(Debug, Serialize)]
pub struct KernelHealth {
    pub uptime_seconds: u64,
    pub memory_usage_mb: Option<f32>,
    pub store_status: String,
    pub ingest: Option<IngestHealth>,
}

#[derive(Debug, Serialize)]
pub struct IngestHealth {
    pub broker_status: LinkState,
    pub broker_reconnects: u64,
    pub deliveries: ConsumerStats,
}

/// What the health endpoint needs to know about the ingest consumer
pub trait IngestProbe: Send + Sync {
    fn link_state(&self) -> LinkState;
    fn reconnects(&self) -> u64;
    fn stats(&self) -> ConsumerStats;
}

impl<T: Transport, S: MetricSink> IngestProbe for Consumer<T, S> {
    fn link_state(&self) -> LinkState {
        self.state()
    }

    fn reconnects(&self) -> u64 {
        Consumer::reconnects(self)
    }

    fn stats(&self) -> ConsumerStats {
        Consumer::stats(self)
    }
}

#[derive(Clone)]
pub struct HealthTracker {
    start_time: Instant,
    ingest: Option<Arc<dyn IngestProbe>>,
}

impl HealthTracker {
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            ingest: None,
        }
    }

    #[must_use]
    pub fn with_ingest(mut self, probe: Arc<dyn IngestProbe>) -> Self {
        self.ingest = Some(probe);
        self
    }

    pub async fn get_health(&self, store: &MetricStore) -> KernelHealth {
        let store_status = match store.ping().await {
            Ok(()) => "ok".to_string(),
            Err(e) => {
                tracing::warn!("store health check failed: {}", e);
                "unavailable".to_string()
            }
        };

        KernelHealth {
            uptime_seconds: self.start_time.elapsed().as_secs(),
            memory_usage_mb: get_memory_usage_mb(),
            store_status,
            ingest: self.ingest.as_ref().map(|probe| IngestHealth {
                broker_status: probe.link_state(),
                broker_reconnects: probe.reconnects(),
                deliveries: probe.stats(),
            }),
        }
    }
}

impl Default for HealthTracker {
    fn default() -> Self {
        Self::new()
    }
}

/// Resident set size of this process, Linux only
fn get_memory_usage_mb() -> Option<f32> {
    #[cfg(target_os = "linux")]
    {
        let status = std::fs::read_to_string("/proc/self/status").ok()?;
        let kb = status
            .lines()
            .find(|line| line.starts_with("VmRSS:"))?
            .split_whitespace()
            .nth(1)?
            .parse::<u64>()
            .ok()?;
        Some(kb as f32 / 1024.0)
    }

    #[cfg(not(target_os = "linux"))]
    {
        None
    }
}

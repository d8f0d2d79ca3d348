/*!
Recording `MetricSink` for consumer tests

Stores every accepted message in memory. It can be switched into a
transient failure mode to simulate a store outage, or into rejecting mode.
*/

use async_trait::async_trait;
use hostpulse_bus::{MetricMessage, MetricSink, SinkError};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

#[derive(Default)]
struct Recorded {
    saved: Mutex<Vec<MetricMessage>>,
    attempts: AtomicU64,
    outage: AtomicBool,
    rejecting: AtomicBool,
}

/// In-memory sink. Clones share the same recording.
#[derive(Clone, Default)]
pub struct RecordingSink {
    inner: Arc<Recorded>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail every save with a transient error while `on` is true
    pub fn set_outage(&self, on: bool) {
        self.inner.outage.store(on, Ordering::SeqCst);
    }

    /// Reject every save as non-retryable while `on` is true
    pub fn set_rejecting(&self, on: bool) {
        self.inner.rejecting.store(on, Ordering::SeqCst);
    }

    pub fn saved(&self) -> Vec<MetricMessage> {
        self.inner.saved.lock().clone()
    }

    pub fn saved_count(&self) -> usize {
        self.inner.saved.lock().len()
    }

    /// Calls to `save`, failed ones included
    pub fn attempts(&self) -> u64 {
        self.inner.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MetricSink for RecordingSink {
    async fn save(&self, message: &MetricMessage) -> Result<(), SinkError> {
        self.inner.attempts.fetch_add(1, Ordering::SeqCst);
        if self.inner.outage.load(Ordering::SeqCst) {
            return Err(SinkError::Transient("store unavailable".to_string()));
        }
        if self.inner.rejecting.load(Ordering::SeqCst) {
            return Err(SinkError::Rejected("rejected by test sink".to_string()));
        }
        self.inner.saved.lock().push(message.clone());
        Ok(())
    }
}

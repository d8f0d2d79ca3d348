/*!
In-memory broker for tests without RabbitMQ

`MockBroker` implements the `Transport` seam with durable queues, manual
acknowledgement and redelivery. It can refuse new connections and drop the
live ones, which is what the reconnect and outage tests need.
*/

use async_trait::async_trait;
use futures::StreamExt;
use hostpulse_bus::{
    close_signal, BusError, CloseNotifier, CloseSignal, Deliveries, Delivery, MetricMessage,
    Result, Session, Transport,
};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

#[derive(Default)]
struct Queue {
    ready: VecDeque<Vec<u8>>,
    /// delivery tag -> (session id, body)
    unacked: HashMap<u64, (u64, Vec<u8>)>,
    published: Vec<Vec<u8>>,
    acked: Vec<Vec<u8>>,
    dead: Vec<Vec<u8>>,
    redelivered: usize,
}

impl Queue {
    fn requeue_session(&mut self, session_id: u64) {
        let mut tags: Vec<u64> = self
            .unacked
            .iter()
            .filter(|(_, (owner, _))| *owner == session_id)
            .map(|(tag, _)| *tag)
            .collect();
        tags.sort_unstable();
        for tag in tags.into_iter().rev() {
            if let Some((_, body)) = self.unacked.remove(&tag) {
                self.ready.push_front(body);
                self.redelivered += 1;
            }
        }
    }
}

struct BrokerState {
    queues: HashMap<String, Queue>,
    accepting: bool,
    attempts: u64,
    opens: u64,
    next_session: u64,
    next_tag: u64,
    live: HashMap<u64, (CloseNotifier, Arc<AtomicBool>)>,
}

struct Inner {
    state: Mutex<BrokerState>,
    wakeup: Notify,
}

/// Shared in-memory broker. Clones refer to the same broker.
#[derive(Clone)]
pub struct MockBroker {
    inner: Arc<Inner>,
}

impl MockBroker {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(BrokerState {
                    queues: HashMap::new(),
                    accepting: true,
                    attempts: 0,
                    opens: 0,
                    next_session: 1,
                    next_tag: 1,
                    live: HashMap::new(),
                }),
                wakeup: Notify::new(),
            }),
        }
    }

    /// Refuse new connections until [`MockBroker::restore_connections`]
    pub fn fail_connections(&self) {
        self.inner.state.lock().accepting = false;
    }

    pub fn restore_connections(&self) {
        self.inner.state.lock().accepting = true;
    }

    /// Close every live session from the broker side. Unacked messages go back to the queue head.
    pub fn drop_connections(&self, reason: &str) {
        let dropped: Vec<(u64, (CloseNotifier, Arc<AtomicBool>))> = {
            let mut state = self.inner.state.lock();
            let dropped: Vec<_> = state.live.drain().collect();
            for (id, _) in &dropped {
                for queue in state.queues.values_mut() {
                    queue.requeue_session(*id);
                }
            }
            dropped
        };
        for (_, (notifier, closed)) in dropped {
            closed.store(true, Ordering::SeqCst);
            notifier.notify(reason);
        }
        self.inner.wakeup.notify_waiters();
    }

    /// Enqueue a raw body as if a producer had published it
    pub fn inject(&self, queue: &str, body: impl Into<Vec<u8>>) {
        let body = body.into();
        {
            let mut state = self.inner.state.lock();
            let queue = state.queues.entry(queue.to_string()).or_default();
            queue.published.push(body.clone());
            queue.ready.push_back(body);
        }
        self.inner.wakeup.notify_waiters();
    }

    /// Connection attempts, refused ones included
    pub fn attempts(&self) -> u64 {
        self.inner.state.lock().attempts
    }

    /// Successful connections
    pub fn opens(&self) -> u64 {
        self.inner.state.lock().opens
    }

    pub fn live_sessions(&self) -> usize {
        self.inner.state.lock().live.len()
    }

    pub fn is_declared(&self, queue: &str) -> bool {
        self.inner.state.lock().queues.contains_key(queue)
    }

    /// Every body ever published to `queue`
    pub fn published(&self, queue: &str) -> Vec<Vec<u8>> {
        self.with_queue(queue, |q| q.published.clone())
    }

    /// Published bodies decoded as metric messages, skipping undecodable ones
    pub fn published_messages(&self, queue: &str) -> Vec<MetricMessage> {
        self.published(queue)
            .iter()
            .filter_map(|body| serde_json::from_slice(body).ok())
            .collect()
    }

    pub fn ready(&self, queue: &str) -> usize {
        self.with_queue(queue, |q| q.ready.len())
    }

    pub fn unacked(&self, queue: &str) -> usize {
        self.with_queue(queue, |q| q.unacked.len())
    }

    pub fn acked(&self, queue: &str) -> usize {
        self.with_queue(queue, |q| q.acked.len())
    }

    /// Bodies rejected without requeue
    pub fn dead_letters(&self, queue: &str) -> Vec<Vec<u8>> {
        self.with_queue(queue, |q| q.dead.clone())
    }

    /// Times a message went back to the queue head
    pub fn redelivered(&self, queue: &str) -> usize {
        self.with_queue(queue, |q| q.redelivered)
    }

    fn with_queue<R: Default>(&self, queue: &str, f: impl FnOnce(&Queue) -> R) -> R {
        self.inner.state.lock().queues.get(queue).map(f).unwrap_or_default()
    }
}

impl Default for MockBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for MockBroker {
    type Session = MockSession;

    async fn open(&self) -> Result<MockSession> {
        let mut state = self.inner.state.lock();
        state.attempts += 1;
        if !state.accepting {
            return Err(BusError::broker("connection refused"));
        }
        state.opens += 1;
        let id = state.next_session;
        state.next_session += 1;

        let (notifier, signal) = close_signal();
        let closed = Arc::new(AtomicBool::new(false));
        state.live.insert(id, (notifier.clone(), closed.clone()));
        tracing::debug!(session = id, "mock broker accepted connection");

        Ok(MockSession {
            id,
            broker: self.inner.clone(),
            notifier,
            signal,
            closed,
        })
    }
}

pub struct MockSession {
    id: u64,
    broker: Arc<Inner>,
    notifier: CloseNotifier,
    signal: CloseSignal,
    closed: Arc<AtomicBool>,
}

#[async_trait]
impl Session for MockSession {
    type Delivery = MockDelivery;

    fn is_open(&self) -> bool {
        !self.closed.load(Ordering::SeqCst)
    }

    async fn declare_queue(&self, queue: &str) -> Result<()> {
        if !self.is_open() {
            return Err(BusError::broker("channel closed"));
        }
        self.broker
            .state
            .lock()
            .queues
            .entry(queue.to_string())
            .or_default();
        Ok(())
    }

    async fn publish(&self, queue: &str, body: Vec<u8>) -> Result<()> {
        if !self.is_open() {
            return Err(BusError::broker("channel closed"));
        }
        {
            let mut state = self.broker.state.lock();
            let queue = state.queues.entry(queue.to_string()).or_default();
            queue.published.push(body.clone());
            queue.ready.push_back(body);
        }
        self.broker.wakeup.notify_waiters();
        Ok(())
    }

    async fn consume(&self, queue: &str, _tag: &str) -> Result<Deliveries<MockDelivery>> {
        if !self.is_open() {
            return Err(BusError::broker("channel closed"));
        }
        let cursor = Cursor {
            broker: self.broker.clone(),
            queue: queue.to_string(),
            session: self.id,
            closed: self.closed.clone(),
        };
        Ok(futures::stream::unfold(cursor, |cursor| async move {
            let delivery = cursor.next().await?;
            Some((Ok(delivery), cursor))
        })
        .boxed())
    }

    fn closed(&self) -> CloseSignal {
        self.signal.clone()
    }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        {
            let mut state = self.broker.state.lock();
            state.live.remove(&self.id);
            for queue in state.queues.values_mut() {
                queue.requeue_session(self.id);
            }
        }
        self.notifier.notify("closed by client");
        self.broker.wakeup.notify_waiters();
        Ok(())
    }
}

struct Cursor {
    broker: Arc<Inner>,
    queue: String,
    session: u64,
    closed: Arc<AtomicBool>,
}

impl Cursor {
    /// Next ready message, or `None` once the session is closed
    async fn next(&self) -> Option<MockDelivery> {
        loop {
            let wakeup = self.broker.wakeup.notified();
            tokio::pin!(wakeup);
            wakeup.as_mut().enable();

            if self.closed.load(Ordering::SeqCst) {
                return None;
            }
            {
                let mut guard = self.broker.state.lock();
                let state = &mut *guard;
                let queue = state.queues.entry(self.queue.clone()).or_default();
                if let Some(body) = queue.ready.pop_front() {
                    let tag = state.next_tag;
                    state.next_tag += 1;
                    queue.unacked.insert(tag, (self.session, body.clone()));
                    return Some(MockDelivery {
                        broker: self.broker.clone(),
                        queue: self.queue.clone(),
                        tag,
                        body,
                        closed: self.closed.clone(),
                    });
                }
            }

            wakeup.await;
        }
    }
}

pub struct MockDelivery {
    broker: Arc<Inner>,
    queue: String,
    tag: u64,
    body: Vec<u8>,
    closed: Arc<AtomicBool>,
}

impl MockDelivery {
    fn settle(&self, requeue: Option<bool>) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(BusError::broker("channel closed before settlement"));
        }
        {
            let mut state = self.broker.state.lock();
            let queue = state.queues.entry(self.queue.clone()).or_default();
            let (_, body) = queue
                .unacked
                .remove(&self.tag)
                .ok_or_else(|| BusError::broker(format!("unknown delivery tag {}", self.tag)))?;
            match requeue {
                None => queue.acked.push(body),
                Some(true) => {
                    queue.ready.push_front(body);
                    queue.redelivered += 1;
                }
                Some(false) => queue.dead.push(body),
            }
        }
        self.broker.wakeup.notify_waiters();
        Ok(())
    }
}

#[async_trait]
impl Delivery for MockDelivery {
    fn body(&self) -> &[u8] {
        &self.body
    }

    async fn ack(&self) -> Result<()> {
        self.settle(None)
    }

    async fn nack(&self, requeue: bool) -> Result<()> {
        self.settle(Some(requeue))
    }
}

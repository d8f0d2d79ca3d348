//! Guarded broker session shared by the publisher and the consumer

use crate::transport::{CloseSignal, Session, Transport};
use crate::{BusError, Result};
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex as AsyncMutex, MutexGuard};
use tokio_util::sync::CancellationToken;

/// Connection lifecycle of a publisher or consumer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkState {
    Disconnected,
    Connecting,
    Connected,
}

/// One broker session behind an async mutex, plus its lifecycle bookkeeping.
///
/// Connect, publish and close all serialize on the session lock, so a
/// half-built session is never visible to another caller.
pub(crate) struct Link<T: Transport> {
    transport: T,
    queue: String,
    session: AsyncMutex<Option<T::Session>>,
    state: Mutex<LinkState>,
    connects: AtomicU64,
}

impl<T: Transport> Link<T> {
    pub(crate) fn new(transport: T, queue: String) -> Self {
        Self {
            transport,
            queue,
            session: AsyncMutex::new(None),
            state: Mutex::new(LinkState::Disconnected),
            connects: AtomicU64::new(0),
        }
    }

    pub(crate) fn set_queue(&mut self, queue: String) {
        self.queue = queue;
    }

    pub(crate) fn queue(&self) -> &str {
        &self.queue
    }

    pub(crate) fn state(&self) -> LinkState {
        *self.state.lock()
    }

    /// Number of successful connects after the first one
    pub(crate) fn reconnects(&self) -> u64 {
        self.connects.load(Ordering::Relaxed).saturating_sub(1)
    }

    fn set_state(&self, state: LinkState) {
        *self.state.lock() = state;
    }

    /// Open a session and declare the queue. No-op while the current session is healthy.
    pub(crate) async fn connect(&self) -> Result<CloseSignal> {
        let mut guard = self.session.lock().await;

        if let Some(session) = guard.as_ref() {
            if session.is_open() {
                return Ok(session.closed());
            }
        }
        if let Some(stale) = guard.take() {
            discard(stale).await;
        }

        self.set_state(LinkState::Connecting);
        match self.open().await {
            Ok(session) => {
                let signal = session.closed();
                *guard = Some(session);
                self.connects.fetch_add(1, Ordering::Relaxed);
                self.set_state(LinkState::Connected);
                Ok(signal)
            }
            Err(e) => {
                self.set_state(LinkState::Disconnected);
                Err(e)
            }
        }
    }

    async fn open(&self) -> Result<T::Session> {
        let session = self.transport.open().await?;
        if let Err(e) = session.declare_queue(&self.queue).await {
            discard(session).await;
            return Err(e);
        }
        Ok(session)
    }

    /// Lock the session slot
    pub(crate) async fn session(&self) -> MutexGuard<'_, Option<T::Session>> {
        self.session.lock().await
    }

    /// Borrow the live session, or fail fast when there is none
    pub(crate) fn live<'a>(
        guard: &'a MutexGuard<'_, Option<T::Session>>,
        who: &'static str,
    ) -> Result<&'a T::Session> {
        guard
            .as_ref()
            .filter(|session| session.is_open())
            .ok_or(BusError::NotConnected(who))
    }

    /// Forget a session the broker has already closed
    pub(crate) async fn drop_session(&self) {
        let mut guard = self.session.lock().await;
        if let Some(stale) = guard.take() {
            discard(stale).await;
        }
        self.set_state(LinkState::Disconnected);
    }

    /// Close channel and connection. Idempotent.
    pub(crate) async fn close(&self) -> Result<()> {
        let mut guard = self.session.lock().await;
        let result = match guard.take() {
            Some(session) => session.close().await,
            None => Ok(()),
        };
        self.set_state(LinkState::Disconnected);
        result
    }
}

async fn discard<S: Session>(session: S) {
    if let Err(e) = session.close().await {
        tracing::debug!("closing stale session: {}", e);
    }
}

/// Sleep for `delay` unless cancelled first. Returns `false` on cancellation.
pub(crate) async fn backoff(cancel: &CancellationToken, delay: Duration) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(delay) => true,
    }
}

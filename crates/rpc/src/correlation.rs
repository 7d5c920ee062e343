use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::oneshot;
use tokio::time::{Instant, sleep_until};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Why a call could not be registered.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum RegisterError {
    /// The table was closed.
    #[error("correlation table closed")]
    Closed,

    /// Another call with the same correlation id is outstanding.
    #[error("correlation id {0} is already outstanding")]
    InUse(String),
}

/// Why waiting for a response ended without one.
#[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
pub enum WaitError {
    /// The caller cancelled.
    #[error("cancelled")]
    Cancelled,

    /// The table was closed, so the response can no longer be routed.
    #[error("reply channel closed")]
    Closed,

    /// The deadline passed.
    #[error("deadline elapsed")]
    TimedOut,
}

#[derive(Debug, Default)]
struct Inner {
    closed: bool,
    waiters: HashMap<String, oneshot::Sender<Bytes>>,
}

/// Outstanding calls on one reply address, keyed by correlation id.
///
/// Each entry completes at most once: by [`resolve`](Self::resolve), or by
/// removal when its [`PendingCall`] is dropped. Clones share the same
/// entries.
#[derive(Clone, Debug, Default)]
pub struct CorrelationTable {
    inner: Arc<Mutex<Inner>>,
}

impl CorrelationTable {
    /// Creates an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a call that must complete by `deadline`.
    ///
    /// # Errors
    /// Fails if the id is already outstanding or the table is closed.
    pub fn register(
        &self,
        correlation_id: impl Into<String>,
        deadline: Instant,
    ) -> Result<PendingCall, RegisterError> {
        let correlation_id = correlation_id.into();
        let (sender, receiver) = oneshot::channel();

        let mut inner = self.inner.lock();
        if inner.closed {
            return Err(RegisterError::Closed);
        }

        match inner.waiters.entry(correlation_id.clone()) {
            Entry::Occupied(_) => return Err(RegisterError::InUse(correlation_id)),
            Entry::Vacant(entry) => {
                entry.insert(sender);
            }
        }
        drop(inner);

        Ok(PendingCall {
            correlation_id,
            deadline,
            receiver,
            table: self.clone(),
        })
    }

    /// Completes the call waiting on `correlation_id` with `payload`.
    ///
    /// Returns `false` if no call was waiting, including one that gave up
    /// an instant before the payload arrived.
    pub fn resolve(&self, correlation_id: &str, payload: Bytes) -> bool {
        let sender = self.inner.lock().waiters.remove(correlation_id);
        sender.is_some_and(|sender| sender.send(payload).is_ok())
    }

    /// Closes the table. Waiting calls fail and new registrations are
    /// refused.
    pub fn close(&self) {
        let mut inner = self.inner.lock();
        inner.closed = true;
        inner.waiters.clear();
    }

    /// Whether the table was closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    /// Number of outstanding calls.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().waiters.len()
    }

    /// Whether no call is outstanding.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn evict(&self, correlation_id: &str) {
        let mut inner = self.inner.lock();
        // Only remove the entry if its receiver is gone. A later call may
        // have re-registered the same id.
        if inner
            .waiters
            .get(correlation_id)
            .is_some_and(oneshot::Sender::is_closed)
        {
            inner.waiters.remove(correlation_id);
        }
    }
}

/// A registered call waiting for its response.
///
/// Dropping it removes the entry from its table, so an abandoned call
/// leaves nothing behind.
#[derive(Debug)]
pub struct PendingCall {
    correlation_id: String,
    deadline: Instant,
    receiver: oneshot::Receiver<Bytes>,
    table: CorrelationTable,
}

impl PendingCall {
    /// Correlation id the call was registered under.
    #[must_use]
    pub fn correlation_id(&self) -> &str {
        &self.correlation_id
    }

    /// Instant after which the call gives up.
    #[must_use]
    pub const fn deadline(&self) -> Instant {
        self.deadline
    }

    /// Waits for the response, the deadline or cancellation, whichever
    /// comes first. A response that is already available wins.
    ///
    /// # Errors
    /// Returns why no response was received.
    pub async fn wait(mut self, cancellation: &CancellationToken) -> Result<Bytes, WaitError> {
        tokio::select! {
            biased;
            result = &mut self.receiver => result.map_err(|_| WaitError::Closed),
            () = cancellation.cancelled() => Err(WaitError::Cancelled),
            () = sleep_until(self.deadline) => Err(WaitError::TimedOut),
        }
    }
}

impl Drop for PendingCall {
    fn drop(&mut self) {
        self.receiver.close();
        self.table.evict(&self.correlation_id);
    }
}

/// Generates correlation ids unique to one client.
///
/// Ids are a random per-generator prefix followed by a counter.
#[derive(Debug)]
pub struct CorrelationIdGenerator {
    counter: AtomicU64,
    prefix: String,
}

impl Default for CorrelationIdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

impl CorrelationIdGenerator {
    /// Creates a generator with a fresh random prefix.
    #[must_use]
    pub fn new() -> Self {
        Self {
            counter: AtomicU64::new(0),
            prefix: Uuid::new_v4().simple().to_string(),
        }
    }

    /// Returns the next id.
    pub fn next_id(&self) -> String {
        let n = self.counter.fetch_add(1, Ordering::Relaxed);
        format!("{}-{n}", self.prefix)
    }
}

//! The downstream buffer boundary.

use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::Notify;

use crate::record::ChangeRecord;

/// Errors raised when writing to the downstream buffer.
#[derive(Debug, Error)]
pub enum BufferError {
    /// The write did not complete within the bound. Distinct from other
    /// failures so callers can tell backpressure from breakage.
    #[error("timed out writing {records} records to the buffer after {timeout:?}")]
    Timeout {
        /// Number of records in the rejected write.
        records: usize,
        /// The bound that elapsed.
        timeout: Duration,
    },

    /// The buffer is closed and accepts no further writes.
    #[error("buffer is closed")]
    Closed,
}

/// Bounded-timeout write access to the downstream pipeline.
#[async_trait]
pub trait SinkBuffer: Send + Sync {
    /// Writes a batch of records, waiting at most `timeout`.
    async fn write(&self, records: Vec<ChangeRecord>, timeout: Duration)
        -> Result<(), BufferError>;
}

/// Unbounded in-memory [`SinkBuffer`] for tests and local development.
///
/// Records accumulate until [`drain`](Self::drain) is called; a capacity
/// can be armed to exercise the timeout path.
#[derive(Default)]
pub struct InMemoryBuffer {
    records: Mutex<Vec<ChangeRecord>>,
    capacity: Mutex<Option<usize>>,
    notify: Notify,
}

impl InMemoryBuffer {
    /// Creates an empty buffer with no capacity limit.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Caps the buffer at `capacity` records; writes beyond it block until
    /// drained (and thus time out if nothing drains).
    pub fn set_capacity(&self, capacity: usize) {
        *self.capacity.lock() = Some(capacity);
    }

    /// Number of records currently buffered.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    /// Whether the buffer is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }

    /// Takes all buffered records.
    #[must_use]
    pub fn drain(&self) -> Vec<ChangeRecord> {
        let drained = std::mem::take(&mut *self.records.lock());
        self.notify.notify_waiters();
        drained
    }

    fn try_push(&self, records: &mut Option<Vec<ChangeRecord>>) -> bool {
        let mut held = self.records.lock();
        let incoming = records.as_ref().map_or(0, Vec::len);
        if let Some(capacity) = *self.capacity.lock() {
            if held.len() + incoming > capacity {
                return false;
            }
        }
        if let Some(records) = records.take() {
            held.extend(records);
        }
        true
    }
}

#[async_trait]
impl SinkBuffer for InMemoryBuffer {
    async fn write(
        &self,
        records: Vec<ChangeRecord>,
        timeout: Duration,
    ) -> Result<(), BufferError> {
        let count = records.len();
        let mut pending = Some(records);
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            // Register for the drain notification before checking capacity,
            // so a drain between the check and the wait cannot be missed.
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.try_push(&mut pending) {
                return Ok(());
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Err(BufferError::Timeout {
                    records: count,
                    timeout,
                });
            }
        }
    }
}

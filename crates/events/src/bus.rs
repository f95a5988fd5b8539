//! Consumer side of in-process delivery.
//!
//! Delivery is **at-least-once**: the same event may arrive again after a
//! crash or a retry, so consumers must be idempotent (processing an event
//! twice is a no-op the second time).

use std::sync::mpsc::{Receiver, RecvError, RecvTimeoutError, TryRecvError};
use std::time::Duration;

/// A subscription to an in-process event stream.
///
/// ## Usage Pattern
///
/// ```ignore
/// let (publisher, subscription) = MemoryQueuePublisher::new("memory-queue", 1024);
///
/// loop {
///     match subscription.recv_timeout(Duration::from_secs(1)) {
///         Ok(event) => processor.process_with_retry(&event, |e| handle(e)),
///         Err(RecvTimeoutError::Timeout) => continue,  // Check for shutdown
///         Err(RecvTimeoutError::Disconnected) => break,  // Publisher dropped
///     }
/// }
/// ```
///
/// Subscriptions are meant for a single consuming thread.
#[derive(Debug)]
pub struct Subscription<M> {
    receiver: Receiver<M>,
}

impl<M> Subscription<M> {
    pub fn new(receiver: Receiver<M>) -> Self {
        Self { receiver }
    }

    /// Block until the next message is available.
    pub fn recv(&self) -> Result<M, RecvError> {
        self.receiver.recv()
    }

    /// Try to receive a message without blocking.
    pub fn try_recv(&self) -> Result<M, TryRecvError> {
        self.receiver.try_recv()
    }

    /// Block for up to `timeout` waiting for a message.
    pub fn recv_timeout(&self, timeout: Duration) -> Result<M, RecvTimeoutError> {
        self.receiver.recv_timeout(timeout)
    }

    /// Take everything currently queued without blocking.
    pub fn drain(&self) -> Vec<M> {
        self.receiver.try_iter().collect()
    }
}

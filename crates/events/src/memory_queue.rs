//! Bounded in-process event queue.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, SyncSender, TrySendError};

use tracing::{debug, warn};

use crate::bus::Subscription;
use crate::event::DomainEvent;
use crate::publisher::{EventPublisher, PublisherKind};

pub const MEMORY_QUEUE_PRIORITY: i32 = 50;

/// In-process publisher backed by a bounded channel.
///
/// - No IO, fastest path
/// - Not durable: queued events are lost if the process dies
/// - `publish` returns `false` when the queue is full or the consumer is gone
#[derive(Debug)]
pub struct MemoryQueuePublisher {
    name: String,
    sender: SyncSender<DomainEvent>,
    capacity: usize,
    closed: AtomicBool,
}

impl MemoryQueuePublisher {
    /// Create a queue holding at most `capacity` undelivered events.
    pub fn new(name: impl Into<String>, capacity: usize) -> (Self, Subscription<DomainEvent>) {
        let (sender, receiver) = mpsc::sync_channel(capacity);
        let publisher = Self {
            name: name.into(),
            sender,
            capacity,
            closed: AtomicBool::new(false),
        };
        (publisher, Subscription::new(receiver))
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl EventPublisher for MemoryQueuePublisher {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> PublisherKind {
        PublisherKind::MemoryQueue
    }

    fn priority(&self) -> i32 {
        MEMORY_QUEUE_PRIORITY
    }

    fn is_available(&self) -> bool {
        !self.closed.load(Ordering::Acquire)
    }

    fn publish(&self, event: &DomainEvent) -> bool {
        match self.sender.try_send(event.clone()) {
            Ok(()) => {
                debug!(publisher = %self.name, event_id = %event.id, "event enqueued");
                true
            }
            Err(TrySendError::Full(_)) => {
                warn!(
                    publisher = %self.name,
                    event_id = %event.id,
                    capacity = self.capacity,
                    "memory queue full"
                );
                false
            }
            Err(TrySendError::Disconnected(_)) => {
                self.closed.store(true, Ordering::Release);
                warn!(publisher = %self.name, event_id = %event.id, "memory queue consumer gone");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventType;
    use chrono::Utc;
    use orderflow_core::SnowflakeId;

    fn event(id: i64) -> DomainEvent {
        DomainEvent::new(SnowflakeId::from_raw(id), EventType::OrderPaid, "{}", Utc::now())
    }

    #[test]
    fn delivers_to_subscription_in_order() {
        let (q, sub) = MemoryQueuePublisher::new("mq", 8);
        assert!(q.publish(&event(1)));
        assert!(q.publish(&event(2)));

        let got: Vec<_> = sub.drain().into_iter().map(|e| e.id.as_i64()).collect();
        assert_eq!(got, vec![1, 2]);
    }

    #[test]
    fn full_queue_rejects() {
        let (q, _sub) = MemoryQueuePublisher::new("mq", 1);
        assert!(q.publish(&event(1)));
        assert!(!q.publish(&event(2)));
        assert!(q.is_available());
    }

    #[test]
    fn dropped_consumer_marks_unavailable() {
        let (q, sub) = MemoryQueuePublisher::new("mq", 4);
        drop(sub);
        assert!(!q.publish(&event(1)));
        assert!(!q.is_available());
    }
}

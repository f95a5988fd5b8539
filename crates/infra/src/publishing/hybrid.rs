use std::sync::Arc;

use tracing::warn;

use orderflow_events::{DomainEvent, EventPublisher, MemoryQueuePublisher, PublisherKind};

use crate::outbox::OutboxPublisher;

pub const HYBRID_PRIORITY: i32 = 10;

/// Memory queue first, outbox when the queue refuses the event.
///
/// The decision is made per call, so a burst that fills the queue spills to
/// the outbox and later events go back to the queue once it drains.
#[derive(Debug)]
pub struct HybridPublisher {
    name: String,
    memory: Arc<MemoryQueuePublisher>,
    outbox: Arc<OutboxPublisher>,
}

impl HybridPublisher {
    pub fn new(
        name: impl Into<String>,
        memory: Arc<MemoryQueuePublisher>,
        outbox: Arc<OutboxPublisher>,
    ) -> Self {
        Self {
            name: name.into(),
            memory,
            outbox,
        }
    }
}

impl EventPublisher for HybridPublisher {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> PublisherKind {
        PublisherKind::Hybrid
    }

    fn priority(&self) -> i32 {
        HYBRID_PRIORITY
    }

    fn is_available(&self) -> bool {
        self.memory.is_available() || self.outbox.is_available()
    }

    fn publish(&self, event: &DomainEvent) -> bool {
        if self.memory.publish(event) {
            return true;
        }
        warn!(publisher = %self.name, event_id = %event.id, "memory queue refused event, falling back to outbox");
        self.outbox.publish(event)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::outbox::{DomainEventStore, InMemoryDomainEventStore};
    use chrono::Utc;
    use orderflow_core::SnowflakeId;
    use orderflow_events::{EventStatus, EventType};

    fn event(id: i64) -> DomainEvent {
        DomainEvent::new(SnowflakeId::from_raw(id), EventType::OrderCreated, "{}", Utc::now())
    }

    #[test]
    fn memory_failure_lands_in_outbox() {
        let store = InMemoryDomainEventStore::arc();
        let (memory, subscription) = MemoryQueuePublisher::new("memory", 1);
        let hybrid = HybridPublisher::new(
            "hybrid",
            Arc::new(memory),
            Arc::new(OutboxPublisher::new("outbox", store.clone())),
        );

        assert!(hybrid.publish(&event(1)));
        assert!(store.is_empty());

        // Queue is full now.
        assert!(hybrid.publish(&event(2)));
        let stored = store.find_by_id(SnowflakeId::from_raw(2)).unwrap().unwrap();
        assert_eq!(stored.status, EventStatus::Pending);

        assert_eq!(subscription.drain().len(), 1);
        assert!(hybrid.publish(&event(3)));
        assert_eq!(store.len(), 1);
    }
}

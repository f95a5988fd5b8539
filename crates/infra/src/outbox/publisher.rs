use std::sync::Arc;

use tracing::{debug, error};

use orderflow_events::{DomainEvent, EventPublisher, EventStatus, PublisherKind};

use super::store::DomainEventStore;

pub const OUTBOX_PRIORITY: i32 = 100;

/// Publisher that only persists the event; the relay delivers it later.
///
/// Success means "durably recorded", not "delivered".
pub struct OutboxPublisher {
    name: String,
    store: Arc<dyn DomainEventStore>,
}

impl OutboxPublisher {
    pub fn new(name: impl Into<String>, store: Arc<dyn DomainEventStore>) -> Self {
        Self {
            name: name.into(),
            store,
        }
    }

    pub fn store(&self) -> &Arc<dyn DomainEventStore> {
        &self.store
    }
}

impl std::fmt::Debug for OutboxPublisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutboxPublisher")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

impl EventPublisher for OutboxPublisher {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> PublisherKind {
        PublisherKind::Outbox
    }

    fn priority(&self) -> i32 {
        OUTBOX_PRIORITY
    }

    fn is_available(&self) -> bool {
        true
    }

    fn publish(&self, event: &DomainEvent) -> bool {
        // Whatever state the caller handed us, the row starts its life pending.
        let mut row = event.clone();
        row.status = EventStatus::Pending;
        row.error_message = None;

        match self.store.append(&row) {
            Ok(()) => {
                debug!(publisher = %self.name, event_id = %event.id, "event stored in outbox");
                true
            }
            Err(e) => {
                error!(publisher = %self.name, event_id = %event.id, error = %e, "outbox append failed");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::outbox::store::InMemoryDomainEventStore;
    use chrono::Utc;
    use orderflow_core::SnowflakeId;
    use orderflow_events::EventType;

    #[test]
    fn publish_persists_pending_row() {
        let store = InMemoryDomainEventStore::arc();
        let publisher = OutboxPublisher::new("outbox", store.clone());
        let event = DomainEvent::new(
            SnowflakeId::from_raw(42),
            EventType::OrderPaid,
            r#"{"orderId":7}"#,
            Utc::now(),
        );

        assert!(publisher.publish(&event));
        let stored = store.find_by_id(event.id).unwrap().unwrap();
        assert_eq!(stored.status, EventStatus::Pending);
        assert_eq!(stored.event_type, EventType::OrderPaid);
        assert_eq!(stored.payload, event.payload);

        // Duplicate ids are a storage failure, reported as `false`.
        assert!(!publisher.publish(&event));
    }
}

//! Publisher strategies and the selector that chooses between them.
//!
//! | strategy | priority | durable | notes |
//! |----------|----------|---------|-------|
//! | broker (Redis Streams, feature `redis`) | 1 | yes | `publish_sync` waits for replica ack |
//! | hybrid | 10 | on fallback | memory queue, outbox when the queue refuses |
//! | memory queue | 50 | no | bounded, in-process |
//! | outbox | 100 | yes | relay delivers later |

#[cfg(feature = "redis")]
pub mod broker;
pub mod dispatcher;
pub mod hybrid;

use std::sync::Arc;

use tracing::{debug, error, warn};

use orderflow_events::{
    DomainEvent, EventPublisher, MemoryQueuePublisher, PublisherDescriptor, PublisherKind,
};

use crate::outbox::OutboxPublisher;

#[cfg(feature = "redis")]
pub use broker::{BROKER_PRIORITY, BrokerConfig, BrokerError, RedisBrokerPublisher};
pub use dispatcher::{DispatcherHandle, DispatcherStats, QueueDispatcher};
pub use hybrid::{HYBRID_PRIORITY, HybridPublisher};

/// The closed set of publishing strategies.
#[derive(Debug, Clone)]
pub enum AnyPublisher {
    Outbox(Arc<OutboxPublisher>),
    MemoryQueue(Arc<MemoryQueuePublisher>),
    Hybrid(Arc<HybridPublisher>),
    #[cfg(feature = "redis")]
    Broker(Arc<RedisBrokerPublisher>),
}

impl AnyPublisher {
    fn inner(&self) -> &dyn EventPublisher {
        match self {
            AnyPublisher::Outbox(p) => p.as_ref(),
            AnyPublisher::MemoryQueue(p) => p.as_ref(),
            AnyPublisher::Hybrid(p) => p.as_ref(),
            #[cfg(feature = "redis")]
            AnyPublisher::Broker(p) => p.as_ref(),
        }
    }

    fn is_outbox(&self) -> bool {
        matches!(self, AnyPublisher::Outbox(_))
    }
}

impl EventPublisher for AnyPublisher {
    fn name(&self) -> &str {
        self.inner().name()
    }

    fn kind(&self) -> PublisherKind {
        self.inner().kind()
    }

    fn priority(&self) -> i32 {
        self.inner().priority()
    }

    fn is_available(&self) -> bool {
        self.inner().is_available()
    }

    fn publish(&self, event: &DomainEvent) -> bool {
        self.inner().publish(event)
    }

    fn publish_sync(&self, event: &DomainEvent) -> bool {
        self.inner().publish_sync(event)
    }
}

/// Routes each publish to the preferred available strategy.
///
/// Availability is evaluated on every call. When the chosen strategy returns
/// `false` the next available one is tried, in priority order; if every
/// strategy fails, a registered outbox is tried as a last resort even if an
/// earlier availability check skipped it.
#[derive(Debug, Clone)]
pub struct PublisherSelector {
    name: String,
    publishers: Vec<AnyPublisher>,
}

impl PublisherSelector {
    pub fn new(name: impl Into<String>, mut publishers: Vec<AnyPublisher>) -> Self {
        // Stable: equal priorities keep registration order.
        publishers.sort_by_key(|p| p.priority());
        Self {
            name: name.into(),
            publishers,
        }
    }

    /// The strategy the next publish would try first.
    pub fn select(&self) -> Option<&AnyPublisher> {
        orderflow_events::select_publisher(&self.publishers)
    }

    pub fn descriptors(&self) -> Vec<PublisherDescriptor> {
        self.publishers.iter().map(|p| p.descriptor()).collect()
    }

    fn dispatch(&self, event: &DomainEvent, send: impl Fn(&AnyPublisher) -> bool) -> bool {
        let mut attempted = vec![false; self.publishers.len()];

        for (idx, publisher) in self.publishers.iter().enumerate() {
            if !publisher.is_available() {
                continue;
            }
            attempted[idx] = true;
            if send(publisher) {
                debug!(
                    selector = %self.name,
                    publisher = %publisher.name(),
                    event_id = %event.id,
                    "event published"
                );
                return true;
            }
            warn!(
                selector = %self.name,
                publisher = %publisher.name(),
                event_id = %event.id,
                "publisher failed, trying next"
            );
        }

        for (idx, publisher) in self.publishers.iter().enumerate() {
            if publisher.is_outbox() && !attempted[idx] && publisher.publish(event) {
                warn!(selector = %self.name, event_id = %event.id, "event saved to outbox as last resort");
                return true;
            }
        }

        error!(
            selector = %self.name,
            event_id = %event.id,
            event_type = %event.event_type,
            "no publisher accepted event"
        );
        false
    }
}

impl EventPublisher for PublisherSelector {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> PublisherKind {
        self.select()
            .map(|p| p.kind())
            .unwrap_or(PublisherKind::Outbox)
    }

    fn priority(&self) -> i32 {
        self.select()
            .map(|p| p.priority())
            .unwrap_or(orderflow_events::publisher::DEFAULT_PRIORITY)
    }

    fn is_available(&self) -> bool {
        self.publishers.iter().any(|p| p.is_available())
    }

    fn publish(&self, event: &DomainEvent) -> bool {
        self.dispatch(event, |p| p.publish(event))
    }

    fn publish_sync(&self, event: &DomainEvent) -> bool {
        self.dispatch(event, |p| p.publish_sync(event))
    }
}

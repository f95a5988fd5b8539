//! Event publishing contract (mechanics only).
//!
//! Every delivery strategy (transactional outbox, in-process memory queue,
//! hybrid, external broker) implements [`EventPublisher`]. Callers never pick
//! a strategy directly: they ask [`select_publisher`] for the best one that is
//! available *right now*, so a broker outage degrades to a slower but durable
//! path without any caller change.
//!
//! ## Failure semantics
//!
//! `publish*` returns `false` on failure. Implementations log the cause; no
//! error or panic crosses this boundary.

use std::sync::Arc;

use crate::event::DomainEvent;

/// Priority used when an implementation does not override it.
pub const DEFAULT_PRIORITY: i32 = 100;

/// Delivery strategy family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PublisherKind {
    Outbox,
    MemoryQueue,
    Hybrid,
    Broker,
}

impl PublisherKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PublisherKind::Outbox => "OUTBOX",
            PublisherKind::MemoryQueue => "MEMORY_QUEUE",
            PublisherKind::Hybrid => "HYBRID",
            PublisherKind::Broker => "BROKER",
        }
    }
}

/// Point-in-time description of a publisher, for diagnostics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublisherDescriptor {
    pub name: String,
    pub kind: PublisherKind,
    pub priority: i32,
    pub available: bool,
}

/// A strategy for delivering domain events.
pub trait EventPublisher: Send + Sync {
    fn name(&self) -> &str;

    fn kind(&self) -> PublisherKind;

    /// Lower is preferred.
    fn priority(&self) -> i32 {
        DEFAULT_PRIORITY
    }

    /// Live availability check; must be cheap enough to call per publish.
    fn is_available(&self) -> bool;

    /// Hand the event off for delivery.
    fn publish(&self, event: &DomainEvent) -> bool;

    /// Deliver and wait for the strategy's acknowledgement before returning.
    fn publish_sync(&self, event: &DomainEvent) -> bool {
        self.publish(event)
    }

    /// Publish each event independently; there is no batch atomicity.
    fn publish_batch(&self, events: &[DomainEvent]) -> Vec<bool> {
        events.iter().map(|e| self.publish(e)).collect()
    }

    fn publish_batch_sync(&self, events: &[DomainEvent]) -> Vec<bool> {
        events.iter().map(|e| self.publish_sync(e)).collect()
    }

    fn descriptor(&self) -> PublisherDescriptor {
        PublisherDescriptor {
            name: self.name().to_string(),
            kind: self.kind(),
            priority: self.priority(),
            available: self.is_available(),
        }
    }
}

impl<P: EventPublisher + ?Sized> EventPublisher for Arc<P> {
    fn name(&self) -> &str {
        (**self).name()
    }

    fn kind(&self) -> PublisherKind {
        (**self).kind()
    }

    fn priority(&self) -> i32 {
        (**self).priority()
    }

    fn is_available(&self) -> bool {
        (**self).is_available()
    }

    fn publish(&self, event: &DomainEvent) -> bool {
        (**self).publish(event)
    }

    fn publish_sync(&self, event: &DomainEvent) -> bool {
        (**self).publish_sync(event)
    }

    fn publish_batch(&self, events: &[DomainEvent]) -> Vec<bool> {
        (**self).publish_batch(events)
    }

    fn publish_batch_sync(&self, events: &[DomainEvent]) -> Vec<bool> {
        (**self).publish_batch_sync(events)
    }
}

/// Pick the available publisher with the lowest priority value.
///
/// Availability is re-checked on every call; ties go to the earliest candidate.
pub fn select_publisher<P: EventPublisher>(candidates: &[P]) -> Option<&P> {
    candidates
        .iter()
        .filter(|p| p.is_available())
        .min_by_key(|p| p.priority())
}

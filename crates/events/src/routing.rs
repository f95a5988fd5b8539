//! Event type to destination queue mapping.

use core::fmt;

use crate::event::EventType;

/// Logical destination queue/stream an event is delivered to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Destination {
    OrderEvents,
    PaymentEvents,
    DeliveryEvents,
    UserEvents,
}

impl Destination {
    pub const ALL: [Destination; 4] = [
        Destination::OrderEvents,
        Destination::PaymentEvents,
        Destination::DeliveryEvents,
        Destination::UserEvents,
    ];

    /// Route an event type to its destination. Unknown types go to `user-events`.
    pub fn for_event(event_type: &EventType) -> Self {
        match event_type {
            EventType::OrderCreated
            | EventType::OrderPaid
            | EventType::OrderCancelled
            | EventType::OrderDelivered
            | EventType::OrderAssigned => Destination::OrderEvents,
            EventType::PaymentTimeout => Destination::PaymentEvents,
            EventType::DeliveryTimeout => Destination::DeliveryEvents,
            _ => Destination::UserEvents,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Destination::OrderEvents => "order-events",
            Destination::PaymentEvents => "payment-events",
            Destination::DeliveryEvents => "delivery-events",
            Destination::UserEvents => "user-events",
        }
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn order_lifecycle_goes_to_order_events() {
        for t in [
            EventType::OrderCreated,
            EventType::OrderPaid,
            EventType::OrderCancelled,
            EventType::OrderDelivered,
            EventType::OrderAssigned,
        ] {
            assert_eq!(Destination::for_event(&t), Destination::OrderEvents);
        }
    }

    #[test]
    fn timeouts_have_dedicated_queues() {
        assert_eq!(
            Destination::for_event(&EventType::PaymentTimeout).as_str(),
            "payment-events"
        );
        assert_eq!(
            Destination::for_event(&EventType::DeliveryTimeout).as_str(),
            "delivery-events"
        );
    }

    #[test]
    fn everything_else_falls_back_to_user_events() {
        assert_eq!(
            Destination::for_event(&EventType::ReconciliationCompleted),
            Destination::UserEvents
        );
        assert_eq!(
            Destination::for_event(&EventType::Other("USER_REGISTERED".into())),
            Destination::UserEvents
        );
    }
}

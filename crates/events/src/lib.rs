//! Domain events and the mechanics of delivering them.
//!
//! - [`DomainEvent`]: the durable record of a fact to be delivered
//! - [`EventPublisher`]: the contract every delivery strategy implements
//! - [`MemoryQueuePublisher`]: bounded in-process delivery
//! - [`RetryableProcessor`]: bounded exponential-backoff retry around a handler
//!
//! Delivery is **at-least-once**: consumers must be idempotent.

pub mod bus;
pub mod event;
pub mod memory_queue;
pub mod publisher;
pub mod retry;
pub mod routing;

pub use bus::Subscription;
pub use event::{DomainEvent, EventStatus, EventType};
pub use memory_queue::MemoryQueuePublisher;
pub use publisher::{EventPublisher, PublisherDescriptor, PublisherKind, select_publisher};
pub use retry::{
    CancelToken, CancellableSleeper, RecordingSleeper, RetryConfig, RetryError,
    RetryableProcessor, SleepInterrupted, Sleeper, ThreadSleeper,
};
pub use routing::Destination;

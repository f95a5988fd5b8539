//! Transactional outbox: durable event rows plus the relay that drains them.
//!
//! - [`DomainEventStore`]: storage contract (in-memory and Postgres)
//! - [`OutboxPublisher`]: `EventPublisher` that only persists
//! - [`OutboxRelay`]: background worker delivering rows with retry/backoff

pub mod postgres;
pub mod publisher;
pub mod relay;
pub mod store;

pub use postgres::PostgresDomainEventStore;
pub use publisher::{OUTBOX_PRIORITY, OutboxPublisher};
pub use relay::{
    EventForwarder, ForwardError, LoggingForwarder, OutboxRelay, PublisherForwarder, RelayConfig,
    RelayHandle, RelayStats,
};
pub use store::{DomainEventStore, InMemoryDomainEventStore, OutboxStats, OutboxStoreError};

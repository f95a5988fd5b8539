//! Persistent storage for the reconciliation engine.

pub mod postgres;

pub use postgres::PostgresReconciliationStore;

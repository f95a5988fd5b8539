//! Infrastructure layer: persistence, publishing strategies, background
//! workers, external provider clients, configuration and process wiring.

pub mod bootstrap;
pub mod config;
pub mod db;
pub mod external;
pub mod outbox;
pub mod publishing;
pub mod reconciliation;
pub mod scheduling;

mod integration_tests;

pub use bootstrap::{Engine, EngineError};
pub use config::{AppConfig, ConfigError};
pub use db::Database;

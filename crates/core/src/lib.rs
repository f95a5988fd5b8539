//! `orderflow-core`: foundation building blocks shared by every other crate.
//!
//! This crate contains **pure** primitives (no infrastructure concerns): the
//! domain error model, an injectable clock and the Snowflake id generator.

pub mod clock;
pub mod error;
pub mod id;

pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{DomainError, DomainResult};
pub use id::{IdError, SnowflakeId, SnowflakeIdGenerator};

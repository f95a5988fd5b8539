//! Postgres connection pool and migrations.
//!
//! The store traits are synchronous; Postgres access is async (sqlx). A
//! [`Database`] carries the runtime handle it was created on and bridges with
//! `Handle::block_on`. That call panics on a runtime worker thread, so the
//! Postgres stores must only be driven from plain `std::thread`s (the relay,
//! the scheduler and reconciliation workers all are).

use std::future::Future;
use std::time::Duration;

use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use tokio::runtime::Handle;
use tracing::info;

const MIGRATIONS: &[(&str, &str)] = &[
    (
        "0001_domain_events",
        include_str!("../migrations/0001_domain_events.sql"),
    ),
    (
        "0002_reconciliation",
        include_str!("../migrations/0002_reconciliation.sql"),
    ),
];

#[derive(Debug, Clone)]
pub struct Database {
    pool: PgPool,
    handle: Handle,
}

impl Database {
    /// Open a pool on the current tokio runtime.
    pub async fn connect(url: &str, max_connections: u32) -> Result<Self, sqlx::Error> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(Duration::from_secs(10))
            .connect(url)
            .await?;
        Ok(Self::new(pool, Handle::current()))
    }

    pub fn new(pool: PgPool, handle: Handle) -> Self {
        Self { pool, handle }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Run `fut` to completion from a non-runtime thread.
    pub fn block_on<F: Future>(&self, fut: F) -> F::Output {
        self.handle.block_on(fut)
    }

    /// Apply the bundled schema. Every statement is idempotent.
    pub async fn migrate(&self) -> Result<(), sqlx::Error> {
        for &(name, sql) in MIGRATIONS {
            sqlx::raw_sql(sql).execute(&self.pool).await?;
            info!(migration = name, "migration applied");
        }
        Ok(())
    }
}

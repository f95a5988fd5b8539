use anyhow::Context;

use orderflow_infra::{AppConfig, Database, Engine};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    orderflow_observability::init();

    let config = AppConfig::from_env().context("invalid configuration")?;

    let db = if config.persistence.use_persistent_stores {
        let url = config
            .persistence
            .database_url
            .clone()
            .context("DATABASE_URL must be set when USE_PERSISTENT_STORES=true")?;
        let db = Database::connect(&url, config.persistence.max_connections)
            .await
            .context("failed to connect to Postgres")?;
        db.migrate().await.context("failed to run migrations")?;
        Some(db)
    } else {
        tracing::warn!("USE_PERSISTENT_STORES not set; events and reconciliation data live in memory");
        None
    };

    // Stores bridge to the runtime with block_on, so the engine lives on blocking threads.
    let engine = tokio::task::spawn_blocking(move || Engine::build(&config, db))
        .await
        .context("engine startup panicked")??;

    tracing::info!("orderflow worker running; press Ctrl-C to stop");
    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;

    tracing::info!("shutdown requested");
    tokio::task::spawn_blocking(move || engine.shutdown())
        .await
        .context("engine shutdown panicked")?;

    Ok(())
}

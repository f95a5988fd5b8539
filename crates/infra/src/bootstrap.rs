//! Process wiring: builds every store, publisher and background worker from
//! an [`AppConfig`] and owns their lifetimes.

use std::sync::Arc;

use thiserror::Error;
use tracing::{info, warn};

use orderflow_core::{Clock, IdError, SnowflakeIdGenerator, SystemClock};
use orderflow_events::{CancelToken, CancellableSleeper, MemoryQueuePublisher, RetryableProcessor};
use orderflow_reconciliation::{
    AdapterError, DiscrepancyRepository, ExternalLedgerAdapter, InMemoryReconciliationStore,
    InternalLedgerSource, ReconciliationService, ReportRepository, ServiceDependencies,
    StaticLedger, TaskRepository,
};

use crate::config::AppConfig;
use crate::db::Database;
use crate::external::WeChatLedgerClient;
use crate::outbox::{
    DomainEventStore, EventForwarder, InMemoryDomainEventStore, LoggingForwarder, OutboxPublisher,
    OutboxRelay, PostgresDomainEventStore, RelayHandle,
};
use crate::publishing::{
    AnyPublisher, DispatcherHandle, HybridPublisher, PublisherSelector, QueueDispatcher,
};
use crate::reconciliation::PostgresReconciliationStore;
use crate::scheduling::{ReconciliationScheduler, ScheduleError, SchedulerHandle, daily_jobs};

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("persistent stores requested but no database was provided")]
    MissingDatabase,

    #[error("id generator: {0}")]
    Id(#[from] IdError),

    #[error("external ledger adapter: {0}")]
    Adapter(#[from] AdapterError),

    #[error("schedule: {0}")]
    Schedule(#[from] ScheduleError),

    #[error("event broker: {0}")]
    Broker(String),

    #[error("failed to start background worker: {0}")]
    Spawn(#[from] std::io::Error),
}

struct ReconciliationStores {
    tasks: Arc<dyn TaskRepository>,
    discrepancies: Arc<dyn DiscrepancyRepository>,
    reports: Arc<dyn ReportRepository>,
}

/// The running system.
///
/// Postgres-backed stores bridge onto the async runtime with `block_on`, so
/// an engine built with a [`Database`] must be built and used from plain
/// threads (e.g. inside `tokio::task::spawn_blocking`), never from async tasks.
pub struct Engine {
    pub publisher: Arc<PublisherSelector>,
    pub service: Arc<ReconciliationService>,
    pub outbox: Arc<dyn DomainEventStore>,
    pub ids: Arc<SnowflakeIdGenerator>,
    cancel: CancelToken,
    scheduler: Option<SchedulerHandle>,
    relay: Option<RelayHandle>,
    dispatcher: Option<DispatcherHandle>,
}

impl Engine {
    /// Build with the system clock and an empty internal ledger.
    pub fn build(config: &AppConfig, db: Option<Database>) -> Result<Self, EngineError> {
        warn!("no internal ledger source wired, reconciliation compares against an empty ledger");
        Self::build_with(config, db, StaticLedger::arc("internal"), Arc::new(SystemClock))
    }

    pub fn build_with(
        config: &AppConfig,
        db: Option<Database>,
        internal: Arc<dyn InternalLedgerSource>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, EngineError> {
        let db = match (config.persistence.use_persistent_stores, db) {
            (true, None) => return Err(EngineError::MissingDatabase),
            (true, Some(db)) => Some(db),
            (false, _) => None,
        };

        let jobs = daily_jobs(&config.schedule)?;
        let ids = Arc::new(SnowflakeIdGenerator::with_clock(config.node_id, clock.clone())?);
        let cancel = CancelToken::new();
        let retry = RetryableProcessor::with_sleeper(
            config.retry.clone(),
            Arc::new(CancellableSleeper::new(cancel.clone())),
        );

        let (outbox, stores) = match &db {
            Some(db) => {
                let recon = Arc::new(PostgresReconciliationStore::new(db.clone()));
                let outbox: Arc<dyn DomainEventStore> =
                    Arc::new(PostgresDomainEventStore::new(db.clone()));
                (
                    outbox,
                    ReconciliationStores {
                        tasks: recon.clone(),
                        discrepancies: recon.clone(),
                        reports: recon,
                    },
                )
            }
            None => {
                let recon = InMemoryReconciliationStore::arc();
                let outbox: Arc<dyn DomainEventStore> = InMemoryDomainEventStore::arc();
                (
                    outbox,
                    ReconciliationStores {
                        tasks: recon.clone(),
                        discrepancies: recon.clone(),
                        reports: recon,
                    },
                )
            }
        };
        info!(persistent = db.is_some(), "stores initialised");

        let external: Arc<dyn ExternalLedgerAdapter> = match &config.wechat {
            Some(wechat) => Arc::new(WeChatLedgerClient::new(wechat.clone())?),
            None => {
                warn!("WECHAT_API_BASE_URL not set, using an empty static provider ledger");
                StaticLedger::arc("static-provider")
            }
        };

        let outbox_publisher = Arc::new(OutboxPublisher::new("outbox", outbox.clone()));
        let (memory, subscription) =
            MemoryQueuePublisher::new("memory-queue", config.memory_queue_capacity);
        let memory = Arc::new(memory);
        let hybrid = Arc::new(HybridPublisher::new(
            "hybrid",
            memory.clone(),
            outbox_publisher.clone(),
        ));

        let mut publishers = vec![
            AnyPublisher::Hybrid(hybrid),
            AnyPublisher::MemoryQueue(memory),
            AnyPublisher::Outbox(outbox_publisher),
        ];
        let forwarder = downstream_forwarder(config, &mut publishers)?;
        let publisher = Arc::new(PublisherSelector::new("event-publisher", publishers));
        for d in publisher.descriptors() {
            info!(publisher = %d.name, kind = ?d.kind, priority = d.priority, "publisher registered");
        }

        let dispatcher = QueueDispatcher::new(
            "memory-queue-dispatcher",
            subscription,
            forwarder.clone(),
            outbox.clone(),
            retry.clone(),
        )
        .spawn()?;

        let relay = OutboxRelay::new(
            outbox.clone(),
            forwarder,
            retry.clone(),
            clock.clone(),
            config.relay.clone(),
        )
        .spawn()?;

        let service = Arc::new(ReconciliationService::new(
            ServiceDependencies {
                tasks: stores.tasks,
                discrepancies: stores.discrepancies,
                reports: stores.reports,
                internal,
                external,
                publisher: publisher.clone(),
                ids: ids.clone(),
                clock: clock.clone(),
                retry,
            },
            config.reconciliation.clone(),
        ));

        let scheduler = ReconciliationScheduler::new(
            service.clone(),
            outbox.clone(),
            clock,
            jobs,
            config.outbox_retention,
        )
        .spawn()?;

        info!(node_id = config.node_id, "engine started");
        Ok(Self {
            publisher,
            service,
            outbox,
            ids,
            cancel,
            scheduler: Some(scheduler),
            relay: Some(relay),
            dispatcher: Some(dispatcher),
        })
    }

    /// Stop the scheduler and relay, then drain the memory queue.
    ///
    /// Backoff sleeps are interrupted, so events still queued in memory end
    /// up in the outbox rather than being lost.
    pub fn shutdown(mut self) {
        self.cancel.cancel();
        if let Some(scheduler) = self.scheduler.take() {
            scheduler.shutdown();
        }
        if let Some(relay) = self.relay.take() {
            let stats = relay.stats();
            relay.shutdown();
            info!(delivered = stats.delivered, dead_lettered = stats.dead_lettered, "outbox relay stopped");
        }
        if let Some(dispatcher) = self.dispatcher.take() {
            dispatcher.shutdown();
        }
        info!("engine stopped");
    }
}

#[cfg(feature = "redis")]
fn downstream_forwarder(
    config: &AppConfig,
    publishers: &mut Vec<AnyPublisher>,
) -> Result<Arc<dyn EventForwarder>, EngineError> {
    use crate::outbox::PublisherForwarder;
    use crate::publishing::{BrokerConfig, RedisBrokerPublisher};
    use orderflow_events::EventPublisher;

    let Some(url) = &config.redis_url else {
        return Ok(Arc::new(LoggingForwarder));
    };
    let broker = Arc::new(
        RedisBrokerPublisher::new("redis-broker", BrokerConfig::new(url.clone()))
            .map_err(|e| EngineError::Broker(e.to_string()))?,
    );
    publishers.push(AnyPublisher::Broker(broker.clone()));
    Ok(Arc::new(PublisherForwarder::new(broker as Arc<dyn EventPublisher>)))
}

#[cfg(not(feature = "redis"))]
fn downstream_forwarder(
    config: &AppConfig,
    _publishers: &mut Vec<AnyPublisher>,
) -> Result<Arc<dyn EventForwarder>, EngineError> {
    if config.redis_url.is_some() {
        warn!("REDIS_URL set but redis feature not enabled, events are only logged downstream");
    }
    Ok(Arc::new(LoggingForwarder))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use orderflow_events::{DomainEvent, EventPublisher, EventType};

    #[test]
    fn in_memory_engine_publishes_and_shuts_down() {
        let engine = Engine::build(&AppConfig::default(), None).unwrap();

        assert_eq!(engine.publisher.descriptors()[0].name, "hybrid");
        let event = DomainEvent::new(
            engine.ids.next_id().unwrap(),
            EventType::OrderCreated,
            r#"{"orderId":"1"}"#,
            Utc::now(),
        );
        assert!(engine.publisher.publish(&event));
        assert!(!engine.service.has_running_task().unwrap());

        engine.shutdown();
    }

    #[test]
    fn persistence_without_database_is_rejected() {
        let mut config = AppConfig::default();
        config.persistence.use_persistent_stores = true;
        config.persistence.database_url = Some("postgres://localhost/orderflow".into());
        assert!(matches!(
            Engine::build(&config, None),
            Err(EngineError::MissingDatabase)
        ));
    }
}

//! Integration tests across publishers, the outbox and reconciliation.
//!
//! Tests: Publisher → (MemoryQueue | Outbox) → Dispatcher / Relay → Forwarder
//!
//! Verifies:
//! - Events refused by the memory queue survive in the outbox and get delivered
//! - Concurrent relays never claim the same outbox row twice
//! - A reconciliation run publishes its lifecycle events through the selector

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::sync::{Arc, Barrier, Mutex};
    use std::thread;
    use std::time::{Duration, Instant};

    use chrono::{NaiveDate, Utc};

    use orderflow_core::{ManualClock, SnowflakeIdGenerator, SystemClock};
    use orderflow_events::{
        Destination, DomainEvent, EventPublisher, EventStatus, EventType, MemoryQueuePublisher,
        RecordingSleeper, RetryConfig, RetryableProcessor,
    };
    use orderflow_reconciliation::{
        DiscrepancyType, InMemoryReconciliationStore, LedgerRecord, ReconciliationConfig,
        ReconciliationService, ServiceDependencies, StaticLedger, TaskStatus, TaskType,
    };

    use crate::outbox::{
        DomainEventStore, EventForwarder, ForwardError, InMemoryDomainEventStore, OutboxPublisher,
        OutboxRelay, RelayConfig, RelayStats,
    };
    use crate::publishing::{AnyPublisher, HybridPublisher, PublisherSelector, QueueDispatcher};

    #[derive(Default)]
    struct RecordingForwarder {
        delivered: Mutex<Vec<(Destination, DomainEvent)>>,
    }

    impl RecordingForwarder {
        fn event_types(&self) -> Vec<EventType> {
            self.delivered
                .lock()
                .unwrap()
                .iter()
                .map(|(_, e)| e.event_type.clone())
                .collect()
        }

        fn count(&self) -> usize {
            self.delivered.lock().unwrap().len()
        }
    }

    impl EventForwarder for RecordingForwarder {
        fn forward(&self, event: &DomainEvent) -> Result<(), ForwardError> {
            let destination = Destination::for_event(&event.event_type);
            self.delivered.lock().unwrap().push((destination, event.clone()));
            Ok(())
        }
    }

    fn no_sleep_retry() -> RetryableProcessor {
        RetryableProcessor::with_sleeper(RetryConfig::default(), Arc::new(RecordingSleeper::new()))
    }

    fn relay(
        store: Arc<InMemoryDomainEventStore>,
        forwarder: Arc<RecordingForwarder>,
        batch_size: usize,
    ) -> OutboxRelay {
        OutboxRelay::new(
            store,
            forwarder,
            no_sleep_retry(),
            Arc::new(SystemClock),
            RelayConfig {
                batch_size,
                ..RelayConfig::default()
            },
        )
    }

    fn wait_until(mut done: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !done() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn hybrid_overflow_is_delivered_by_relay() {
        let ids = SnowflakeIdGenerator::new(1).unwrap();
        let store = InMemoryDomainEventStore::arc();
        let outbox = Arc::new(OutboxPublisher::new("outbox", store.clone()));
        let (memory, subscription) = MemoryQueuePublisher::new("memory", 2);
        let hybrid = HybridPublisher::new("hybrid", Arc::new(memory), outbox);

        let events: Vec<_> = (0..5)
            .map(|_| DomainEvent::new(ids.next_id().unwrap(), EventType::OrderCreated, "{}", Utc::now()))
            .collect();
        for event in &events {
            assert!(hybrid.publish(event));
        }

        assert_eq!(subscription.drain().len(), 2);
        assert_eq!(store.stats().unwrap().pending, 3);

        let forwarder = Arc::new(RecordingForwarder::default());
        let mut stats = RelayStats::default();
        assert_eq!(relay(store.clone(), forwarder.clone(), 10).run_once(&mut stats).unwrap(), 3);

        assert_eq!(stats.delivered, 3);
        assert_eq!(store.stats().unwrap().completed, 3);
        let delivered = forwarder.delivered.lock().unwrap();
        assert!(delivered.iter().all(|(d, _)| *d == Destination::OrderEvents));
        let delivered_ids: Vec<_> = delivered.iter().map(|(_, e)| e.id).collect();
        assert_eq!(delivered_ids, events[2..].iter().map(|e| e.id).collect::<Vec<_>>());
    }

    #[test]
    fn outbox_keeps_type_and_payload() {
        let store = InMemoryDomainEventStore::arc();
        let ids = SnowflakeIdGenerator::new(2).unwrap();
        let event = DomainEvent::new(
            ids.next_id().unwrap(),
            EventType::PaymentTimeout,
            r#"{"orderId":"42","amount":1999}"#,
            Utc::now(),
        )
        .with_aggregate_id("42");

        assert!(OutboxPublisher::new("outbox", store.clone()).publish(&event));

        let stored = store.find_by_id(event.id).unwrap().unwrap();
        assert_eq!(stored.event_type, EventType::PaymentTimeout);
        assert_eq!(stored.payload, event.payload);
        assert_eq!(stored.aggregate_id.as_deref(), Some("42"));
        assert_eq!(stored.status, EventStatus::Pending);
        assert_eq!(stored.retry_count, 0);
    }

    #[test]
    fn concurrent_relays_claim_each_row_once() {
        let store = InMemoryDomainEventStore::arc();
        let ids = SnowflakeIdGenerator::new(3).unwrap();
        for _ in 0..200 {
            let event = DomainEvent::new(ids.next_id().unwrap(), EventType::OrderPaid, "{}", Utc::now());
            store.append(&event).unwrap();
        }

        let workers = 8;
        let barrier = Arc::new(Barrier::new(workers));
        let handles: Vec<_> = (0..workers)
            .map(|_| {
                let store = store.clone();
                let barrier = barrier.clone();
                thread::spawn(move || {
                    barrier.wait();
                    let mut mine = Vec::new();
                    loop {
                        let batch = store.claim_batch(7, Utc::now()).unwrap();
                        if batch.is_empty() {
                            break;
                        }
                        mine.extend(batch.into_iter().map(|e| e.id));
                    }
                    mine
                })
            })
            .collect();

        let mut seen = HashSet::new();
        let mut total = 0;
        for handle in handles {
            for id in handle.join().unwrap() {
                total += 1;
                assert!(seen.insert(id), "event {id} claimed twice");
            }
        }
        assert_eq!(total, 200);
        assert_eq!(store.stats().unwrap().processing, 200);
    }

    #[test]
    fn selector_falls_back_to_outbox_when_queue_consumer_is_gone() {
        let store = InMemoryDomainEventStore::arc();
        let outbox = Arc::new(OutboxPublisher::new("outbox", store.clone()));
        let (memory, subscription) = MemoryQueuePublisher::new("memory", 16);
        let selector = PublisherSelector::new(
            "selector",
            vec![AnyPublisher::MemoryQueue(Arc::new(memory)), AnyPublisher::Outbox(outbox)],
        );
        drop(subscription);

        let ids = SnowflakeIdGenerator::new(4).unwrap();
        let event = DomainEvent::new(ids.next_id().unwrap(), EventType::OrderDelivered, "{}", Utc::now());
        assert!(selector.publish_sync(&event));
        assert_eq!(store.len(), 1);

        let forwarder = Arc::new(RecordingForwarder::default());
        let handle = OutboxRelay::new(
            store.clone(),
            forwarder.clone(),
            no_sleep_retry(),
            Arc::new(SystemClock),
            RelayConfig {
                poll_interval: Duration::from_millis(10),
                ..RelayConfig::default()
            },
        )
        .spawn()
        .unwrap();
        wait_until(|| forwarder.count() == 1);
        handle.shutdown();

        assert_eq!(forwarder.event_types(), vec![EventType::OrderDelivered]);
        assert_eq!(
            store.find_by_id(event.id).unwrap().unwrap().status,
            EventStatus::Completed
        );
    }

    #[test]
    fn reconciliation_run_publishes_lifecycle_through_dispatcher() {
        let day = NaiveDate::from_ymd_opt(2024, 6, 1).unwrap();
        let at = day.and_hms_opt(9, 30, 0).unwrap().and_utc();
        let clock = Arc::new(ManualClock::new(at));

        let outbox_store = InMemoryDomainEventStore::arc();
        let outbox = Arc::new(OutboxPublisher::new("outbox", outbox_store.clone()));
        let (memory, subscription) = MemoryQueuePublisher::new("memory", 64);
        let memory = Arc::new(memory);
        let hybrid = Arc::new(HybridPublisher::new("hybrid", memory.clone(), outbox.clone()));
        let selector = Arc::new(PublisherSelector::new(
            "selector",
            vec![
                AnyPublisher::Hybrid(hybrid),
                AnyPublisher::MemoryQueue(memory),
                AnyPublisher::Outbox(outbox),
            ],
        ));

        let forwarder = Arc::new(RecordingForwarder::default());
        let dispatcher = QueueDispatcher::new(
            "dispatcher",
            subscription,
            forwarder.clone(),
            outbox_store.clone(),
            no_sleep_retry(),
        )
        .with_poll_interval(Duration::from_millis(10))
        .spawn()
        .unwrap();

        let store = InMemoryReconciliationStore::arc();
        let internal = StaticLedger::arc("internal");
        let external = StaticLedger::arc("wechat");
        internal.insert(TaskType::Payment, LedgerRecord::new("A", 100, "SUCCESS", at));
        internal.insert(TaskType::Payment, LedgerRecord::new("B", 200, "SUCCESS", at));
        external.insert(TaskType::Payment, LedgerRecord::new("A", 100, "SUCCESS", at));
        external.insert(TaskType::Payment, LedgerRecord::new("C", 50, "SUCCESS", at));

        let service = ReconciliationService::new(
            ServiceDependencies {
                tasks: store.clone(),
                discrepancies: store.clone(),
                reports: store.clone(),
                internal,
                external,
                publisher: selector,
                ids: Arc::new(SnowflakeIdGenerator::new(5).unwrap()),
                clock,
                retry: no_sleep_retry(),
            },
            ReconciliationConfig::default(),
        );

        let task = service.create_payment_reconciliation_task(day).unwrap();
        let done = service.execute_task(task.task_id).unwrap();
        assert_eq!(done.status, TaskStatus::Success);

        let mut found: Vec<_> = service
            .get_discrepancies(task.task_id)
            .unwrap()
            .into_iter()
            .map(|d| (d.record_key, d.discrepancy_type))
            .collect();
        found.sort_by(|a, b| a.0.cmp(&b.0));
        assert_eq!(
            found,
            vec![
                ("B".to_string(), DiscrepancyType::Missing),
                ("C".to_string(), DiscrepancyType::Extra),
            ]
        );

        dispatcher.shutdown();
        let types = forwarder.event_types();
        assert!(types.contains(&EventType::ReconciliationStarted));
        assert!(types.contains(&EventType::ReconciliationCompleted));
        assert!(types.contains(&EventType::ReconciliationAlert));
        assert!(outbox_store.is_empty());
    }
}

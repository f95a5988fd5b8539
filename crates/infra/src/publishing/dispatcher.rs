//! Consumer for the in-process memory queue.
//!
//! Events taken off the queue are forwarded with retry; an event that still
//! cannot be forwarded is written to the outbox so the relay picks it up.

use std::sync::{mpsc, Arc, Mutex};
use std::thread;
use std::time::Duration;

use tracing::{error, info, warn};

use orderflow_events::{DomainEvent, RetryableProcessor, Subscription};

use crate::outbox::{DomainEventStore, EventForwarder};

#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct DispatcherStats {
    pub dispatched: u64,
    pub spilled_to_outbox: u64,
    pub lost: u64,
}

#[derive(Debug)]
pub struct DispatcherHandle {
    shutdown: mpsc::Sender<()>,
    join: Option<thread::JoinHandle<()>>,
    stats: Arc<Mutex<DispatcherStats>>,
}

impl DispatcherHandle {
    /// Drain what is already queued, then stop.
    pub fn shutdown(mut self) {
        let _ = self.shutdown.send(());
        if let Some(j) = self.join.take() {
            let _ = j.join();
        }
    }

    pub fn stats(&self) -> DispatcherStats {
        self.stats.lock().map(|s| s.clone()).unwrap_or_default()
    }
}

pub struct QueueDispatcher {
    name: String,
    subscription: Subscription<DomainEvent>,
    forwarder: Arc<dyn EventForwarder>,
    outbox: Arc<dyn DomainEventStore>,
    retry: RetryableProcessor,
    poll_interval: Duration,
}

impl QueueDispatcher {
    pub fn new(
        name: impl Into<String>,
        subscription: Subscription<DomainEvent>,
        forwarder: Arc<dyn EventForwarder>,
        outbox: Arc<dyn DomainEventStore>,
        retry: RetryableProcessor,
    ) -> Self {
        Self {
            name: name.into(),
            subscription,
            forwarder,
            outbox,
            retry,
            poll_interval: Duration::from_millis(200),
        }
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    fn handle(&self, event: &DomainEvent, stats: &mut DispatcherStats) {
        let delivered = self
            .retry
            .process_with_retry(event, |e| self.forwarder.forward(e));
        if delivered {
            stats.dispatched += 1;
            return;
        }

        match self.outbox.append(event) {
            Ok(()) => {
                stats.spilled_to_outbox += 1;
                warn!(dispatcher = %self.name, event_id = %event.id, "forward failed, event moved to outbox");
            }
            Err(e) => {
                stats.lost += 1;
                error!(
                    dispatcher = %self.name,
                    event_id = %event.id,
                    event_type = %event.event_type,
                    error = %e,
                    "event could not be forwarded or stored"
                );
            }
        }
    }

    pub fn spawn(self) -> std::io::Result<DispatcherHandle> {
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();
        let stats = Arc::new(Mutex::new(DispatcherStats::default()));
        let stats_clone = stats.clone();

        let join = thread::Builder::new()
            .name(self.name.clone())
            .spawn(move || dispatcher_loop(self, shutdown_rx, stats_clone))?;

        Ok(DispatcherHandle {
            shutdown: shutdown_tx,
            join: Some(join),
            stats,
        })
    }
}

fn dispatcher_loop(
    dispatcher: QueueDispatcher,
    shutdown_rx: mpsc::Receiver<()>,
    stats: Arc<Mutex<DispatcherStats>>,
) {
    info!(dispatcher = %dispatcher.name, "memory queue dispatcher started");

    loop {
        let stopping = !matches!(shutdown_rx.try_recv(), Err(mpsc::TryRecvError::Empty));

        let mut round = DispatcherStats::default();
        let mut disconnected = false;
        if stopping {
            for event in dispatcher.subscription.drain() {
                dispatcher.handle(&event, &mut round);
            }
        } else {
            match dispatcher.subscription.recv_timeout(dispatcher.poll_interval) {
                Ok(event) => dispatcher.handle(&event, &mut round),
                Err(mpsc::RecvTimeoutError::Timeout) => {}
                Err(mpsc::RecvTimeoutError::Disconnected) => disconnected = true,
            }
        }

        if let Ok(mut s) = stats.lock() {
            s.dispatched += round.dispatched;
            s.spilled_to_outbox += round.spilled_to_outbox;
            s.lost += round.lost;
        }

        if stopping || disconnected {
            break;
        }
    }

    info!(dispatcher = %dispatcher.name, "memory queue dispatcher stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::outbox::{ForwardError, InMemoryDomainEventStore};
    use chrono::Utc;
    use orderflow_core::SnowflakeId;
    use orderflow_events::{
        EventPublisher, EventStatus, EventType, MemoryQueuePublisher, RecordingSleeper, RetryConfig,
    };
    use std::time::Instant;

    struct Rejecting;

    impl EventForwarder for Rejecting {
        fn forward(&self, _event: &DomainEvent) -> Result<(), ForwardError> {
            Err(ForwardError::Failed("down".into()))
        }
    }

    fn retry() -> RetryableProcessor {
        RetryableProcessor::with_sleeper(
            RetryConfig::new(2, Duration::from_millis(1), 2.0, Duration::from_millis(2)),
            Arc::new(RecordingSleeper::new()),
        )
    }

    #[test]
    fn undeliverable_events_spill_to_outbox() {
        let store = InMemoryDomainEventStore::arc();
        let (memory, subscription) = MemoryQueuePublisher::new("memory", 8);
        let dispatcher = QueueDispatcher::new(
            "dispatcher",
            subscription,
            Arc::new(Rejecting),
            store.clone(),
            retry(),
        )
        .with_poll_interval(Duration::from_millis(10));
        let handle = dispatcher.spawn().unwrap();

        let event = DomainEvent::new(SnowflakeId::from_raw(5), EventType::OrderCreated, "{}", Utc::now());
        assert!(memory.publish(&event));

        let deadline = Instant::now() + Duration::from_secs(5);
        while handle.stats().spilled_to_outbox < 1 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        handle.shutdown();

        let stored = store.find_by_id(event.id).unwrap().unwrap();
        assert_eq!(stored.status, EventStatus::Pending);
    }

    #[test]
    fn shutdown_drains_queued_events() {
        let store = InMemoryDomainEventStore::arc();
        let (memory, subscription) = MemoryQueuePublisher::new("memory", 8);
        for id in 1..=3 {
            let event = DomainEvent::new(SnowflakeId::from_raw(id), EventType::OrderPaid, "{}", Utc::now());
            assert!(memory.publish(&event));
        }

        let dispatcher = QueueDispatcher::new(
            "dispatcher",
            subscription,
            Arc::new(crate::outbox::LoggingForwarder),
            store.clone(),
            retry(),
        );
        let handle = dispatcher.spawn().unwrap();
        handle.shutdown();

        // Everything queued before the stop signal was forwarded, none spilled.
        assert!(store.is_empty());
        // The consumer side is gone once the thread exits.
        let late = DomainEvent::new(SnowflakeId::from_raw(9), EventType::OrderPaid, "{}", Utc::now());
        assert!(!memory.publish(&late));
    }
}

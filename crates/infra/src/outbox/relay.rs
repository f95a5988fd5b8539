//! Outbox relay: drains pending outbox rows to the downstream transport.

use std::sync::{mpsc, Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tracing::{debug, error, info, warn};

use orderflow_core::Clock;
use orderflow_events::{
    Destination, DomainEvent, EventPublisher, RetryError, RetryableProcessor,
};

use super::store::{DomainEventStore, OutboxStoreError};

/// Final hop for an event leaving the outbox.
pub trait EventForwarder: Send + Sync {
    fn forward(&self, event: &DomainEvent) -> Result<(), ForwardError>;
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum ForwardError {
    #[error("rejected by {0}")]
    Rejected(String),
    #[error("forward failed: {0}")]
    Failed(String),
}

/// Forwards through a publisher's synchronous path (e.g. the broker).
pub struct PublisherForwarder {
    inner: Arc<dyn EventPublisher>,
}

impl PublisherForwarder {
    pub fn new(inner: Arc<dyn EventPublisher>) -> Self {
        Self { inner }
    }
}

impl EventForwarder for PublisherForwarder {
    fn forward(&self, event: &DomainEvent) -> Result<(), ForwardError> {
        if self.inner.publish_sync(event) {
            Ok(())
        } else {
            Err(ForwardError::Rejected(self.inner.name().to_string()))
        }
    }
}

/// Local sink used when no broker is configured: records the routing decision.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingForwarder;

impl EventForwarder for LoggingForwarder {
    fn forward(&self, event: &DomainEvent) -> Result<(), ForwardError> {
        info!(
            event_id = %event.id,
            event_type = %event.event_type,
            destination = %Destination::for_event(&event.event_type),
            "event dispatched"
        );
        Ok(())
    }
}

impl<F: EventForwarder + ?Sized> EventForwarder for Arc<F> {
    fn forward(&self, event: &DomainEvent) -> Result<(), ForwardError> {
        (**self).forward(event)
    }
}

#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub name: String,
    pub batch_size: usize,
    pub poll_interval: Duration,
    /// Number of times a failed event is re-armed before it stays `FAILED`.
    pub max_retries: u32,
    /// Delay before re-arm `n` (0-based); the last entry repeats.
    pub backoff: Vec<Duration>,
    /// `PROCESSING` claims untouched for this long are handed out again.
    pub stale_after: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            name: "outbox-relay".to_string(),
            batch_size: 100,
            poll_interval: Duration::from_secs(1),
            max_retries: 5,
            backoff: vec![
                Duration::from_secs(60),
                Duration::from_secs(5 * 60),
                Duration::from_secs(15 * 60),
                Duration::from_secs(60 * 60),
                Duration::from_secs(6 * 60 * 60),
            ],
            stale_after: Duration::from_secs(300),
        }
    }
}

impl RelayConfig {
    /// When an event that has already been re-armed `retry_count` times should
    /// run again, or `None` once the budget is spent.
    pub fn next_run_at(&self, retry_count: u32, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        if retry_count >= self.max_retries {
            return None;
        }
        let delay = self
            .backoff
            .get(retry_count as usize)
            .or(self.backoff.last())
            .copied()
            .unwrap_or(self.poll_interval);
        Some(now + chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::zero()))
    }
}

/// Relay runtime statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct RelayStats {
    pub claimed: u64,
    pub delivered: u64,
    pub rearmed: u64,
    pub dead_lettered: u64,
    pub released: u64,
    pub store_errors: u64,
    pub uptime_secs: u64,
}

impl RelayStats {
    fn absorb(&mut self, other: &RelayStats) {
        self.claimed += other.claimed;
        self.delivered += other.delivered;
        self.rearmed += other.rearmed;
        self.dead_lettered += other.dead_lettered;
        self.released += other.released;
        self.store_errors += other.store_errors;
    }
}

/// Handle to control a running relay.
#[derive(Debug)]
pub struct RelayHandle {
    shutdown: mpsc::Sender<()>,
    join: Option<thread::JoinHandle<()>>,
    stats: Arc<Mutex<RelayStats>>,
}

impl RelayHandle {
    /// Stop after the batch in flight and wait for the thread.
    pub fn shutdown(mut self) {
        let _ = self.shutdown.send(());
        if let Some(j) = self.join.take() {
            let _ = j.join();
        }
    }

    pub fn stats(&self) -> RelayStats {
        self.stats.lock().map(|s| s.clone()).unwrap_or_default()
    }
}

pub struct OutboxRelay {
    store: Arc<dyn DomainEventStore>,
    forwarder: Arc<dyn EventForwarder>,
    retry: RetryableProcessor,
    clock: Arc<dyn Clock>,
    config: RelayConfig,
}

impl OutboxRelay {
    pub fn new(
        store: Arc<dyn DomainEventStore>,
        forwarder: Arc<dyn EventForwarder>,
        retry: RetryableProcessor,
        clock: Arc<dyn Clock>,
        config: RelayConfig,
    ) -> Self {
        Self {
            store,
            forwarder,
            retry,
            clock,
            config,
        }
    }

    /// One poll: release stale claims, claim a batch, deliver it.
    ///
    /// Returns the number of events claimed.
    pub fn run_once(&self, stats: &mut RelayStats) -> Result<usize, OutboxStoreError> {
        let now = self.clock.now();
        let stale_before =
            now - chrono::Duration::from_std(self.config.stale_after).unwrap_or(chrono::Duration::zero());
        let released = self.store.release_stale(stale_before, now)?;
        if released > 0 {
            warn!(relay = %self.config.name, released, "released stale outbox claims");
            stats.released += released as u64;
        }

        let batch = self.store.claim_batch(self.config.batch_size, now)?;
        stats.claimed += batch.len() as u64;
        for event in &batch {
            if let Err(e) = self.deliver(event, stats) {
                stats.store_errors += 1;
                error!(relay = %self.config.name, event_id = %event.id, error = %e, "failed to record delivery outcome");
            }
        }
        Ok(batch.len())
    }

    fn deliver(&self, event: &DomainEvent, stats: &mut RelayStats) -> Result<(), OutboxStoreError> {
        let outcome = self
            .retry
            .execute(event.event_type.as_str(), |_| self.forwarder.forward(event));

        let now = self.clock.now();
        match outcome {
            Ok(()) => {
                self.store.mark_completed(event.id, now)?;
                stats.delivered += 1;
                debug!(relay = %self.config.name, event_id = %event.id, "event delivered");
            }
            Err(RetryError::Interrupted { last, .. }) => {
                // Shutdown cut the backoff short.
                self.store.release(event.id, now)?;
                stats.released += 1;
                info!(
                    relay = %self.config.name,
                    event_id = %event.id,
                    error = %last,
                    "delivery interrupted, claim released"
                );
            }
            Err(err) => {
                let message = err.last_error().to_string();
                let next = self.config.next_run_at(event.retry_count, now);
                self.store.mark_failed(event.id, &message, next, now)?;
                match next {
                    Some(at) => {
                        stats.rearmed += 1;
                        warn!(
                            relay = %self.config.name,
                            event_id = %event.id,
                            retry_count = event.retry_count + 1,
                            next_run_at = %at,
                            error = %message,
                            "delivery failed, event re-armed"
                        );
                    }
                    None => {
                        stats.dead_lettered += 1;
                        error!(
                            relay = %self.config.name,
                            event_id = %event.id,
                            event_type = %event.event_type,
                            retry_count = event.retry_count,
                            error = %message,
                            "event dead-lettered"
                        );
                    }
                }
            }
        }
        Ok(())
    }

    /// Spawn the relay in a background thread.
    pub fn spawn(self) -> std::io::Result<RelayHandle> {
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();
        let stats = Arc::new(Mutex::new(RelayStats::default()));
        let stats_clone = stats.clone();

        let join = thread::Builder::new()
            .name(self.config.name.clone())
            .spawn(move || relay_loop(self, shutdown_rx, stats_clone))?;

        Ok(RelayHandle {
            shutdown: shutdown_tx,
            join: Some(join),
            stats,
        })
    }
}

fn relay_loop(relay: OutboxRelay, shutdown_rx: mpsc::Receiver<()>, stats: Arc<Mutex<RelayStats>>) {
    info!(relay = %relay.config.name, "outbox relay started");
    let start_time = Instant::now();

    loop {
        let mut round = RelayStats::default();
        let claimed = match relay.run_once(&mut round) {
            Ok(n) => n,
            Err(e) => {
                error!(relay = %relay.config.name, error = %e, "outbox poll failed");
                round.store_errors += 1;
                0
            }
        };

        if let Ok(mut s) = stats.lock() {
            s.absorb(&round);
            s.uptime_secs = start_time.elapsed().as_secs();
        }

        // A full batch means there is probably more waiting.
        let wait = if claimed >= relay.config.batch_size {
            Duration::ZERO
        } else {
            relay.config.poll_interval
        };
        match shutdown_rx.recv_timeout(wait) {
            Err(mpsc::RecvTimeoutError::Timeout) => {}
            _ => break,
        }
    }

    info!(relay = %relay.config.name, "outbox relay stopped");
}

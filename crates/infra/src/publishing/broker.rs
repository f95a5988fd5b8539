//! Redis Streams broker publisher.
//!
//! Each [`Destination`] is its own stream (`orderflow:order-events`, ...).
//!
//! - `publish`: `XADD` and return once Redis has the entry
//! - `publish_sync`: `XADD` then `WAIT <replicas> <timeout>`, so the call
//!   blocks until the write is acknowledged by the configured replicas; an
//!   unacknowledged entry is removed again with `XDEL` before reporting failure
//! - the event is serialized before any I/O; a serialization failure never
//!   leaves a partial message behind

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, instrument, warn};

use orderflow_events::{Destination, DomainEvent, EventPublisher, PublisherKind};

pub const BROKER_PRIORITY: i32 = 1;

const DEFAULT_STREAM_PREFIX: &str = "orderflow";

#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("redis connection error: {0}")]
    Connection(String),

    #[error("redis command error: {0}")]
    Command(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("write acknowledged by {acked} of {required} replicas")]
    NotReplicated { acked: u64, required: u64 },
}

#[derive(Debug, Clone)]
pub struct BrokerConfig {
    pub url: String,
    pub stream_prefix: String,
    /// Replicas `publish_sync` waits for; 0 only confirms the primary write.
    pub replicas: u64,
    pub ack_timeout: Duration,
    pub connect_timeout: Duration,
}

impl BrokerConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            stream_prefix: DEFAULT_STREAM_PREFIX.to_string(),
            replicas: 0,
            ack_timeout: Duration::from_secs(5),
            connect_timeout: Duration::from_secs(2),
        }
    }
}

/// The stream commands the publisher issues.
trait StreamCommands {
    fn xadd(&mut self, stream: &str, fields: &[(&str, &str)]) -> Result<String, BrokerError>;
    /// Number of replicas that acknowledged the preceding writes.
    fn wait(&mut self, replicas: u64, timeout: Duration) -> Result<u64, BrokerError>;
    fn xdel(&mut self, stream: &str, entry_id: &str) -> Result<(), BrokerError>;
}

impl StreamCommands for redis::Connection {
    fn xadd(&mut self, stream: &str, fields: &[(&str, &str)]) -> Result<String, BrokerError> {
        let mut cmd = redis::cmd("XADD");
        cmd.arg(stream).arg("*");
        for (field, value) in fields {
            cmd.arg(*field).arg(*value);
        }
        cmd.query(self)
            .map_err(|e| BrokerError::Command(format!("XADD failed: {e}")))
    }

    fn wait(&mut self, replicas: u64, timeout: Duration) -> Result<u64, BrokerError> {
        redis::cmd("WAIT")
            .arg(replicas)
            .arg(timeout.as_millis() as u64)
            .query(self)
            .map_err(|e| BrokerError::Command(format!("WAIT failed: {e}")))
    }

    fn xdel(&mut self, stream: &str, entry_id: &str) -> Result<(), BrokerError> {
        let _: u64 = redis::cmd("XDEL")
            .arg(stream)
            .arg(entry_id)
            .query(self)
            .map_err(|e| BrokerError::Command(format!("XDEL failed: {e}")))?;
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct RedisBrokerPublisher {
    name: String,
    client: Arc<redis::Client>,
    config: BrokerConfig,
}

impl RedisBrokerPublisher {
    pub fn new(name: impl Into<String>, config: BrokerConfig) -> Result<Self, BrokerError> {
        let client = redis::Client::open(config.url.as_str())
            .map_err(|e| BrokerError::Connection(e.to_string()))?;
        Ok(Self {
            name: name.into(),
            client: Arc::new(client),
            config,
        })
    }

    pub fn stream_key(&self, destination: Destination) -> String {
        format!("{}:{}", self.config.stream_prefix, destination.as_str())
    }

    fn connection(&self) -> Result<redis::Connection, BrokerError> {
        self.client
            .get_connection_with_timeout(self.config.connect_timeout)
            .map_err(|e| BrokerError::Connection(e.to_string()))
    }

    /// Append the event to its destination stream; returns the stream entry id.
    #[instrument(
        skip(self, event),
        fields(event_id = %event.id, event_type = %event.event_type),
        err
    )]
    pub fn send(&self, event: &DomainEvent, wait_for_ack: bool) -> Result<String, BrokerError> {
        let body = serde_json::to_string(event)
            .map_err(|e| BrokerError::Serialization(e.to_string()))?;
        let mut conn = self.connection()?;
        self.send_on(&mut conn, event, &body, wait_for_ack)
    }

    fn send_on<C: StreamCommands>(
        &self,
        conn: &mut C,
        event: &DomainEvent,
        body: &str,
        wait_for_ack: bool,
    ) -> Result<String, BrokerError> {
        let stream = self.stream_key(Destination::for_event(&event.event_type));
        let event_id = event.id.to_string();
        let entry_id = conn.xadd(
            &stream,
            &[
                ("event_id", event_id.as_str()),
                ("event_type", event.event_type.as_str()),
                ("payload", body),
            ],
        )?;

        if wait_for_ack {
            let acked = conn.wait(self.config.replicas, self.config.ack_timeout);
            let failure = match acked {
                Ok(acked) if acked >= self.config.replicas => None,
                Ok(acked) => Some(BrokerError::NotReplicated {
                    acked,
                    required: self.config.replicas,
                }),
                Err(e) => Some(e),
            };
            if let Some(failure) = failure {
                if let Err(e) = conn.xdel(&stream, &entry_id) {
                    error!(stream = %stream, entry_id = %entry_id, error = %e, "failed to remove unacknowledged entry");
                }
                return Err(failure);
            }
        }

        debug!(stream = %stream, entry_id = %entry_id, "event appended to stream");
        Ok(entry_id)
    }

    pub fn ping(&self) -> Result<(), BrokerError> {
        let mut conn = self.connection()?;
        let _: String = redis::cmd("PING")
            .query(&mut conn)
            .map_err(|e| BrokerError::Command(format!("PING failed: {e}")))?;
        Ok(())
    }
}

impl EventPublisher for RedisBrokerPublisher {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> PublisherKind {
        PublisherKind::Broker
    }

    fn priority(&self) -> i32 {
        BROKER_PRIORITY
    }

    fn is_available(&self) -> bool {
        match self.ping() {
            Ok(()) => true,
            Err(e) => {
                warn!(publisher = %self.name, error = %e, "broker unavailable");
                false
            }
        }
    }

    fn publish(&self, event: &DomainEvent) -> bool {
        match self.send(event, false) {
            Ok(_) => true,
            Err(e) => {
                error!(publisher = %self.name, event_id = %event.id, error = %e, "broker publish failed");
                false
            }
        }
    }

    fn publish_sync(&self, event: &DomainEvent) -> bool {
        match self.send(event, true) {
            Ok(_) => true,
            Err(e) => {
                error!(publisher = %self.name, event_id = %event.id, error = %e, "broker publish failed");
                false
            }
        }
    }
}

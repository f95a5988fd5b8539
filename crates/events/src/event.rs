//! Durable domain event record.

use core::fmt;
use core::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use orderflow_core::{DomainError, DomainResult, SnowflakeId};

/// Kind of fact an event records.
///
/// Unknown tags coming back from storage are kept verbatim in [`EventType::Other`]
/// so they still route (to the default destination) instead of failing to load.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum EventType {
    OrderCreated,
    OrderPaid,
    OrderCancelled,
    OrderDelivered,
    OrderAssigned,
    PaymentTimeout,
    DeliveryTimeout,
    DailyReconciliationStarted,
    ReconciliationStarted,
    ReconciliationCompleted,
    ReconciliationFailed,
    ReconciliationAlert,
    DiscrepancyResolved,
    Other(String),
}

impl EventType {
    pub fn as_str(&self) -> &str {
        match self {
            EventType::OrderCreated => "ORDER_CREATED",
            EventType::OrderPaid => "ORDER_PAID",
            EventType::OrderCancelled => "ORDER_CANCELLED",
            EventType::OrderDelivered => "ORDER_DELIVERED",
            EventType::OrderAssigned => "ORDER_ASSIGNED",
            EventType::PaymentTimeout => "PAYMENT_TIMEOUT",
            EventType::DeliveryTimeout => "DELIVERY_TIMEOUT",
            EventType::DailyReconciliationStarted => "DAILY_RECONCILIATION_STARTED",
            EventType::ReconciliationStarted => "RECONCILIATION_STARTED",
            EventType::ReconciliationCompleted => "RECONCILIATION_COMPLETED",
            EventType::ReconciliationFailed => "RECONCILIATION_FAILED",
            EventType::ReconciliationAlert => "RECONCILIATION_ALERT",
            EventType::DiscrepancyResolved => "DISCREPANCY_RESOLVED",
            EventType::Other(s) => s,
        }
    }
}

impl From<&str> for EventType {
    fn from(value: &str) -> Self {
        match value {
            "ORDER_CREATED" => EventType::OrderCreated,
            "ORDER_PAID" => EventType::OrderPaid,
            "ORDER_CANCELLED" => EventType::OrderCancelled,
            "ORDER_DELIVERED" => EventType::OrderDelivered,
            "ORDER_ASSIGNED" => EventType::OrderAssigned,
            "PAYMENT_TIMEOUT" => EventType::PaymentTimeout,
            "DELIVERY_TIMEOUT" => EventType::DeliveryTimeout,
            "DAILY_RECONCILIATION_STARTED" => EventType::DailyReconciliationStarted,
            "RECONCILIATION_STARTED" => EventType::ReconciliationStarted,
            "RECONCILIATION_COMPLETED" => EventType::ReconciliationCompleted,
            "RECONCILIATION_FAILED" => EventType::ReconciliationFailed,
            "RECONCILIATION_ALERT" => EventType::ReconciliationAlert,
            "DISCREPANCY_RESOLVED" => EventType::DiscrepancyResolved,
            other => EventType::Other(other.to_string()),
        }
    }
}

impl From<String> for EventType {
    fn from(value: String) -> Self {
        EventType::from(value.as_str())
    }
}

impl From<EventType> for String {
    fn from(value: EventType) -> Self {
        value.as_str().to_string()
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Delivery status of a stored event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl EventStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventStatus::Pending => "PENDING",
            EventStatus::Processing => "PROCESSING",
            EventStatus::Completed => "COMPLETED",
            EventStatus::Failed => "FAILED",
        }
    }
}

impl FromStr for EventStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(EventStatus::Pending),
            "PROCESSING" => Ok(EventStatus::Processing),
            "COMPLETED" => Ok(EventStatus::Completed),
            "FAILED" => Ok(EventStatus::Failed),
            other => Err(DomainError::validation(format!("unknown event status: {other}"))),
        }
    }
}

impl fmt::Display for EventStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A fact to be delivered to downstream consumers.
///
/// Status moves `PENDING -> PROCESSING -> {COMPLETED, FAILED}`. A `FAILED`
/// event may be re-armed to `PENDING` for another attempt, and a
/// `PROCESSING` event abandoned by a crashed worker may be released back to
/// `PENDING`. Every other transition is rejected.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DomainEvent {
    pub id: SnowflakeId,
    pub event_type: EventType,
    /// Business identifier the event refers to (order id, task id, ...).
    pub aggregate_id: Option<String>,
    /// Serialized JSON payload.
    pub payload: String,
    pub status: EventStatus,
    pub retry_count: u32,
    pub next_run_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl DomainEvent {
    /// Create a new `PENDING` event with an already serialized payload.
    pub fn new(
        id: SnowflakeId,
        event_type: EventType,
        payload: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            event_type,
            aggregate_id: None,
            payload: payload.into(),
            status: EventStatus::Pending,
            retry_count: 0,
            next_run_at: None,
            error_message: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Create a new `PENDING` event, serializing `payload` to JSON.
    pub fn from_payload<P: Serialize>(
        id: SnowflakeId,
        event_type: EventType,
        payload: &P,
        now: DateTime<Utc>,
    ) -> DomainResult<Self> {
        let json = serde_json::to_string(payload)
            .map_err(|e| DomainError::validation(format!("event payload: {e}")))?;
        Ok(Self::new(id, event_type, json, now))
    }

    pub fn with_aggregate_id(mut self, aggregate_id: impl Into<String>) -> Self {
        self.aggregate_id = Some(aggregate_id.into());
        self
    }

    /// Parse the payload back into JSON.
    pub fn payload_json(&self) -> DomainResult<serde_json::Value> {
        serde_json::from_str(&self.payload)
            .map_err(|e| DomainError::validation(format!("event payload: {e}")))
    }

    /// Whether the event is pending and its scheduled run time has arrived.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.status == EventStatus::Pending && self.next_run_at.is_none_or(|at| at <= now)
    }

    pub fn mark_processing(&mut self, now: DateTime<Utc>) -> DomainResult<()> {
        self.transition(EventStatus::Pending, EventStatus::Processing, now)
    }

    pub fn mark_completed(&mut self, now: DateTime<Utc>) -> DomainResult<()> {
        self.transition(EventStatus::Processing, EventStatus::Completed, now)?;
        self.error_message = None;
        self.next_run_at = None;
        Ok(())
    }

    pub fn mark_failed(&mut self, error: impl Into<String>, now: DateTime<Utc>) -> DomainResult<()> {
        self.transition(EventStatus::Processing, EventStatus::Failed, now)?;
        self.error_message = Some(error.into());
        Ok(())
    }

    /// Put a `FAILED` event back in the queue for another attempt at `next_run_at`.
    pub fn rearm(&mut self, next_run_at: DateTime<Utc>, now: DateTime<Utc>) -> DomainResult<()> {
        self.transition(EventStatus::Failed, EventStatus::Pending, now)?;
        self.retry_count += 1;
        self.next_run_at = Some(next_run_at);
        Ok(())
    }

    /// Return an abandoned `PROCESSING` claim to the queue.
    pub fn release(&mut self, now: DateTime<Utc>) -> DomainResult<()> {
        self.transition(EventStatus::Processing, EventStatus::Pending, now)
    }

    fn transition(
        &mut self,
        from: EventStatus,
        to: EventStatus,
        now: DateTime<Utc>,
    ) -> DomainResult<()> {
        if self.status != from {
            return Err(DomainError::invariant(format!(
                "event {}: cannot move from {} to {}",
                self.id, self.status, to
            )));
        }
        self.status = to;
        self.updated_at = now;
        Ok(())
    }
}

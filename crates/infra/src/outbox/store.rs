//! Outbox storage.

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};

use orderflow_core::SnowflakeId;
use orderflow_events::{DomainEvent, EventStatus};

/// Durable storage for [`DomainEvent`] rows.
pub trait DomainEventStore: Send + Sync {
    /// Persist a new event.
    fn append(&self, event: &DomainEvent) -> Result<(), OutboxStoreError>;

    /// Atomically move up to `limit` due `PENDING` events to `PROCESSING`,
    /// oldest id first. Two concurrent callers never receive the same event.
    fn claim_batch(
        &self,
        limit: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<DomainEvent>, OutboxStoreError>;

    fn mark_completed(&self, id: SnowflakeId, now: DateTime<Utc>) -> Result<(), OutboxStoreError>;

    /// Record a failed delivery.
    ///
    /// With `Some(next_run_at)` the event goes back to `PENDING` with
    /// `retry_count + 1`; with `None` it stays `FAILED` for good.
    fn mark_failed(
        &self,
        id: SnowflakeId,
        error: &str,
        next_run_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Result<(), OutboxStoreError>;

    /// Hand a `PROCESSING` claim back to `PENDING` without counting a retry.
    fn release(&self, id: SnowflakeId, now: DateTime<Utc>) -> Result<(), OutboxStoreError>;

    fn find_by_id(&self, id: SnowflakeId) -> Result<Option<DomainEvent>, OutboxStoreError>;

    fn list_by_status(
        &self,
        status: EventStatus,
        limit: usize,
    ) -> Result<Vec<DomainEvent>, OutboxStoreError>;

    /// Return `PROCESSING` claims last touched before `older_than` to `PENDING`.
    fn release_stale(
        &self,
        older_than: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<usize, OutboxStoreError>;

    /// Delete `COMPLETED` events last updated before `cutoff`.
    fn purge_completed_before(&self, cutoff: DateTime<Utc>) -> Result<usize, OutboxStoreError>;

    fn stats(&self) -> Result<OutboxStats, OutboxStoreError>;
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum OutboxStoreError {
    #[error("event not found: {0}")]
    NotFound(SnowflakeId),
    #[error("event already exists: {0}")]
    AlreadyExists(SnowflakeId),
    #[error("invalid transition: {0}")]
    InvalidTransition(String),
    #[error("storage error: {0}")]
    Storage(String),
}

/// Row counts per status.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct OutboxStats {
    pub pending: usize,
    pub processing: usize,
    pub completed: usize,
    pub failed: usize,
}

impl OutboxStats {
    fn count(&mut self, status: EventStatus) {
        match status {
            EventStatus::Pending => self.pending += 1,
            EventStatus::Processing => self.processing += 1,
            EventStatus::Completed => self.completed += 1,
            EventStatus::Failed => self.failed += 1,
        }
    }
}

/// In-memory outbox for tests/dev.
///
/// Claims hold the write lock for the whole scan, which is what makes them atomic.
#[derive(Debug, Default)]
pub struct InMemoryDomainEventStore {
    events: RwLock<BTreeMap<SnowflakeId, DomainEvent>>,
}

impl InMemoryDomainEventStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    pub fn len(&self) -> usize {
        self.events.read().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn write(
        &self,
    ) -> Result<std::sync::RwLockWriteGuard<'_, BTreeMap<SnowflakeId, DomainEvent>>, OutboxStoreError>
    {
        self.events
            .write()
            .map_err(|_| OutboxStoreError::Storage("outbox lock poisoned".into()))
    }

    fn read(
        &self,
    ) -> Result<std::sync::RwLockReadGuard<'_, BTreeMap<SnowflakeId, DomainEvent>>, OutboxStoreError>
    {
        self.events
            .read()
            .map_err(|_| OutboxStoreError::Storage("outbox lock poisoned".into()))
    }
}

fn invalid(err: orderflow_core::DomainError) -> OutboxStoreError {
    OutboxStoreError::InvalidTransition(err.to_string())
}

impl DomainEventStore for InMemoryDomainEventStore {
    fn append(&self, event: &DomainEvent) -> Result<(), OutboxStoreError> {
        let mut events = self.write()?;
        if events.contains_key(&event.id) {
            return Err(OutboxStoreError::AlreadyExists(event.id));
        }
        events.insert(event.id, event.clone());
        Ok(())
    }

    fn claim_batch(
        &self,
        limit: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<DomainEvent>, OutboxStoreError> {
        let mut events = self.write()?;
        let mut claimed = Vec::new();
        for event in events.values_mut() {
            if claimed.len() >= limit {
                break;
            }
            if event.is_due(now) {
                event.mark_processing(now).map_err(invalid)?;
                claimed.push(event.clone());
            }
        }
        Ok(claimed)
    }

    fn mark_completed(&self, id: SnowflakeId, now: DateTime<Utc>) -> Result<(), OutboxStoreError> {
        let mut events = self.write()?;
        let event = events.get_mut(&id).ok_or(OutboxStoreError::NotFound(id))?;
        event.mark_completed(now).map_err(invalid)
    }

    fn mark_failed(
        &self,
        id: SnowflakeId,
        error: &str,
        next_run_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Result<(), OutboxStoreError> {
        let mut events = self.write()?;
        let event = events.get_mut(&id).ok_or(OutboxStoreError::NotFound(id))?;
        event.mark_failed(error, now).map_err(invalid)?;
        if let Some(at) = next_run_at {
            event.rearm(at, now).map_err(invalid)?;
        }
        Ok(())
    }

    fn release(&self, id: SnowflakeId, now: DateTime<Utc>) -> Result<(), OutboxStoreError> {
        let mut events = self.write()?;
        let event = events.get_mut(&id).ok_or(OutboxStoreError::NotFound(id))?;
        event.release(now).map_err(invalid)
    }

    fn find_by_id(&self, id: SnowflakeId) -> Result<Option<DomainEvent>, OutboxStoreError> {
        Ok(self.read()?.get(&id).cloned())
    }

    fn list_by_status(
        &self,
        status: EventStatus,
        limit: usize,
    ) -> Result<Vec<DomainEvent>, OutboxStoreError> {
        Ok(self
            .read()?
            .values()
            .filter(|e| e.status == status)
            .take(limit)
            .cloned()
            .collect())
    }

    fn release_stale(
        &self,
        older_than: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<usize, OutboxStoreError> {
        let mut events = self.write()?;
        let mut released = 0;
        for event in events.values_mut() {
            if event.status == EventStatus::Processing && event.updated_at < older_than {
                event.release(now).map_err(invalid)?;
                released += 1;
            }
        }
        Ok(released)
    }

    fn purge_completed_before(&self, cutoff: DateTime<Utc>) -> Result<usize, OutboxStoreError> {
        let mut events = self.write()?;
        let before = events.len();
        events.retain(|_, e| !(e.status == EventStatus::Completed && e.updated_at < cutoff));
        Ok(before - events.len())
    }

    fn stats(&self) -> Result<OutboxStats, OutboxStoreError> {
        let mut stats = OutboxStats::default();
        for event in self.read()?.values() {
            stats.count(event.status);
        }
        Ok(stats)
    }
}

impl<S: DomainEventStore + ?Sized> DomainEventStore for Arc<S> {
    fn append(&self, event: &DomainEvent) -> Result<(), OutboxStoreError> {
        (**self).append(event)
    }

    fn claim_batch(
        &self,
        limit: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<DomainEvent>, OutboxStoreError> {
        (**self).claim_batch(limit, now)
    }

    fn mark_completed(&self, id: SnowflakeId, now: DateTime<Utc>) -> Result<(), OutboxStoreError> {
        (**self).mark_completed(id, now)
    }

    fn mark_failed(
        &self,
        id: SnowflakeId,
        error: &str,
        next_run_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Result<(), OutboxStoreError> {
        (**self).mark_failed(id, error, next_run_at, now)
    }

    fn release(&self, id: SnowflakeId, now: DateTime<Utc>) -> Result<(), OutboxStoreError> {
        (**self).release(id, now)
    }

    fn find_by_id(&self, id: SnowflakeId) -> Result<Option<DomainEvent>, OutboxStoreError> {
        (**self).find_by_id(id)
    }

    fn list_by_status(
        &self,
        status: EventStatus,
        limit: usize,
    ) -> Result<Vec<DomainEvent>, OutboxStoreError> {
        (**self).list_by_status(status, limit)
    }

    fn release_stale(
        &self,
        older_than: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<usize, OutboxStoreError> {
        (**self).release_stale(older_than, now)
    }

    fn purge_completed_before(&self, cutoff: DateTime<Utc>) -> Result<usize, OutboxStoreError> {
        (**self).purge_completed_before(cutoff)
    }

    fn stats(&self) -> Result<OutboxStats, OutboxStoreError> {
        (**self).stats()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use orderflow_events::EventType;

    fn event(id: i64, now: DateTime<Utc>) -> DomainEvent {
        DomainEvent::new(
            SnowflakeId::from_raw(id),
            EventType::OrderCreated,
            r#"{"orderId":1}"#,
            now,
        )
    }

    #[test]
    fn append_rejects_duplicate_id() {
        let store = InMemoryDomainEventStore::new();
        let now = Utc::now();
        store.append(&event(1, now)).unwrap();
        assert!(matches!(
            store.append(&event(1, now)),
            Err(OutboxStoreError::AlreadyExists(_))
        ));
    }

    #[test]
    fn claim_takes_oldest_due_first() {
        let store = InMemoryDomainEventStore::new();
        let now = Utc::now();
        for id in [3, 1, 2] {
            store.append(&event(id, now)).unwrap();
        }
        let mut later = event(0, now);
        later.next_run_at = Some(now + Duration::minutes(5));
        store.append(&later).unwrap();

        let claimed = store.claim_batch(2, now).unwrap();
        let ids: Vec<i64> = claimed.iter().map(|e| e.id.as_i64()).collect();
        assert_eq!(ids, vec![1, 2]);
        assert!(claimed.iter().all(|e| e.status == EventStatus::Processing));

        let rest = store.claim_batch(10, now).unwrap();
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].id.as_i64(), 3);
    }

    #[test]
    fn mark_failed_rearms_or_dead_letters() {
        let store = InMemoryDomainEventStore::new();
        let now = Utc::now();
        store.append(&event(1, now)).unwrap();
        store.append(&event(2, now)).unwrap();
        store.claim_batch(10, now).unwrap();

        let retry_at = now + Duration::minutes(1);
        store
            .mark_failed(SnowflakeId::from_raw(1), "broker down", Some(retry_at), now)
            .unwrap();
        store
            .mark_failed(SnowflakeId::from_raw(2), "poison", None, now)
            .unwrap();

        let rearmed = store.find_by_id(SnowflakeId::from_raw(1)).unwrap().unwrap();
        assert_eq!(rearmed.status, EventStatus::Pending);
        assert_eq!(rearmed.retry_count, 1);
        assert_eq!(rearmed.next_run_at, Some(retry_at));
        assert_eq!(rearmed.error_message.as_deref(), Some("broker down"));

        let dead = store.find_by_id(SnowflakeId::from_raw(2)).unwrap().unwrap();
        assert_eq!(dead.status, EventStatus::Failed);

        assert!(store.claim_batch(10, now).unwrap().is_empty());
        assert_eq!(store.claim_batch(10, retry_at).unwrap().len(), 1);
    }

    #[test]
    fn completing_unclaimed_event_is_rejected() {
        let store = InMemoryDomainEventStore::new();
        let now = Utc::now();
        store.append(&event(1, now)).unwrap();
        assert!(matches!(
            store.mark_completed(SnowflakeId::from_raw(1), now),
            Err(OutboxStoreError::InvalidTransition(_))
        ));
        assert!(matches!(
            store.mark_completed(SnowflakeId::from_raw(9), now),
            Err(OutboxStoreError::NotFound(_))
        ));
    }

    #[test]
    fn stale_claims_are_released_and_completed_purged() {
        let store = InMemoryDomainEventStore::new();
        let then = Utc::now() - Duration::hours(1);
        let now = Utc::now();
        store.append(&event(1, then)).unwrap();
        store.append(&event(2, then)).unwrap();
        store.claim_batch(10, then).unwrap();
        store.mark_completed(SnowflakeId::from_raw(2), then).unwrap();

        assert_eq!(store.release_stale(now - Duration::minutes(5), now).unwrap(), 1);
        assert_eq!(
            store.find_by_id(SnowflakeId::from_raw(1)).unwrap().unwrap().status,
            EventStatus::Pending
        );

        assert_eq!(store.purge_completed_before(now).unwrap(), 1);
        let stats = store.stats().unwrap();
        assert_eq!(stats, OutboxStats { pending: 1, ..Default::default() });
    }
}

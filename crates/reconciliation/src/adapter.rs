//! Ledger sources: the platform's own records and the payment provider's.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use thiserror::Error;

use crate::record::{DateRange, LedgerRecord};
use crate::task::TaskType;

/// Failure talking to the external payment provider.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AdapterError {
    #[error("provider request timed out: {0}")]
    Timeout(String),

    #[error("provider returned HTTP {status}: {message}")]
    Http { status: u16, message: String },

    #[error("provider transport error: {0}")]
    Transport(String),

    #[error("failed to decode provider response: {0}")]
    Decode(String),

    #[error("provider rate limit hit")]
    RateLimited,
}

/// Failure reading the internal ledger.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LedgerError {
    #[error("internal ledger unavailable: {0}")]
    Unavailable(String),
}

/// The payment provider's view of a business date.
pub trait ExternalLedgerAdapter: Send + Sync {
    fn name(&self) -> &str;

    fn fetch_transactions(
        &self,
        task_type: TaskType,
        range: &DateRange,
    ) -> Result<Vec<LedgerRecord>, AdapterError>;
}

/// The platform's own payment/refund/settlement ledger.
pub trait InternalLedgerSource: Send + Sync {
    fn fetch_records(
        &self,
        task_type: TaskType,
        range: &DateRange,
    ) -> Result<Vec<LedgerRecord>, LedgerError>;
}

impl<A: ExternalLedgerAdapter + ?Sized> ExternalLedgerAdapter for Arc<A> {
    fn name(&self) -> &str {
        (**self).name()
    }

    fn fetch_transactions(
        &self,
        task_type: TaskType,
        range: &DateRange,
    ) -> Result<Vec<LedgerRecord>, AdapterError> {
        (**self).fetch_transactions(task_type, range)
    }
}

impl<L: InternalLedgerSource + ?Sized> InternalLedgerSource for Arc<L> {
    fn fetch_records(
        &self,
        task_type: TaskType,
        range: &DateRange,
    ) -> Result<Vec<LedgerRecord>, LedgerError> {
        (**self).fetch_records(task_type, range)
    }
}

/// In-memory ledger for tests/dev; usable as either side.
#[derive(Debug, Default)]
pub struct StaticLedger {
    name: String,
    records: RwLock<HashMap<TaskType, Vec<LedgerRecord>>>,
}

impl StaticLedger {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            records: RwLock::new(HashMap::new()),
        }
    }

    pub fn arc(name: impl Into<String>) -> Arc<Self> {
        Arc::new(Self::new(name))
    }

    pub fn insert(&self, task_type: TaskType, record: LedgerRecord) {
        if let Ok(mut records) = self.records.write() {
            records.entry(task_type).or_default().push(record);
        }
    }

    pub fn extend(&self, task_type: TaskType, batch: impl IntoIterator<Item = LedgerRecord>) {
        if let Ok(mut records) = self.records.write() {
            records.entry(task_type).or_default().extend(batch);
        }
    }

    fn slice(&self, task_type: TaskType, range: &DateRange) -> Option<Vec<LedgerRecord>> {
        let records = self.records.read().ok()?;
        Some(
            records
                .get(&task_type)
                .map(|rs| {
                    rs.iter()
                        .filter(|r| range.contains(r.occurred_at))
                        .cloned()
                        .collect()
                })
                .unwrap_or_default(),
        )
    }
}

impl ExternalLedgerAdapter for StaticLedger {
    fn name(&self) -> &str {
        &self.name
    }

    fn fetch_transactions(
        &self,
        task_type: TaskType,
        range: &DateRange,
    ) -> Result<Vec<LedgerRecord>, AdapterError> {
        self.slice(task_type, range)
            .ok_or_else(|| AdapterError::Transport("ledger lock poisoned".into()))
    }
}

impl InternalLedgerSource for StaticLedger {
    fn fetch_records(
        &self,
        task_type: TaskType,
        range: &DateRange,
    ) -> Result<Vec<LedgerRecord>, LedgerError> {
        self.slice(task_type, range)
            .ok_or_else(|| LedgerError::Unavailable("ledger lock poisoned".into()))
    }
}

use std::time::Duration;

use orderflow_core::{DomainError, IdError};
use thiserror::Error;

use crate::adapter::{AdapterError, LedgerError};
use crate::discrepancy::DiscrepancyId;
use crate::repository::RepositoryError;
use crate::task::TaskId;

pub type ReconciliationResult<T> = Result<T, ReconciliationError>;

#[derive(Debug, Error)]
pub enum ReconciliationError {
    #[error(transparent)]
    Domain(#[from] DomainError),

    #[error(transparent)]
    Repository(#[from] RepositoryError),

    #[error("external ledger: {0}")]
    Adapter(#[from] AdapterError),

    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error(transparent)]
    Id(#[from] IdError),

    #[error("task {0} not found")]
    TaskNotFound(TaskId),

    #[error("discrepancy {0} not found")]
    DiscrepancyNotFound(DiscrepancyId),

    #[error("another reconciliation task is running")]
    AlreadyRunning,

    #[error("task timed out after {0:?}")]
    Timeout(Duration),

    #[error("reconciliation worker failed: {0}")]
    Worker(String),
}

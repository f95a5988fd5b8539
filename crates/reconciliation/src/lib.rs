//! Financial reconciliation: compare the platform's own ledger against an
//! external payment provider for one business date and track every
//! difference until someone (or an explicit rule) resolves it.

pub mod adapter;
pub mod comparison;
pub mod config;
pub mod discrepancy;
pub mod error;
pub mod in_memory;
pub mod record;
pub mod report;
pub mod repository;
pub mod rules;
pub mod service;
pub mod task;

pub use adapter::{AdapterError, ExternalLedgerAdapter, InternalLedgerSource, LedgerError, StaticLedger};
pub use comparison::{ComparisonOutcome, ComparisonSettings, Finding, compare};
pub use config::ReconciliationConfig;
pub use discrepancy::{
    Discrepancy, DiscrepancyId, DiscrepancyStatus, DiscrepancyType, RecordDetails, SourceSystem,
};
pub use error::{ReconciliationError, ReconciliationResult};
pub use in_memory::InMemoryReconciliationStore;
pub use record::{DateRange, LedgerRecord};
pub use report::ReconciliationReport;
pub use repository::{DiscrepancyRepository, ReportRepository, RepositoryError, TaskRepository};
pub use rules::{AmountToleranceRule, ResolutionRule};
pub use service::{CleanupSummary, ReconciliationService, ServiceDependencies};
pub use task::{ReconciliationTask, TaskId, TaskStatus, TaskType};

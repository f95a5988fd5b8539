//! Persistence contracts for tasks, discrepancies and reports.

use std::sync::Arc;

use chrono::{DateTime, NaiveDate, Utc};

use crate::discrepancy::{Discrepancy, DiscrepancyId};
use crate::report::ReconciliationReport;
use crate::task::{ReconciliationTask, TaskId};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RepositoryError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("storage error: {0}")]
    Storage(String),
}

/// Task storage. Owns the "at most one task RUNNING" guard.
pub trait TaskRepository: Send + Sync {
    /// Store a new `PENDING` task.
    fn insert(&self, task: &ReconciliationTask) -> Result<(), RepositoryError>;

    fn get(&self, task_id: TaskId) -> Result<Option<ReconciliationTask>, RepositoryError>;

    fn has_running(&self) -> Result<bool, RepositoryError>;

    /// Atomically store `task` already moved to `RUNNING`, unless some task is
    /// running. Returns `None` (and stores nothing) when the guard is held.
    fn create_running(
        &self,
        task: ReconciliationTask,
        now: DateTime<Utc>,
    ) -> Result<Option<ReconciliationTask>, RepositoryError>;

    /// Atomically move a stored `PENDING` task to `RUNNING` if no task is
    /// running. Returns `None` when the guard is held.
    fn try_start(
        &self,
        task_id: TaskId,
        now: DateTime<Utc>,
    ) -> Result<Option<ReconciliationTask>, RepositoryError>;

    /// Persist a finished task, only if the stored row is still `RUNNING`.
    ///
    /// Returns `false` when the task had already been closed (e.g. by a timeout).
    fn finish(&self, task: &ReconciliationTask) -> Result<bool, RepositoryError>;

    fn list_between(
        &self,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Vec<ReconciliationTask>, RepositoryError>;

    /// Delete `SUCCESS`/`FAILED` tasks created before `cutoff` that no
    /// discrepancy references any more.
    fn delete_closed_before(&self, cutoff: DateTime<Utc>) -> Result<usize, RepositoryError>;
}

pub trait DiscrepancyRepository: Send + Sync {
    fn insert_batch(&self, items: &[Discrepancy]) -> Result<(), RepositoryError>;

    fn get(&self, id: DiscrepancyId) -> Result<Option<Discrepancy>, RepositoryError>;

    fn list_by_task(&self, task_id: TaskId) -> Result<Vec<Discrepancy>, RepositoryError>;

    fn list_unresolved(&self, limit: usize) -> Result<Vec<Discrepancy>, RepositoryError>;

    /// Persist resolution fields, only if the stored row is still `UNRESOLVED`.
    fn mark_resolved(&self, item: &Discrepancy) -> Result<bool, RepositoryError>;

    fn delete_resolved_before(&self, cutoff: DateTime<Utc>) -> Result<usize, RepositoryError>;
}

pub trait ReportRepository: Send + Sync {
    fn save(&self, report: &ReconciliationReport) -> Result<(), RepositoryError>;

    fn get_by_task(&self, task_id: TaskId) -> Result<Option<ReconciliationReport>, RepositoryError>;

    fn delete_before(&self, cutoff: DateTime<Utc>) -> Result<usize, RepositoryError>;
}

impl<R: TaskRepository + ?Sized> TaskRepository for Arc<R> {
    fn insert(&self, task: &ReconciliationTask) -> Result<(), RepositoryError> {
        (**self).insert(task)
    }

    fn get(&self, task_id: TaskId) -> Result<Option<ReconciliationTask>, RepositoryError> {
        (**self).get(task_id)
    }

    fn has_running(&self) -> Result<bool, RepositoryError> {
        (**self).has_running()
    }

    fn create_running(
        &self,
        task: ReconciliationTask,
        now: DateTime<Utc>,
    ) -> Result<Option<ReconciliationTask>, RepositoryError> {
        (**self).create_running(task, now)
    }

    fn try_start(
        &self,
        task_id: TaskId,
        now: DateTime<Utc>,
    ) -> Result<Option<ReconciliationTask>, RepositoryError> {
        (**self).try_start(task_id, now)
    }

    fn finish(&self, task: &ReconciliationTask) -> Result<bool, RepositoryError> {
        (**self).finish(task)
    }

    fn list_between(
        &self,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Vec<ReconciliationTask>, RepositoryError> {
        (**self).list_between(from, to)
    }

    fn delete_closed_before(&self, cutoff: DateTime<Utc>) -> Result<usize, RepositoryError> {
        (**self).delete_closed_before(cutoff)
    }
}

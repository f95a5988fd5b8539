//! In-memory reconciliation store for tests/dev.
//!
//! One mutex covers every map, so the RUNNING guard check and the status
//! flip happen atomically.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, NaiveDate, Utc};

use crate::discrepancy::{Discrepancy, DiscrepancyId, DiscrepancyStatus};
use crate::report::ReconciliationReport;
use crate::repository::{DiscrepancyRepository, ReportRepository, RepositoryError, TaskRepository};
use crate::task::{ReconciliationTask, TaskId, TaskStatus};

#[derive(Debug, Default)]
struct State {
    tasks: BTreeMap<TaskId, ReconciliationTask>,
    discrepancies: BTreeMap<DiscrepancyId, Discrepancy>,
    reports: HashMap<TaskId, ReconciliationReport>,
}

impl State {
    fn any_running(&self) -> bool {
        self.tasks.values().any(|t| t.status == TaskStatus::Running)
    }
}

#[derive(Debug, Default)]
pub struct InMemoryReconciliationStore {
    state: Mutex<State>,
}

impl InMemoryReconciliationStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    fn lock(&self) -> Result<MutexGuard<'_, State>, RepositoryError> {
        self.state
            .lock()
            .map_err(|_| RepositoryError::Storage("reconciliation store lock poisoned".into()))
    }

    pub fn task_count(&self) -> usize {
        self.lock().map(|s| s.tasks.len()).unwrap_or(0)
    }
}

impl TaskRepository for InMemoryReconciliationStore {
    fn insert(&self, task: &ReconciliationTask) -> Result<(), RepositoryError> {
        let mut state = self.lock()?;
        if state.tasks.contains_key(&task.task_id) {
            return Err(RepositoryError::Conflict(format!(
                "task {} already exists",
                task.task_id
            )));
        }
        state.tasks.insert(task.task_id, task.clone());
        Ok(())
    }

    fn get(&self, task_id: TaskId) -> Result<Option<ReconciliationTask>, RepositoryError> {
        Ok(self.lock()?.tasks.get(&task_id).cloned())
    }

    fn has_running(&self) -> Result<bool, RepositoryError> {
        Ok(self.lock()?.any_running())
    }

    fn create_running(
        &self,
        mut task: ReconciliationTask,
        now: DateTime<Utc>,
    ) -> Result<Option<ReconciliationTask>, RepositoryError> {
        let mut state = self.lock()?;
        if state.any_running() {
            return Ok(None);
        }
        if state.tasks.contains_key(&task.task_id) {
            return Err(RepositoryError::Conflict(format!(
                "task {} already exists",
                task.task_id
            )));
        }
        task.start(now)
            .map_err(|e| RepositoryError::Conflict(e.to_string()))?;
        state.tasks.insert(task.task_id, task.clone());
        Ok(Some(task))
    }

    fn try_start(
        &self,
        task_id: TaskId,
        now: DateTime<Utc>,
    ) -> Result<Option<ReconciliationTask>, RepositoryError> {
        let mut state = self.lock()?;
        if state.any_running() {
            return Ok(None);
        }
        let task = state
            .tasks
            .get_mut(&task_id)
            .ok_or_else(|| RepositoryError::NotFound(format!("task {task_id}")))?;
        task.start(now)
            .map_err(|e| RepositoryError::Conflict(e.to_string()))?;
        Ok(Some(task.clone()))
    }

    fn finish(&self, task: &ReconciliationTask) -> Result<bool, RepositoryError> {
        let mut state = self.lock()?;
        match state.tasks.get_mut(&task.task_id) {
            Some(stored) if stored.status == TaskStatus::Running => {
                *stored = task.clone();
                Ok(true)
            }
            Some(_) => Ok(false),
            None => Err(RepositoryError::NotFound(format!("task {}", task.task_id))),
        }
    }

    fn list_between(
        &self,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Vec<ReconciliationTask>, RepositoryError> {
        Ok(self
            .lock()?
            .tasks
            .values()
            .filter(|t| t.target_date >= from && t.target_date <= to)
            .cloned()
            .collect())
    }

    fn delete_closed_before(&self, cutoff: DateTime<Utc>) -> Result<usize, RepositoryError> {
        let mut state = self.lock()?;
        let State {
            tasks,
            discrepancies,
            ..
        } = &mut *state;
        let before = tasks.len();
        tasks.retain(|id, t| {
            let expired = t.status.is_terminal() && t.created_at < cutoff;
            let referenced = discrepancies.values().any(|d| d.task_id == *id);
            !expired || referenced
        });
        Ok(before - tasks.len())
    }
}

impl DiscrepancyRepository for InMemoryReconciliationStore {
    fn insert_batch(&self, items: &[Discrepancy]) -> Result<(), RepositoryError> {
        let mut state = self.lock()?;
        if let Some(dup) = items.iter().find(|d| state.discrepancies.contains_key(&d.id)) {
            return Err(RepositoryError::Conflict(format!(
                "discrepancy {} already exists",
                dup.id
            )));
        }
        for d in items {
            state.discrepancies.insert(d.id, d.clone());
        }
        Ok(())
    }

    fn get(&self, id: DiscrepancyId) -> Result<Option<Discrepancy>, RepositoryError> {
        Ok(self.lock()?.discrepancies.get(&id).cloned())
    }

    fn list_by_task(&self, task_id: TaskId) -> Result<Vec<Discrepancy>, RepositoryError> {
        Ok(self
            .lock()?
            .discrepancies
            .values()
            .filter(|d| d.task_id == task_id)
            .cloned()
            .collect())
    }

    fn list_unresolved(&self, limit: usize) -> Result<Vec<Discrepancy>, RepositoryError> {
        Ok(self
            .lock()?
            .discrepancies
            .values()
            .filter(|d| d.status == DiscrepancyStatus::Unresolved)
            .take(limit)
            .cloned()
            .collect())
    }

    fn mark_resolved(&self, item: &Discrepancy) -> Result<bool, RepositoryError> {
        let mut state = self.lock()?;
        match state.discrepancies.get_mut(&item.id) {
            Some(stored) if stored.status == DiscrepancyStatus::Unresolved => {
                stored.status = item.status;
                stored.resolved_at = item.resolved_at;
                stored.resolved_by = item.resolved_by.clone();
                stored.resolution_notes = item.resolution_notes.clone();
                Ok(true)
            }
            Some(_) => Ok(false),
            None => Err(RepositoryError::NotFound(format!("discrepancy {}", item.id))),
        }
    }

    fn delete_resolved_before(&self, cutoff: DateTime<Utc>) -> Result<usize, RepositoryError> {
        let mut state = self.lock()?;
        let before = state.discrepancies.len();
        state.discrepancies.retain(|_, d| {
            !(d.status == DiscrepancyStatus::Resolved && d.detected_at < cutoff)
        });
        Ok(before - state.discrepancies.len())
    }
}

impl ReportRepository for InMemoryReconciliationStore {
    fn save(&self, report: &ReconciliationReport) -> Result<(), RepositoryError> {
        self.lock()?.reports.insert(report.task_id, report.clone());
        Ok(())
    }

    fn get_by_task(&self, task_id: TaskId) -> Result<Option<ReconciliationReport>, RepositoryError> {
        Ok(self.lock()?.reports.get(&task_id).cloned())
    }

    fn delete_before(&self, cutoff: DateTime<Utc>) -> Result<usize, RepositoryError> {
        let mut state = self.lock()?;
        let before = state.reports.len();
        state.reports.retain(|_, r| r.created_at >= cutoff);
        Ok(before - state.reports.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discrepancy::{DiscrepancyType, RecordDetails, SourceSystem};
    use crate::task::TaskType;
    use chrono::Duration;

    fn task(id: i64) -> ReconciliationTask {
        ReconciliationTask::new(
            TaskId::from_i64(id),
            TaskType::Payment,
            NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
            Utc::now(),
        )
    }

    #[test]
    fn create_running_respects_guard() {
        let store = InMemoryReconciliationStore::new();
        let now = Utc::now();

        let first = store.create_running(task(1), now).unwrap();
        assert_eq!(first.unwrap().status, TaskStatus::Running);
        assert!(store.has_running().unwrap());

        assert!(store.create_running(task(2), now).unwrap().is_none());
        assert_eq!(store.task_count(), 1);
    }

    #[test]
    fn try_start_blocks_while_running() {
        let store = InMemoryReconciliationStore::new();
        let now = Utc::now();
        store.insert(&task(1)).unwrap();
        store.insert(&task(2)).unwrap();

        let mut running = store.try_start(TaskId::from_i64(1), now).unwrap().unwrap();
        assert!(store.try_start(TaskId::from_i64(2), now).unwrap().is_none());

        running.succeed(0, 0, 0, now).unwrap();
        assert!(store.finish(&running).unwrap());
        assert!(store.try_start(TaskId::from_i64(2), now).unwrap().is_some());
    }

    #[test]
    fn finish_ignores_already_closed_task() {
        let store = InMemoryReconciliationStore::new();
        let now = Utc::now();
        let running = store.create_running(task(1), now).unwrap().unwrap();

        let mut timed_out = running.clone();
        timed_out.fail("timeout", now).unwrap();
        assert!(store.finish(&timed_out).unwrap());

        let mut late = running;
        late.succeed(5, 5, 0, now).unwrap();
        assert!(!store.finish(&late).unwrap());
        assert_eq!(
            TaskRepository::get(&store, TaskId::from_i64(1)).unwrap().unwrap().status,
            TaskStatus::Failed
        );
    }

    #[test]
    fn cleanup_keeps_tasks_with_open_discrepancies() {
        let store = InMemoryReconciliationStore::new();
        let old = Utc::now() - Duration::days(60);

        for id in [1, 2] {
            let mut t = task(id);
            t.created_at = old;
            t.start(old).unwrap();
            t.succeed(1, 0, 1, old).unwrap();
            store.insert(&t).unwrap();
        }
        let open = Discrepancy::new(
            TaskId::from_i64(2),
            DiscrepancyType::Extra,
            SourceSystem::Internal,
            "x",
            RecordDetails::default(),
            old,
        );
        store.insert_batch(&[open]).unwrap();

        let removed = store.delete_closed_before(Utc::now() - Duration::days(30)).unwrap();
        assert_eq!(removed, 1);
        assert!(TaskRepository::get(&store, TaskId::from_i64(2)).unwrap().is_some());
    }
}

//! Reconciliation service facade.
//!
//! Entry point for both the scheduler and manual operations. A run:
//!
//! 1. acquires the single-RUNNING guard (task creation and the status flip are one atomic step)
//! 2. fetches both ledger slices and compares them on a worker thread, bounded by `task_timeout`
//! 3. records discrepancies, closes the task and writes the summary report
//! 4. publishes lifecycle events
//!
//! Completion is a compare-and-set on `RUNNING`, so a task that was already
//! failed (e.g. by the timeout) is never flipped back to `SUCCESS`.

use std::sync::Arc;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread;
use std::time::Instant;

use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde_json::json;
use tracing::{debug, error, info, warn};

use orderflow_core::{Clock, DomainError, SnowflakeIdGenerator};
use orderflow_events::{DomainEvent, EventPublisher, EventType, RetryError, RetryableProcessor};

use crate::adapter::{ExternalLedgerAdapter, InternalLedgerSource};
use crate::comparison::{ComparisonOutcome, ComparisonSettings, compare};
use crate::config::ReconciliationConfig;
use crate::discrepancy::{Discrepancy, DiscrepancyId};
use crate::error::{ReconciliationError, ReconciliationResult};
use crate::record::DateRange;
use crate::report::ReconciliationReport;
use crate::repository::{DiscrepancyRepository, ReportRepository, RepositoryError, TaskRepository};
use crate::rules::ResolutionRule;
use crate::task::{ReconciliationTask, TaskId, TaskType};

/// Collaborators injected into [`ReconciliationService`].
pub struct ServiceDependencies {
    pub tasks: Arc<dyn TaskRepository>,
    pub discrepancies: Arc<dyn DiscrepancyRepository>,
    pub reports: Arc<dyn ReportRepository>,
    pub internal: Arc<dyn InternalLedgerSource>,
    pub external: Arc<dyn ExternalLedgerAdapter>,
    pub publisher: Arc<dyn EventPublisher>,
    pub ids: Arc<SnowflakeIdGenerator>,
    pub clock: Arc<dyn Clock>,
    /// Backoff used for external fetches; its attempt budget is replaced by
    /// `ReconciliationConfig::retry_attempts`.
    pub retry: RetryableProcessor,
}

/// Rows removed by a retention cleanup.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct CleanupSummary {
    pub tasks: usize,
    pub discrepancies: usize,
    pub reports: usize,
}

#[derive(Clone)]
pub struct ReconciliationService {
    tasks: Arc<dyn TaskRepository>,
    discrepancies: Arc<dyn DiscrepancyRepository>,
    reports: Arc<dyn ReportRepository>,
    internal: Arc<dyn InternalLedgerSource>,
    external: Arc<dyn ExternalLedgerAdapter>,
    publisher: Arc<dyn EventPublisher>,
    ids: Arc<SnowflakeIdGenerator>,
    clock: Arc<dyn Clock>,
    retry: RetryableProcessor,
    config: ReconciliationConfig,
}

impl std::fmt::Debug for ReconciliationService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReconciliationService")
            .field("external", &self.external.name())
            .field("publisher", &self.publisher.name())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl ReconciliationService {
    pub fn new(deps: ServiceDependencies, config: ReconciliationConfig) -> Self {
        Self {
            tasks: deps.tasks,
            discrepancies: deps.discrepancies,
            reports: deps.reports,
            internal: deps.internal,
            external: deps.external,
            publisher: deps.publisher,
            ids: deps.ids,
            clock: deps.clock,
            retry: deps.retry.with_max_attempts(config.retry_attempts),
            config,
        }
    }

    pub fn config(&self) -> &ReconciliationConfig {
        &self.config
    }

    // ---------------------------------------------------------------------
    // Task creation and execution
    // ---------------------------------------------------------------------

    /// Create a `PENDING` task for manual execution via [`Self::execute_task`].
    pub fn create_task(
        &self,
        task_type: TaskType,
        target_date: NaiveDate,
    ) -> ReconciliationResult<ReconciliationTask> {
        let task = ReconciliationTask::new(
            self.ids.next_id()?.into(),
            task_type,
            target_date,
            self.clock.now(),
        );
        self.tasks.insert(&task)?;
        info!(
            task_id = %task.task_id,
            task_type = %task_type,
            target_date = %target_date,
            "reconciliation task created"
        );
        Ok(task)
    }

    pub fn create_payment_reconciliation_task(
        &self,
        target_date: NaiveDate,
    ) -> ReconciliationResult<ReconciliationTask> {
        self.create_task(TaskType::Payment, target_date)
    }

    pub fn create_refund_reconciliation_task(
        &self,
        target_date: NaiveDate,
    ) -> ReconciliationResult<ReconciliationTask> {
        self.create_task(TaskType::Refund, target_date)
    }

    pub fn create_settlement_reconciliation_task(
        &self,
        target_date: NaiveDate,
    ) -> ReconciliationResult<ReconciliationTask> {
        self.create_task(TaskType::Settlement, target_date)
    }

    pub fn has_running_task(&self) -> ReconciliationResult<bool> {
        Ok(self.tasks.has_running()?)
    }

    /// Create a task directly in `RUNNING` for a scheduled trigger.
    ///
    /// Returns `None` without creating anything when another task holds the guard.
    pub fn start_scheduled_task(
        &self,
        task_type: TaskType,
        target_date: NaiveDate,
    ) -> ReconciliationResult<Option<ReconciliationTask>> {
        let now = self.clock.now();
        let task = ReconciliationTask::new(self.ids.next_id()?.into(), task_type, target_date, now);

        match self.tasks.create_running(task, now)? {
            Some(task) => {
                info!(
                    task_id = %task.task_id,
                    task_type = %task_type,
                    target_date = %target_date,
                    "scheduled reconciliation started"
                );
                self.emit(
                    EventType::DailyReconciliationStarted,
                    task.task_id,
                    json!({
                        "taskId": task.task_id.to_string(),
                        "taskType": task_type.as_str(),
                        "taskDate": target_date.to_string(),
                        "schedule": "daily",
                    }),
                );
                Ok(Some(task))
            }
            None => {
                warn!(
                    task_type = %task_type,
                    target_date = %target_date,
                    "reconciliation already running, skipping trigger"
                );
                Ok(None)
            }
        }
    }

    /// Acquire the guard for a `PENDING` task and run it to completion.
    pub fn execute_task(&self, task_id: TaskId) -> ReconciliationResult<ReconciliationTask> {
        let task = match self.tasks.try_start(task_id, self.clock.now()) {
            Ok(Some(task)) => task,
            Ok(None) => return Err(ReconciliationError::AlreadyRunning),
            Err(RepositoryError::NotFound(_)) => {
                return Err(ReconciliationError::TaskNotFound(task_id));
            }
            Err(e) => return Err(e.into()),
        };
        self.run_task(task)
    }

    /// Run a task that already holds the guard (`RUNNING`).
    ///
    /// Any error closes the task as `FAILED` and releases the guard before it
    /// is returned; discrepancies written so far are kept.
    pub fn run_task(&self, task: ReconciliationTask) -> ReconciliationResult<ReconciliationTask> {
        let started = Instant::now();
        self.emit(
            EventType::ReconciliationStarted,
            task.task_id,
            json!({
                "taskId": task.task_id.to_string(),
                "taskType": task.task_type.as_str(),
                "taskDate": task.target_date.to_string(),
            }),
        );

        let result = self
            .compare_with_timeout(&task)
            .and_then(|outcome| self.record_outcome(task.clone(), &outcome, started));

        match result {
            Ok(done) => Ok(done),
            Err(e) => {
                self.fail_task(task, &e);
                Err(e)
            }
        }
    }

    fn compare_with_timeout(
        &self,
        task: &ReconciliationTask,
    ) -> ReconciliationResult<ComparisonOutcome> {
        let (tx, rx) = mpsc::channel();
        let internal = self.internal.clone();
        let external = self.external.clone();
        let retry = self.retry.clone();
        let settings = self.config.comparison_settings();
        let task_type = task.task_type;
        let range = DateRange::for_date(task.target_date);

        thread::Builder::new()
            .name(format!("reconcile-{}", task.task_id))
            .spawn(move || {
                let result =
                    fetch_and_compare(&*internal, &*external, &retry, task_type, &range, &settings);
                // The receiver is gone if the run already timed out.
                let _ = tx.send(result);
            })
            .map_err(|e| ReconciliationError::Worker(e.to_string()))?;

        match rx.recv_timeout(self.config.task_timeout) {
            Ok(result) => result,
            Err(RecvTimeoutError::Timeout) => {
                Err(ReconciliationError::Timeout(self.config.task_timeout))
            }
            Err(RecvTimeoutError::Disconnected) => Err(ReconciliationError::Worker(
                "comparison worker exited without a result".into(),
            )),
        }
    }

    fn record_outcome(
        &self,
        mut task: ReconciliationTask,
        outcome: &ComparisonOutcome,
        started: Instant,
    ) -> ReconciliationResult<ReconciliationTask> {
        let now = self.clock.now();
        let items: Vec<Discrepancy> = outcome
            .findings
            .iter()
            .map(|f| {
                Discrepancy::new(
                    task.task_id,
                    f.discrepancy_type,
                    f.source_system,
                    f.record_key.clone(),
                    f.details.clone(),
                    now,
                )
            })
            .collect();

        for chunk in items.chunks(self.config.batch_size.max(1)) {
            self.discrepancies.insert_batch(chunk)?;
        }

        task.succeed(
            outcome.compared as u64,
            outcome.matched as u64,
            outcome.findings.len() as u64,
            now,
        )?;
        if !self.tasks.finish(&task)? {
            return Err(DomainError::conflict(format!(
                "task {} was closed before its result was recorded",
                task.task_id
            ))
            .into());
        }

        let elapsed_ms = started.elapsed().as_millis() as i64;
        let report = ReconciliationReport::build(&task, outcome, elapsed_ms, now);
        if let Err(e) = self.reports.save(&report) {
            warn!(task_id = %task.task_id, error = %e, "failed to save reconciliation report");
        }

        info!(
            task_id = %task.task_id,
            task_type = %task.task_type,
            total = outcome.compared,
            matched = outcome.matched,
            discrepancies = outcome.findings.len(),
            ratio = outcome.ratio,
            elapsed_ms,
            "reconciliation completed"
        );
        self.emit(
            EventType::ReconciliationCompleted,
            task.task_id,
            json!({
                "taskId": task.task_id.to_string(),
                "taskType": task.task_type.as_str(),
                "taskDate": task.target_date.to_string(),
                "totalRecords": task.total_records,
                "matchedRecords": task.matched_records,
                "unmatchedRecords": task.unmatched_records,
                "discrepancyRatio": outcome.ratio,
                "executionTimeMs": elapsed_ms,
            }),
        );

        if outcome.alert {
            warn!(
                task_id = %task.task_id,
                ratio = outcome.ratio,
                threshold = self.config.alert_threshold,
                "discrepancy ratio above alert threshold"
            );
            self.emit(
                EventType::ReconciliationAlert,
                task.task_id,
                json!({
                    "taskId": task.task_id.to_string(),
                    "taskType": task.task_type.as_str(),
                    "taskDate": task.target_date.to_string(),
                    "discrepancyCount": outcome.findings.len(),
                    "discrepancyRatio": outcome.ratio,
                    "threshold": self.config.alert_threshold,
                }),
            );
        }

        Ok(task)
    }

    fn fail_task(&self, mut task: ReconciliationTask, cause: &ReconciliationError) {
        error!(
            task_id = %task.task_id,
            task_type = %task.task_type,
            error = %cause,
            "reconciliation failed"
        );
        if task.fail(cause.to_string(), self.clock.now()).is_ok() {
            match self.tasks.finish(&task) {
                Ok(true) => {}
                Ok(false) => {
                    warn!(task_id = %task.task_id, "task already closed, failure not recorded")
                }
                Err(e) => {
                    error!(task_id = %task.task_id, error = %e, "failed to record task failure")
                }
            }
        }
        self.emit(
            EventType::ReconciliationFailed,
            task.task_id,
            json!({
                "taskId": task.task_id.to_string(),
                "taskType": task.task_type.as_str(),
                "taskDate": task.target_date.to_string(),
                "error": cause.to_string(),
            }),
        );
    }

    // ---------------------------------------------------------------------
    // Queries
    // ---------------------------------------------------------------------

    pub fn get_task(&self, task_id: TaskId) -> ReconciliationResult<Option<ReconciliationTask>> {
        Ok(self.tasks.get(task_id)?)
    }

    pub fn tasks_between(
        &self,
        from: NaiveDate,
        to: NaiveDate,
    ) -> ReconciliationResult<Vec<ReconciliationTask>> {
        Ok(self.tasks.list_between(from, to)?)
    }

    pub fn get_discrepancies(&self, task_id: TaskId) -> ReconciliationResult<Vec<Discrepancy>> {
        Ok(self.discrepancies.list_by_task(task_id)?)
    }

    pub fn unresolved_discrepancies(&self, limit: usize) -> ReconciliationResult<Vec<Discrepancy>> {
        Ok(self.discrepancies.list_unresolved(limit)?)
    }

    pub fn get_report(&self, task_id: TaskId) -> ReconciliationResult<Option<ReconciliationReport>> {
        Ok(self.reports.get_by_task(task_id)?)
    }

    // ---------------------------------------------------------------------
    // Resolution
    // ---------------------------------------------------------------------

    pub fn resolve_discrepancy(
        &self,
        id: DiscrepancyId,
        notes: &str,
        resolved_by: &str,
    ) -> ReconciliationResult<Discrepancy> {
        let mut item = self
            .discrepancies
            .get(id)?
            .ok_or(ReconciliationError::DiscrepancyNotFound(id))?;
        item.resolve(notes, resolved_by, self.clock.now())?;

        if !self.discrepancies.mark_resolved(&item)? {
            return Err(DomainError::conflict(format!("discrepancy {id} already resolved")).into());
        }

        info!(
            discrepancy_id = %id,
            task_id = %item.task_id,
            resolved_by,
            "discrepancy resolved"
        );
        self.emit(
            EventType::DiscrepancyResolved,
            item.task_id,
            json!({
                "discrepancyId": id.to_string(),
                "taskId": item.task_id.to_string(),
                "type": item.discrepancy_type.as_str(),
                "recordKey": item.record_key,
                "resolvedBy": resolved_by,
                "resolutionNotes": notes,
            }),
        );
        Ok(item)
    }

    /// Resolve the task's open discrepancies accepted by one of `rules`.
    ///
    /// The first accepting rule wins. Returns how many were resolved.
    pub fn apply_resolution_rules(
        &self,
        task_id: TaskId,
        rules: &[&dyn ResolutionRule],
    ) -> ReconciliationResult<usize> {
        let mut resolved = 0;
        for item in self.discrepancies.list_by_task(task_id)? {
            if item.is_resolved() {
                continue;
            }
            let Some((rule, notes)) = rules
                .iter()
                .find_map(|r| r.evaluate(&item).map(|notes| (r.name(), notes)))
            else {
                continue;
            };
            match self.resolve_discrepancy(item.id, &notes, &format!("rule:{rule}")) {
                Ok(_) => resolved += 1,
                Err(ReconciliationError::Domain(DomainError::Conflict(_))) => {
                    debug!(discrepancy_id = %item.id, "resolved concurrently, skipping");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(resolved)
    }

    // ---------------------------------------------------------------------
    // Retention
    // ---------------------------------------------------------------------

    /// Purge resolved discrepancies, reports and closed tasks older than `cutoff`.
    pub fn cleanup_before(&self, cutoff: DateTime<Utc>) -> ReconciliationResult<CleanupSummary> {
        let summary = CleanupSummary {
            discrepancies: self.discrepancies.delete_resolved_before(cutoff)?,
            reports: self.reports.delete_before(cutoff)?,
            tasks: self.tasks.delete_closed_before(cutoff)?,
        };
        info!(
            cutoff = %cutoff,
            tasks = summary.tasks,
            discrepancies = summary.discrepancies,
            reports = summary.reports,
            "reconciliation data cleaned up"
        );
        Ok(summary)
    }

    /// [`Self::cleanup_before`] with the configured retention window.
    pub fn cleanup_expired(&self) -> ReconciliationResult<CleanupSummary> {
        let cutoff = self.clock.now() - Duration::days(i64::from(self.config.retention_days));
        self.cleanup_before(cutoff)
    }

    /// Publish a lifecycle event. Failures are logged and never fail the caller.
    fn emit(&self, event_type: EventType, task_id: TaskId, payload: serde_json::Value) -> bool {
        let id = match self.ids.next_id() {
            Ok(id) => id,
            Err(e) => {
                error!(event_type = %event_type, error = %e, "could not allocate event id");
                return false;
            }
        };
        let event = match DomainEvent::from_payload(id, event_type, &payload, self.clock.now()) {
            Ok(event) => event.with_aggregate_id(task_id.to_string()),
            Err(e) => {
                error!(error = %e, "could not build lifecycle event");
                return false;
            }
        };
        let published = self.publisher.publish(&event);
        if !published {
            warn!(
                event_id = %event.id,
                event_type = %event.event_type,
                publisher = self.publisher.name(),
                "lifecycle event not published"
            );
        }
        published
    }
}

fn fetch_and_compare(
    internal: &dyn InternalLedgerSource,
    external: &dyn ExternalLedgerAdapter,
    retry: &RetryableProcessor,
    task_type: TaskType,
    range: &DateRange,
    settings: &ComparisonSettings,
) -> ReconciliationResult<ComparisonOutcome> {
    let internal_records = internal.fetch_records(task_type, range)?;
    let external_records = retry
        .execute(external.name(), |attempt| {
            debug!(provider = external.name(), %task_type, attempt, "fetching provider records");
            external.fetch_transactions(task_type, range)
        })
        .map_err(RetryError::into_last_error)?;
    Ok(compare(&internal_records, &external_records, settings))
}

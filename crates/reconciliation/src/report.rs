//! Summary report written when a task finishes.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::comparison::ComparisonOutcome;
use crate::discrepancy::DiscrepancyType;
use crate::task::{ReconciliationTask, TaskId, TaskType};

/// How many discrepancy keys a report lists inline.
pub const SAMPLE_LIMIT: usize = 50;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconciliationReport {
    pub task_id: TaskId,
    pub task_type: TaskType,
    pub target_date: NaiveDate,
    pub internal_records: u64,
    pub external_records: u64,
    pub total_records: u64,
    pub matched_records: u64,
    pub missing_count: u64,
    pub mismatch_count: u64,
    pub extra_count: u64,
    pub discrepancy_ratio: f64,
    pub alert_triggered: bool,
    pub execution_time_ms: i64,
    /// First discrepancy keys, ordered by transaction id.
    pub sample_keys: Vec<String>,
    pub created_at: DateTime<Utc>,
}

impl ReconciliationReport {
    pub fn build(
        task: &ReconciliationTask,
        outcome: &ComparisonOutcome,
        execution_time_ms: i64,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            task_id: task.task_id,
            task_type: task.task_type,
            target_date: task.target_date,
            internal_records: outcome.internal_count as u64,
            external_records: outcome.external_count as u64,
            total_records: outcome.compared as u64,
            matched_records: outcome.matched as u64,
            missing_count: outcome.count_of(DiscrepancyType::Missing) as u64,
            mismatch_count: outcome.count_of(DiscrepancyType::Mismatch) as u64,
            extra_count: outcome.count_of(DiscrepancyType::Extra) as u64,
            discrepancy_ratio: outcome.ratio,
            alert_triggered: outcome.alert,
            execution_time_ms,
            sample_keys: outcome
                .findings
                .iter()
                .take(SAMPLE_LIMIT)
                .map(|f| f.record_key.clone())
                .collect(),
            created_at: now,
        }
    }
}

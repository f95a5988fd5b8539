//! Reconciliation task model.

use core::fmt;
use core::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use orderflow_core::{DomainError, DomainResult, SnowflakeId};

/// Identifier of a reconciliation task (a Snowflake id).
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(SnowflakeId);

impl TaskId {
    pub fn as_i64(&self) -> i64 {
        self.0.as_i64()
    }

    pub fn from_i64(raw: i64) -> Self {
        Self(SnowflakeId::from_raw(raw))
    }
}

impl From<SnowflakeId> for TaskId {
    fn from(value: SnowflakeId) -> Self {
        Self(value)
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl FromStr for TaskId {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        SnowflakeId::from_str(s).map(Self)
    }
}

/// Which ledger slice a task compares.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskType {
    Payment,
    Refund,
    Settlement,
}

impl TaskType {
    pub const ALL: [TaskType; 3] = [TaskType::Payment, TaskType::Refund, TaskType::Settlement];

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskType::Payment => "PAYMENT",
            TaskType::Refund => "REFUND",
            TaskType::Settlement => "SETTLEMENT",
        }
    }
}

impl FromStr for TaskType {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PAYMENT" => Ok(TaskType::Payment),
            "REFUND" => Ok(TaskType::Refund),
            "SETTLEMENT" => Ok(TaskType::Settlement),
            other => Err(DomainError::validation(format!("unknown task type: {other}"))),
        }
    }
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Pending,
    Running,
    Success,
    Failed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "PENDING",
            TaskStatus::Running => "RUNNING",
            TaskStatus::Success => "SUCCESS",
            TaskStatus::Failed => "FAILED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Success | TaskStatus::Failed)
    }
}

impl FromStr for TaskStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(TaskStatus::Pending),
            "RUNNING" => Ok(TaskStatus::Running),
            "SUCCESS" => Ok(TaskStatus::Success),
            "FAILED" => Ok(TaskStatus::Failed),
            other => Err(DomainError::validation(format!("unknown task status: {other}"))),
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One comparison run for a business date.
///
/// Lifecycle: `PENDING -> RUNNING -> {SUCCESS, FAILED}`. A task only becomes
/// `RUNNING` through the repository's exclusivity guard.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconciliationTask {
    pub task_id: TaskId,
    pub task_type: TaskType,
    pub status: TaskStatus,
    pub target_date: NaiveDate,
    pub total_records: u64,
    pub matched_records: u64,
    pub unmatched_records: u64,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl ReconciliationTask {
    pub fn new(
        task_id: TaskId,
        task_type: TaskType,
        target_date: NaiveDate,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            task_id,
            task_type,
            status: TaskStatus::Pending,
            target_date,
            total_records: 0,
            matched_records: 0,
            unmatched_records: 0,
            error_message: None,
            created_at: now,
            started_at: None,
            completed_at: None,
            updated_at: now,
        }
    }

    pub fn start(&mut self, now: DateTime<Utc>) -> DomainResult<()> {
        if self.status != TaskStatus::Pending {
            return Err(DomainError::invariant(format!(
                "task {} cannot start from {}",
                self.task_id, self.status
            )));
        }
        self.status = TaskStatus::Running;
        self.started_at = Some(now);
        self.updated_at = now;
        Ok(())
    }

    pub fn succeed(
        &mut self,
        total: u64,
        matched: u64,
        unmatched: u64,
        now: DateTime<Utc>,
    ) -> DomainResult<()> {
        if self.status != TaskStatus::Running {
            return Err(DomainError::invariant(format!(
                "task {} cannot succeed from {}",
                self.task_id, self.status
            )));
        }
        self.status = TaskStatus::Success;
        self.total_records = total;
        self.matched_records = matched;
        self.unmatched_records = unmatched;
        self.completed_at = Some(now);
        self.updated_at = now;
        Ok(())
    }

    pub fn fail(&mut self, error: impl Into<String>, now: DateTime<Utc>) -> DomainResult<()> {
        if self.status.is_terminal() {
            return Err(DomainError::invariant(format!(
                "task {} already {}",
                self.task_id, self.status
            )));
        }
        self.status = TaskStatus::Failed;
        self.error_message = Some(error.into());
        self.completed_at = Some(now);
        self.updated_at = now;
        Ok(())
    }

    /// Wall-clock execution time, once finished.
    pub fn execution_millis(&self) -> Option<i64> {
        match (self.started_at, self.completed_at) {
            (Some(s), Some(c)) => Some((c - s).num_milliseconds()),
            _ => None,
        }
    }
}

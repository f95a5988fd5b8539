use std::str::FromStr;

use chrono::{DateTime, Days, NaiveDate, Utc};
use cron::Schedule;
use thiserror::Error;

use orderflow_reconciliation::TaskType;

use crate::config::ScheduleConfig;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("invalid cron expression {expression:?}: {reason}")]
pub struct ScheduleError {
    pub expression: String,
    pub reason: String,
}

/// A cron cadence evaluated in UTC.
///
/// Expressions use the seconds-first form (`sec min hour dom month dow [year]`).
/// Quartz-style `?` placeholders are read as `*`.
#[derive(Debug, Clone)]
pub struct Cadence {
    expression: String,
    schedule: Schedule,
}

impl Cadence {
    pub fn parse(expression: &str) -> Result<Self, ScheduleError> {
        let expression = expression.trim();
        let schedule = Schedule::from_str(&expression.replace('?', "*")).map_err(|e| ScheduleError {
            expression: expression.to_string(),
            reason: e.to_string(),
        })?;
        Ok(Self {
            expression: expression.to_string(),
            schedule,
        })
    }

    pub fn expression(&self) -> &str {
        &self.expression
    }

    /// First trigger strictly after `now`, or `None` once the schedule is exhausted.
    pub fn next_after(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.schedule.after(&now).next()
    }
}

impl PartialEq for Cadence {
    fn eq(&self, other: &Self) -> bool {
        self.expression == other.expression
    }
}

impl Eq for Cadence {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobKind {
    /// Reconcile the business date `days_back` days before the trigger date.
    Reconcile { task_type: TaskType, days_back: u64 },
    /// Purge expired reconciliation data and delivered outbox rows.
    Cleanup,
}

impl JobKind {
    /// Business date a reconcile job covers when triggered at `now`.
    pub fn target_date(&self, now: DateTime<Utc>) -> Option<NaiveDate> {
        match self {
            JobKind::Reconcile { days_back, .. } => now.date_naive().checked_sub_days(Days::new(*days_back)),
            JobKind::Cleanup => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduledJob {
    pub name: &'static str,
    pub cadence: Cadence,
    pub kind: JobKind,
}

/// Payment and refund cover yesterday; settlement lags a day behind
/// because provider settlement files arrive later.
pub fn daily_jobs(schedule: &ScheduleConfig) -> Result<Vec<ScheduledJob>, ScheduleError> {
    Ok(vec![
        ScheduledJob {
            name: "payment-reconciliation",
            cadence: Cadence::parse(&schedule.payment_cron)?,
            kind: JobKind::Reconcile {
                task_type: TaskType::Payment,
                days_back: 1,
            },
        },
        ScheduledJob {
            name: "refund-reconciliation",
            cadence: Cadence::parse(&schedule.refund_cron)?,
            kind: JobKind::Reconcile {
                task_type: TaskType::Refund,
                days_back: 1,
            },
        },
        ScheduledJob {
            name: "settlement-reconciliation",
            cadence: Cadence::parse(&schedule.settlement_cron)?,
            kind: JobKind::Reconcile {
                task_type: TaskType::Settlement,
                days_back: 2,
            },
        },
        ScheduledJob {
            name: "reconciliation-cleanup",
            cadence: Cadence::parse(&schedule.cleanup_cron)?,
            kind: JobKind::Cleanup,
        },
    ])
}

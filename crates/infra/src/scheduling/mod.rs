//! Cron scheduling for reconciliation and retention jobs.

pub mod schedule;
pub mod scheduler;

pub use schedule::{Cadence, JobKind, ScheduleError, ScheduledJob, daily_jobs};
pub use scheduler::{JobOutcome, ReconciliationScheduler, SchedulerHandle, SchedulerStats};

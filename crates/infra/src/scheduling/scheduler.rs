//! Reconciliation scheduler.
//!
//! One background thread watches the clock and fires each [`ScheduledJob`]
//! when its cron cadence comes due. Every firing runs on its own short-lived thread so a
//! slow reconciliation never delays the next trigger, and a failing job is
//! logged without stopping the scheduler.

use std::sync::{mpsc, Arc, Mutex};
use std::thread;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{error, info, warn};

use orderflow_core::Clock;
use orderflow_reconciliation::{ReconciliationService, TaskStatus};

use super::schedule::{JobKind, ScheduledJob};
use crate::outbox::DomainEventStore;

/// Result of one job firing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    Completed,
    /// Another reconciliation held the single-run guard.
    Skipped,
    Failed(String),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct SchedulerStats {
    pub triggered: u64,
    pub completed: u64,
    pub skipped: u64,
    pub failed: u64,
}

impl SchedulerStats {
    fn record(&mut self, outcome: &JobOutcome) {
        match outcome {
            JobOutcome::Completed => self.completed += 1,
            JobOutcome::Skipped => self.skipped += 1,
            JobOutcome::Failed(_) => self.failed += 1,
        }
    }
}

#[derive(Debug)]
pub struct SchedulerHandle {
    shutdown: mpsc::Sender<()>,
    join: Option<thread::JoinHandle<()>>,
    stats: Arc<Mutex<SchedulerStats>>,
}

impl SchedulerHandle {
    /// Stop triggering. Job runs already started finish on their own threads.
    pub fn shutdown(mut self) {
        let _ = self.shutdown.send(());
        if let Some(j) = self.join.take() {
            let _ = j.join();
        }
    }

    pub fn stats(&self) -> SchedulerStats {
        self.stats.lock().map(|s| s.clone()).unwrap_or_default()
    }
}

pub struct ReconciliationScheduler {
    service: Arc<ReconciliationService>,
    outbox: Arc<dyn DomainEventStore>,
    clock: Arc<dyn Clock>,
    jobs: Vec<ScheduledJob>,
    outbox_retention: Duration,
    poll_interval: Duration,
}

impl ReconciliationScheduler {
    pub fn new(
        service: Arc<ReconciliationService>,
        outbox: Arc<dyn DomainEventStore>,
        clock: Arc<dyn Clock>,
        jobs: Vec<ScheduledJob>,
        outbox_retention: Duration,
    ) -> Self {
        Self {
            service,
            outbox,
            clock,
            jobs,
            outbox_retention,
            poll_interval: Duration::from_secs(30),
        }
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn jobs(&self) -> &[ScheduledJob] {
        &self.jobs
    }

    /// Run `job` to completion on the calling thread.
    pub fn run_job(&self, job: &ScheduledJob) -> JobOutcome {
        let now = self.clock.now();
        match job.kind {
            JobKind::Reconcile { task_type, .. } => {
                let Some(date) = job.kind.target_date(now) else {
                    return JobOutcome::Failed("target date out of range".to_string());
                };
                let task = match self.service.start_scheduled_task(task_type, date) {
                    Ok(Some(task)) => task,
                    Ok(None) => return JobOutcome::Skipped,
                    Err(e) => return JobOutcome::Failed(e.to_string()),
                };
                match self.service.run_task(task) {
                    Ok(done) if done.status == TaskStatus::Success => JobOutcome::Completed,
                    Ok(done) => JobOutcome::Failed(format!("task ended as {}", done.status)),
                    Err(e) => JobOutcome::Failed(e.to_string()),
                }
            }
            JobKind::Cleanup => self.cleanup(now),
        }
    }

    fn cleanup(&self, now: DateTime<Utc>) -> JobOutcome {
        let summary = match self.service.cleanup_expired() {
            Ok(summary) => summary,
            Err(e) => return JobOutcome::Failed(e.to_string()),
        };
        let retention = chrono::Duration::from_std(self.outbox_retention)
            .unwrap_or_else(|_| chrono::Duration::days(7));
        match self.outbox.purge_completed_before(now - retention) {
            Ok(purged) => {
                info!(
                    tasks = summary.tasks,
                    discrepancies = summary.discrepancies,
                    reports = summary.reports,
                    outbox_events = purged,
                    "retention cleanup finished"
                );
                JobOutcome::Completed
            }
            Err(e) => JobOutcome::Failed(e.to_string()),
        }
    }

    pub fn spawn(self) -> std::io::Result<SchedulerHandle> {
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();
        let stats = Arc::new(Mutex::new(SchedulerStats::default()));
        let stats_clone = stats.clone();

        let join = thread::Builder::new()
            .name("reconciliation-scheduler".to_string())
            .spawn(move || scheduler_loop(Arc::new(self), shutdown_rx, stats_clone))?;

        Ok(SchedulerHandle {
            shutdown: shutdown_tx,
            join: Some(join),
            stats,
        })
    }

    fn fire(self: &Arc<Self>, idx: usize, stats: &Arc<Mutex<SchedulerStats>>) {
        let Some(job) = self.jobs.get(idx).cloned() else {
            return;
        };
        if let Ok(mut s) = stats.lock() {
            s.triggered += 1;
        }
        info!(job = job.name, "scheduled job triggered");

        let scheduler = self.clone();
        let job_stats = stats.clone();
        let spawned = thread::Builder::new()
            .name(format!("job-{}", job.name))
            .spawn(move || {
                let outcome = scheduler.run_job(&job);
                match &outcome {
                    JobOutcome::Completed => info!(job = job.name, "scheduled job completed"),
                    JobOutcome::Skipped => warn!(job = job.name, "scheduled job skipped, reconciliation already running"),
                    JobOutcome::Failed(reason) => error!(job = job.name, %reason, "scheduled job failed"),
                }
                if let Ok(mut s) = job_stats.lock() {
                    s.record(&outcome);
                }
            });
        if let Err(e) = spawned {
            error!(error = %e, "failed to spawn scheduled job thread");
            if let Ok(mut s) = stats.lock() {
                s.failed += 1;
            }
        }
    }
}

fn scheduler_loop(
    scheduler: Arc<ReconciliationScheduler>,
    shutdown_rx: mpsc::Receiver<()>,
    stats: Arc<Mutex<SchedulerStats>>,
) {
    let start = scheduler.clock.now();
    let mut next_runs: Vec<Option<DateTime<Utc>>> = scheduler
        .jobs
        .iter()
        .map(|job| job.cadence.next_after(start))
        .collect();
    for (job, at) in scheduler.jobs.iter().zip(&next_runs) {
        match at {
            Some(at) => info!(job = job.name, cron = job.cadence.expression(), next_run = %at, "job scheduled"),
            None => warn!(job = job.name, cron = job.cadence.expression(), "cron expression never fires"),
        }
    }

    loop {
        let now = scheduler.clock.now();
        for (idx, next) in next_runs.iter_mut().enumerate() {
            if next.is_some_and(|at| now >= at) {
                scheduler.fire(idx, &stats);
                *next = scheduler.jobs[idx].cadence.next_after(now);
            }
        }

        let until_next = next_runs
            .iter()
            .flatten()
            .min()
            .and_then(|at| (*at - now).to_std().ok())
            .unwrap_or(scheduler.poll_interval);
        match shutdown_rx.recv_timeout(until_next.min(scheduler.poll_interval)) {
            Err(mpsc::RecvTimeoutError::Timeout) => {}
            _ => break,
        }
    }

    info!("reconciliation scheduler stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ScheduleConfig;
    use crate::outbox::InMemoryDomainEventStore;
    use crate::scheduling::daily_jobs;
    use chrono::{NaiveDate, TimeZone};
    use orderflow_core::{ManualClock, SnowflakeId, SnowflakeIdGenerator};
    use orderflow_events::{
        DomainEvent, EventType, MemoryQueuePublisher, RecordingSleeper, RetryConfig,
        RetryableProcessor, Subscription,
    };
    use orderflow_reconciliation::{
        InMemoryReconciliationStore, ReconciliationConfig, ServiceDependencies, StaticLedger,
        TaskType,
    };
    use std::time::Instant;

    struct Fixture {
        scheduler: ReconciliationScheduler,
        service: Arc<ReconciliationService>,
        store: Arc<InMemoryReconciliationStore>,
        outbox: Arc<InMemoryDomainEventStore>,
        clock: Arc<ManualClock>,
        _events: Subscription<DomainEvent>,
    }

    fn fixture(now: DateTime<Utc>) -> Fixture {
        let clock = Arc::new(ManualClock::new(now));
        let store = InMemoryReconciliationStore::arc();
        let outbox = InMemoryDomainEventStore::arc();
        let (memory, events) = MemoryQueuePublisher::new("memory", 64);
        let service = Arc::new(ReconciliationService::new(
            ServiceDependencies {
                tasks: store.clone(),
                discrepancies: store.clone(),
                reports: store.clone(),
                internal: StaticLedger::arc("internal"),
                external: StaticLedger::arc("wechat"),
                publisher: Arc::new(memory),
                ids: Arc::new(SnowflakeIdGenerator::new(3).unwrap()),
                clock: clock.clone(),
                retry: RetryableProcessor::with_sleeper(
                    RetryConfig::default(),
                    Arc::new(RecordingSleeper::new()),
                ),
            },
            ReconciliationConfig::default(),
        ));
        let scheduler = ReconciliationScheduler::new(
            service.clone(),
            outbox.clone(),
            clock.clone(),
            daily_jobs(&ScheduleConfig::default()).unwrap(),
            Duration::from_secs(7 * 86_400),
        );
        Fixture {
            scheduler,
            service,
            store,
            outbox,
            clock,
            _events: events,
        }
    }

    fn march(day: u32, h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, day, h, m, 0).unwrap()
    }

    #[test]
    fn payment_job_reconciles_yesterday() {
        let f = fixture(march(10, 2, 0));
        let job = f.scheduler.jobs()[0].clone();

        assert_eq!(f.scheduler.run_job(&job), JobOutcome::Completed);

        let day = NaiveDate::from_ymd_opt(2024, 3, 9).unwrap();
        let tasks = f.service.tasks_between(day, day).unwrap();
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].task_type, TaskType::Payment);
        assert_eq!(tasks[0].status, TaskStatus::Success);
    }

    #[test]
    fn trigger_is_skipped_while_another_task_runs() {
        let f = fixture(march(10, 2, 5));
        let held = f
            .service
            .start_scheduled_task(TaskType::Payment, NaiveDate::from_ymd_opt(2024, 3, 9).unwrap())
            .unwrap();
        assert!(held.is_some());

        let refund = f.scheduler.jobs()[1].clone();
        assert_eq!(f.scheduler.run_job(&refund), JobOutcome::Skipped);
        assert_eq!(f.store.task_count(), 1);
    }

    #[test]
    fn cleanup_purges_old_outbox_rows() {
        let f = fixture(march(1, 0, 0));
        let event = DomainEvent::new(SnowflakeId::from_raw(7), EventType::OrderPaid, "{}", f.clock.now());
        f.outbox.append(&event).unwrap();
        f.outbox.claim_batch(10, f.clock.now()).unwrap();
        f.outbox.mark_completed(event.id, f.clock.now()).unwrap();

        f.clock.set_millis(march(10, 3, 30).timestamp_millis());
        let cleanup = f.scheduler.jobs()[3].clone();
        assert_eq!(f.scheduler.run_job(&cleanup), JobOutcome::Completed);
        assert!(f.outbox.is_empty());
    }

    #[test]
    fn background_loop_fires_when_clock_reaches_trigger() {
        let f = fixture(Utc.with_ymd_and_hms(2024, 3, 10, 1, 59, 59).unwrap());
        let clock = f.clock.clone();
        let service = f.service.clone();
        let handle = f
            .scheduler
            .with_poll_interval(Duration::from_millis(10))
            .spawn()
            .unwrap();

        thread::sleep(Duration::from_millis(50));
        assert_eq!(handle.stats().triggered, 0);

        clock.advance_millis(2_000);
        let deadline = Instant::now() + Duration::from_secs(5);
        while handle.stats().completed < 1 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        let stats = handle.stats();
        handle.shutdown();

        assert_eq!(stats.triggered, 1);
        assert_eq!(stats.completed, 1);
        let day = NaiveDate::from_ymd_opt(2024, 3, 9).unwrap();
        assert_eq!(service.tasks_between(day, day).unwrap().len(), 1);
    }
}

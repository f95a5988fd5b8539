//! Bounded exponential-backoff retry around a delivery handler.

use std::fmt::Display;
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{error, info, warn};

use crate::event::DomainEvent;

/// Retry policy for [`RetryableProcessor`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Total handler invocations allowed, including the first one.
    pub max_attempts: u32,
    /// Delay before the first retry.
    pub initial_interval: Duration,
    /// Factor applied to the delay after every failure.
    pub multiplier: f64,
    /// Upper bound on the delay.
    pub max_interval: Duration,
    /// Random noise (0.0-1.0) added to each delay as a fraction of it; 0 disables.
    pub jitter: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_interval: Duration::from_millis(1000),
            multiplier: 2.0,
            max_interval: Duration::from_millis(10_000),
            jitter: 0.0,
        }
    }
}

impl RetryConfig {
    pub fn new(
        max_attempts: u32,
        initial_interval: Duration,
        multiplier: f64,
        max_interval: Duration,
    ) -> Self {
        Self {
            max_attempts,
            initial_interval,
            multiplier,
            max_interval,
            jitter: 0.0,
        }
    }

    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    /// Delay that follows `current` after another failure.
    pub fn next_interval(&self, current: Duration) -> Duration {
        let next_ms = current.as_millis() as f64 * self.multiplier;
        let max_ms = self.max_interval.as_millis() as f64;
        Duration::from_millis(next_ms.min(max_ms).max(0.0) as u64)
    }

    /// The un-jittered delays slept before each of the first `failures` retries.
    pub fn schedule(&self, failures: usize) -> Vec<Duration> {
        let mut out = Vec::with_capacity(failures);
        let mut delay = self.initial_interval.min(self.max_interval);
        for _ in 0..failures {
            out.push(delay);
            delay = self.next_interval(delay);
        }
        out
    }

    fn jittered(&self, delay: Duration) -> Duration {
        if self.jitter <= 0.0 {
            return delay;
        }
        let ms = delay.as_millis() as f64;
        let range = ms * self.jitter;
        let noise = rand::thread_rng().gen_range(-range..=range);
        Duration::from_millis((ms + noise).max(0.0) as u64)
    }
}

/// A sleep was cut short by cancellation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("sleep interrupted")]
pub struct SleepInterrupted;

/// Blocks the calling worker between attempts.
pub trait Sleeper: Send + Sync {
    fn sleep(&self, duration: Duration) -> Result<(), SleepInterrupted>;
}

/// Plain `thread::sleep`; never interrupted.
#[derive(Debug, Clone, Copy, Default)]
pub struct ThreadSleeper;

impl Sleeper for ThreadSleeper {
    fn sleep(&self, duration: Duration) -> Result<(), SleepInterrupted> {
        thread::sleep(duration);
        Ok(())
    }
}

/// Shared cancellation flag that wakes sleepers immediately when fired.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    inner: Arc<(Mutex<bool>, Condvar)>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        let (lock, cvar) = &*self.inner;
        match lock.lock() {
            Ok(mut cancelled) => *cancelled = true,
            Err(poisoned) => *poisoned.into_inner() = true,
        }
        cvar.notify_all();
    }

    pub fn is_cancelled(&self) -> bool {
        match self.inner.0.lock() {
            Ok(c) => *c,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    /// Wait up to `timeout`; returns `true` if cancelled before or during the wait.
    pub fn wait(&self, timeout: Duration) -> bool {
        let (lock, cvar) = &*self.inner;
        let guard = match lock.lock() {
            Ok(g) => g,
            Err(_) => return true,
        };
        match cvar.wait_timeout_while(guard, timeout, |cancelled| !*cancelled) {
            Ok((cancelled, _)) => *cancelled,
            Err(_) => true,
        }
    }
}

/// Sleeper that aborts as soon as its [`CancelToken`] fires.
#[derive(Debug, Clone, Default)]
pub struct CancellableSleeper {
    token: CancelToken,
}

impl CancellableSleeper {
    pub fn new(token: CancelToken) -> Self {
        Self { token }
    }

    pub fn token(&self) -> &CancelToken {
        &self.token
    }
}

impl Sleeper for CancellableSleeper {
    fn sleep(&self, duration: Duration) -> Result<(), SleepInterrupted> {
        if self.token.wait(duration) {
            Err(SleepInterrupted)
        } else {
            Ok(())
        }
    }
}

/// Records requested sleeps without blocking. For tests and dry runs.
#[derive(Debug, Default)]
pub struct RecordingSleeper {
    slept: Mutex<Vec<Duration>>,
}

impl RecordingSleeper {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn recorded(&self) -> Vec<Duration> {
        match self.slept.lock() {
            Ok(s) => s.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

impl Sleeper for RecordingSleeper {
    fn sleep(&self, duration: Duration) -> Result<(), SleepInterrupted> {
        if let Ok(mut s) = self.slept.lock() {
            s.push(duration);
        }
        Ok(())
    }
}

/// Why [`RetryableProcessor::execute`] gave up.
#[derive(Debug, Error)]
pub enum RetryError<E> {
    #[error("gave up after {attempts} attempts: {last}")]
    Exhausted { attempts: u32, last: E },

    #[error("interrupted after {attempts} attempts: {last}")]
    Interrupted { attempts: u32, last: E },
}

impl<E> RetryError<E> {
    pub fn last_error(&self) -> &E {
        match self {
            RetryError::Exhausted { last, .. } | RetryError::Interrupted { last, .. } => last,
        }
    }

    pub fn into_last_error(self) -> E {
        match self {
            RetryError::Exhausted { last, .. } | RetryError::Interrupted { last, .. } => last,
        }
    }
}

/// Runs handlers with bounded exponential backoff.
///
/// Attempts for one event are strictly sequential; the backoff blocks only
/// the calling thread.
#[derive(Clone)]
pub struct RetryableProcessor {
    config: RetryConfig,
    sleeper: Arc<dyn Sleeper>,
}

impl std::fmt::Debug for RetryableProcessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryableProcessor")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl RetryableProcessor {
    pub fn new(config: RetryConfig) -> Self {
        Self::with_sleeper(config, Arc::new(ThreadSleeper))
    }

    pub fn with_sleeper(config: RetryConfig, sleeper: Arc<dyn Sleeper>) -> Self {
        Self { config, sleeper }
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Same backoff and sleeper, different attempt budget.
    pub fn with_max_attempts(&self, max_attempts: u32) -> Self {
        Self {
            config: RetryConfig {
                max_attempts,
                ..self.config.clone()
            },
            sleeper: self.sleeper.clone(),
        }
    }

    /// Run `op` until it succeeds, attempts run out, or a backoff sleep is interrupted.
    ///
    /// `op` receives the 1-based attempt number.
    pub fn execute<T, E, F>(&self, label: &str, mut op: F) -> Result<T, RetryError<E>>
    where
        E: Display,
        F: FnMut(u32) -> Result<T, E>,
    {
        let max_attempts = self.config.max_attempts.max(1);
        let mut delay = self.config.initial_interval.min(self.config.max_interval);
        let mut attempt = 0;

        loop {
            attempt += 1;
            match op(attempt) {
                Ok(value) => {
                    if attempt > 1 {
                        info!(operation = label, attempt, "succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(e) if attempt >= max_attempts => {
                    error!(
                        operation = label,
                        attempts = attempt,
                        error = %e,
                        "retries exhausted"
                    );
                    return Err(RetryError::Exhausted {
                        attempts: attempt,
                        last: e,
                    });
                }
                Err(e) => {
                    let wait = self.config.jittered(delay);
                    warn!(
                        operation = label,
                        attempt,
                        max_attempts,
                        delay_ms = wait.as_millis() as u64,
                        error = %e,
                        "attempt failed, backing off"
                    );
                    if self.sleeper.sleep(wait).is_err() {
                        warn!(operation = label, attempt, "retry interrupted");
                        return Err(RetryError::Interrupted {
                            attempts: attempt,
                            last: e,
                        });
                    }
                    delay = self.config.next_interval(delay);
                }
            }
        }
    }

    /// Deliver one event through `handler`, retrying failures.
    pub fn process_with_retry<E, F>(&self, event: &DomainEvent, mut handler: F) -> bool
    where
        E: Display,
        F: FnMut(&DomainEvent) -> Result<(), E>,
    {
        let label = event.event_type.as_str();
        match self.execute(label, |_| handler(event)) {
            Ok(()) => true,
            Err(RetryError::Exhausted { attempts, last }) => {
                error!(
                    event_id = %event.id,
                    event_type = %event.event_type,
                    attempts,
                    error = %last,
                    "event processing failed"
                );
                false
            }
            Err(RetryError::Interrupted { .. }) => false,
        }
    }

    /// Process each event independently; one failure does not affect the others.
    pub fn process_batch_with_retry<E, F>(&self, events: &[DomainEvent], mut handler: F) -> Vec<bool>
    where
        E: Display,
        F: FnMut(&DomainEvent) -> Result<(), E>,
    {
        events
            .iter()
            .map(|e| self.process_with_retry(e, &mut handler))
            .collect()
    }
}

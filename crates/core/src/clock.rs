//! Time source abstraction.
//!
//! Everything that reads "now" (id generation, retry scheduling, task
//! timestamps) takes a [`Clock`] so tests can drive time explicitly.

use std::sync::Mutex;

use chrono::{DateTime, TimeZone, Utc};

/// A source of wall-clock time.
pub trait Clock: Send + Sync {
    /// Current instant.
    fn now(&self) -> DateTime<Utc>;

    /// Current time in milliseconds since the Unix epoch.
    fn now_millis(&self) -> i64 {
        self.now().timestamp_millis()
    }
}

/// Production clock backed by the system time.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Manually driven clock for tests.
///
/// Starts at the given instant and only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    millis: Mutex<i64>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            millis: Mutex::new(start.timestamp_millis()),
        }
    }

    pub fn at_millis(millis: i64) -> Self {
        Self {
            millis: Mutex::new(millis),
        }
    }

    /// Move the clock forward (or backward with a negative delta).
    pub fn advance_millis(&self, delta: i64) {
        if let Ok(mut m) = self.millis.lock() {
            *m += delta;
        }
    }

    pub fn set_millis(&self, millis: i64) {
        if let Ok(mut m) = self.millis.lock() {
            *m = millis;
        }
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(self.now_millis())
            .single()
            .unwrap_or_else(Utc::now)
    }

    fn now_millis(&self) -> i64 {
        match self.millis.lock() {
            Ok(m) => *m,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }
}

impl<C: Clock + ?Sized> Clock for std::sync::Arc<C> {
    fn now(&self) -> DateTime<Utc> {
        (**self).now()
    }

    fn now_millis(&self) -> i64 {
        (**self).now_millis()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manual_clock_moves_only_when_told() {
        let clock = ManualClock::at_millis(1_000);
        assert_eq!(clock.now_millis(), 1_000);
        clock.advance_millis(5);
        assert_eq!(clock.now_millis(), 1_005);
        clock.advance_millis(-10);
        assert_eq!(clock.now_millis(), 995);
        assert_eq!(clock.now().timestamp_millis(), 995);
    }
}

//! Snowflake-style distributed id generation.
//!
//! Ids are 64-bit signed integers laid out as:
//!
//! ```text
//! | 1 bit sign (0) | 41 bits ms since EPOCH | 10 bits machine id | 12 bits sequence |
//! ```
//!
//! Every node gets a distinct machine id, so ids are unique across nodes
//! without coordination, and ids minted by one generator are strictly
//! increasing as long as the clock does not move backwards.

use core::str::FromStr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

use crate::clock::{Clock, SystemClock};
use crate::error::DomainError;

/// Custom epoch: 2021-01-01T00:00:00Z in milliseconds.
pub const EPOCH_MILLIS: i64 = 1_609_459_200_000;

/// Longest a caller waits for the next millisecond after a sequence overflow.
pub const MAX_OVERFLOW_WAIT: Duration = Duration::from_millis(100);

const MACHINE_ID_BITS: u32 = 10;
const SEQUENCE_BITS: u32 = 12;

pub const MAX_MACHINE_ID: i64 = (1 << MACHINE_ID_BITS) - 1;
const SEQUENCE_MASK: i64 = (1 << SEQUENCE_BITS) - 1;

const MACHINE_ID_SHIFT: u32 = SEQUENCE_BITS;
const TIMESTAMP_SHIFT: u32 = SEQUENCE_BITS + MACHINE_ID_BITS;

/// A generated 64-bit id.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SnowflakeId(i64);

impl SnowflakeId {
    pub fn from_raw(raw: i64) -> Self {
        Self(raw)
    }

    pub fn as_i64(&self) -> i64 {
        self.0
    }

    /// Milliseconds since the Unix epoch at which this id was minted.
    pub fn timestamp_millis(&self) -> i64 {
        (self.0 >> TIMESTAMP_SHIFT) + EPOCH_MILLIS
    }

    pub fn machine_id(&self) -> u16 {
        ((self.0 >> MACHINE_ID_SHIFT) & MAX_MACHINE_ID) as u16
    }

    pub fn sequence(&self) -> u16 {
        (self.0 & SEQUENCE_MASK) as u16
    }
}

impl core::fmt::Display for SnowflakeId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Display::fmt(&self.0, f)
    }
}

impl From<SnowflakeId> for i64 {
    fn from(value: SnowflakeId) -> Self {
        value.0
    }
}

impl FromStr for SnowflakeId {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let raw = i64::from_str(s)
            .map_err(|e| DomainError::invalid_id(format!("SnowflakeId: {}", e)))?;
        if raw < 0 {
            return Err(DomainError::invalid_id("SnowflakeId: negative value"));
        }
        Ok(Self(raw))
    }
}

/// Errors raised by [`SnowflakeIdGenerator`].
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum IdError {
    #[error("machine id {0} out of range [0, 1023]")]
    InvalidMachineId(i64),

    /// The clock moved backwards; no id is produced for this call.
    #[error("clock moved backwards: last timestamp {last}ms, now {now}ms")]
    ClockRegression { last: i64, now: i64 },

    /// The sequence ran out and the clock did not advance within [`MAX_OVERFLOW_WAIT`].
    #[error("clock stalled at {last}ms after the sequence was exhausted")]
    ClockStalled { last: i64 },

    #[error("timestamp {0}ms is before the generator epoch")]
    BeforeEpoch(i64),

    #[error("generator state lock poisoned")]
    Poisoned,
}

#[derive(Debug)]
struct GeneratorState {
    last_timestamp: i64,
    sequence: i64,
}

/// Coordination-free 64-bit id generator.
///
/// One instance per process, shared behind an `Arc`; all mutable state lives
/// behind a single mutex.
pub struct SnowflakeIdGenerator {
    machine_id: i64,
    clock: Arc<dyn Clock>,
    state: Mutex<GeneratorState>,
}

impl core::fmt::Debug for SnowflakeIdGenerator {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SnowflakeIdGenerator")
            .field("machine_id", &self.machine_id)
            .finish_non_exhaustive()
    }
}

impl SnowflakeIdGenerator {
    /// Create a generator using the system clock.
    pub fn new(machine_id: i64) -> Result<Self, IdError> {
        Self::with_clock(machine_id, Arc::new(SystemClock))
    }

    pub fn with_clock(machine_id: i64, clock: Arc<dyn Clock>) -> Result<Self, IdError> {
        if !(0..=MAX_MACHINE_ID).contains(&machine_id) {
            return Err(IdError::InvalidMachineId(machine_id));
        }
        Ok(Self {
            machine_id,
            clock,
            state: Mutex::new(GeneratorState {
                last_timestamp: -1,
                sequence: 0,
            }),
        })
    }

    pub fn machine_id(&self) -> i64 {
        self.machine_id
    }

    /// Mint the next id.
    pub fn next_id(&self) -> Result<SnowflakeId, IdError> {
        let mut state = self.state.lock().map_err(|_| IdError::Poisoned)?;

        let mut now = self.clock.now_millis();
        if now < state.last_timestamp {
            warn!(
                last = state.last_timestamp,
                now,
                "clock moved backwards, refusing to generate id"
            );
            return Err(IdError::ClockRegression {
                last: state.last_timestamp,
                now,
            });
        }

        let mut sequence = 0;
        if now == state.last_timestamp {
            sequence = (state.sequence + 1) & SEQUENCE_MASK;
            if sequence == 0 {
                // 4096 ids already issued in this millisecond.
                now = self.wait_next_millis(state.last_timestamp)?;
            }
        }

        if now < EPOCH_MILLIS {
            return Err(IdError::BeforeEpoch(now));
        }

        state.last_timestamp = now;
        state.sequence = sequence;

        let raw = ((now - EPOCH_MILLIS) << TIMESTAMP_SHIFT)
            | (self.machine_id << MACHINE_ID_SHIFT)
            | sequence;
        Ok(SnowflakeId(raw))
    }

    fn wait_next_millis(&self, last: i64) -> Result<i64, IdError> {
        let deadline = Instant::now() + MAX_OVERFLOW_WAIT;
        loop {
            let now = self.clock.now_millis();
            if now > last {
                return Ok(now);
            }
            if now < last {
                warn!(last, now, "clock moved backwards while waiting for next millisecond");
                return Err(IdError::ClockRegression { last, now });
            }
            if Instant::now() >= deadline {
                warn!(last, "clock did not advance after sequence overflow");
                return Err(IdError::ClockStalled { last });
            }
            std::thread::yield_now();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use proptest::prelude::*;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicI64, Ordering};

    const START: i64 = EPOCH_MILLIS + 1_000_000;

    fn generator(clock: Arc<ManualClock>) -> SnowflakeIdGenerator {
        SnowflakeIdGenerator::with_clock(7, clock).unwrap()
    }

    /// Advances one millisecond every `every` reads.
    struct TickingClock {
        reads: AtomicI64,
        every: i64,
    }

    impl Clock for TickingClock {
        fn now(&self) -> chrono::DateTime<chrono::Utc> {
            chrono::Utc::now()
        }

        fn now_millis(&self) -> i64 {
            let n = self.reads.fetch_add(1, Ordering::SeqCst);
            START + n / self.every
        }
    }

    #[test]
    fn rejects_out_of_range_machine_id() {
        assert_eq!(
            SnowflakeIdGenerator::new(1024).unwrap_err(),
            IdError::InvalidMachineId(1024)
        );
        assert_eq!(
            SnowflakeIdGenerator::new(-1).unwrap_err(),
            IdError::InvalidMachineId(-1)
        );
        assert!(SnowflakeIdGenerator::new(0).is_ok());
        assert!(SnowflakeIdGenerator::new(1023).is_ok());
    }

    #[test]
    fn id_layout_round_trips_components() {
        let clock = Arc::new(ManualClock::at_millis(START));
        let id_gen = generator(clock.clone());

        let first = id_gen.next_id().unwrap();
        let second = id_gen.next_id().unwrap();

        assert_eq!(first.timestamp_millis(), START);
        assert_eq!(first.machine_id(), 7);
        assert_eq!(first.sequence(), 0);
        assert_eq!(second.sequence(), 1);
        assert!(second > first);

        clock.advance_millis(1);
        let third = id_gen.next_id().unwrap();
        assert_eq!(third.sequence(), 0);
        assert_eq!(third.timestamp_millis(), START + 1);
    }

    #[test]
    fn clock_rollback_is_rejected() {
        let clock = Arc::new(ManualClock::at_millis(START));
        let id_gen = generator(clock.clone());
        id_gen.next_id().unwrap();

        clock.advance_millis(-5);
        let err = id_gen.next_id().unwrap_err();
        assert_eq!(
            err,
            IdError::ClockRegression {
                last: START,
                now: START - 5
            }
        );

        // Recovers once the clock catches up.
        clock.advance_millis(5);
        assert!(id_gen.next_id().is_ok());
    }

    #[test]
    fn sequence_overflow_waits_for_next_millisecond() {
        let clock = Arc::new(TickingClock {
            reads: AtomicI64::new(0),
            every: 10_000,
        });
        let id_gen = SnowflakeIdGenerator::with_clock(1, clock).unwrap();

        let mut seen = HashSet::new();
        let mut last = None;
        for _ in 0..5_000 {
            let id = id_gen.next_id().unwrap();
            assert!(seen.insert(id), "duplicate id {id}");
            if let Some(prev) = last {
                assert!(id > prev);
            }
            last = Some(id);
        }
    }

    #[test]
    fn frozen_clock_after_overflow_fails_without_duplicates() {
        let clock = Arc::new(ManualClock::at_millis(START));
        let id_gen = generator(clock.clone());
        let mut seen = HashSet::new();
        for _ in 0..4096 {
            assert!(seen.insert(id_gen.next_id().unwrap()));
        }

        assert_eq!(id_gen.next_id().unwrap_err(), IdError::ClockStalled { last: START });
        assert_eq!(id_gen.next_id().unwrap_err(), IdError::ClockStalled { last: START });

        clock.advance_millis(1);
        let next = id_gen.next_id().unwrap();
        assert_eq!(next.sequence(), 0);
        assert!(seen.insert(next));
    }

    /// Returns `START` until `overflow_after` reads, then one millisecond earlier.
    struct RewindingClock {
        reads: AtomicI64,
        overflow_after: i64,
    }

    impl Clock for RewindingClock {
        fn now(&self) -> chrono::DateTime<chrono::Utc> {
            chrono::Utc::now()
        }

        fn now_millis(&self) -> i64 {
            if self.reads.fetch_add(1, Ordering::SeqCst) < self.overflow_after {
                START
            } else {
                START - 1
            }
        }
    }

    #[test]
    fn clock_regression_while_waiting_is_reported() {
        let id_gen = SnowflakeIdGenerator::with_clock(
            1,
            Arc::new(RewindingClock {
                reads: AtomicI64::new(0),
                overflow_after: 4097,
            }),
        )
        .unwrap();
        for _ in 0..4096 {
            id_gen.next_id().unwrap();
        }

        assert_eq!(
            id_gen.next_id().unwrap_err(),
            IdError::ClockRegression {
                last: START,
                now: START - 1
            }
        );
    }

    #[test]
    fn concurrent_generation_has_no_duplicates() {
        let id_gen = Arc::new(SnowflakeIdGenerator::new(3).unwrap());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let id_gen = id_gen.clone();
                std::thread::spawn(move || {
                    (0..2_000)
                        .map(|_| id_gen.next_id().unwrap())
                        .collect::<Vec<_>>()
                })
            })
            .collect();

        let mut all = HashSet::new();
        for h in handles {
            for id in h.join().unwrap() {
                assert!(all.insert(id));
            }
        }
        assert_eq!(all.len(), 16_000);
    }

    #[test]
    fn parses_from_string() {
        let id: SnowflakeId = "123456789".parse().unwrap();
        assert_eq!(id.as_i64(), 123_456_789);
        assert!("-4".parse::<SnowflakeId>().is_err());
        assert!("abc".parse::<SnowflakeId>().is_err());
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 256,
            ..ProptestConfig::default()
        })]

        #[test]
        fn ids_increase_for_non_decreasing_time(steps in proptest::collection::vec(0i64..3, 1..200)) {
            let clock = Arc::new(ManualClock::at_millis(START));
            let id_gen = generator(clock.clone());
            let mut prev = id_gen.next_id().unwrap();
            for step in steps {
                clock.advance_millis(step);
                let next = id_gen.next_id().unwrap();
                prop_assert!(next > prev);
                prev = next;
            }
        }
    }
}

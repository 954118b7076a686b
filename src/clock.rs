//! Time sources for the throttling engine.
//!
//! Everything that reads the current time goes through [`Clock`] so tests
//! can drive the engine with a [`ManualClock`] instead of sleeping.

use chrono::{DateTime, TimeDelta, Utc};
use parking_lot::Mutex;
use std::time::Duration;

/// A source of the current wall-clock time.
pub trait Clock: Send + Sync {
    /// The current instant.
    fn now(&self) -> DateTime<Utc>;
}

/// The system wall clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    /// Create a clock frozen at `start`.
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    /// Create a clock frozen at the Unix epoch.
    pub fn at_epoch() -> Self {
        Self::new(DateTime::<Utc>::UNIX_EPOCH)
    }

    /// Move the clock forward.
    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock();
        *now += to_delta(by);
    }

    /// Move the clock backward, simulating skew between hosts.
    pub fn rewind(&self, by: Duration) {
        let mut now = self.now.lock();
        *now -= to_delta(by);
    }

}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock()
    }
}

/// Convert a std duration into a chrono delta, saturating on overflow.
pub(crate) fn to_delta(d: Duration) -> TimeDelta {
    TimeDelta::from_std(d).unwrap_or(TimeDelta::MAX)
}

/// `at + d`, pinned to the latest representable instant instead of overflowing.
pub(crate) fn add_saturating(at: DateTime<Utc>, d: Duration) -> DateTime<Utc> {
    at.checked_add_signed(to_delta(d)).unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Convert a chrono delta into a std duration, clamping negatives to zero.
pub(crate) fn to_duration(d: TimeDelta) -> Duration {
    d.to_std().unwrap_or(Duration::ZERO)
}

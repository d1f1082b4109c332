//! Clock sources
//!
//! Liveness checks and refresh scheduling compare stored timestamps against
//! "now". The [`Clock`] trait lets tests drive that comparison explicitly,
//! while production code uses [`BoundedClock`], a wall clock that never goes
//! backward.

use chrono::{DateTime, Duration, Utc};
use std::sync::atomic::{AtomicI64, Ordering};

/// Source of the current time.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// A clock source that guarantees monotonically increasing timestamps.
pub struct BoundedClock {
    /// High-water mark: the largest timestamp we've ever returned (nanos)
    high_water_ns: AtomicI64,
}

impl BoundedClock {
    pub fn new() -> Self {
        Self {
            high_water_ns: AtomicI64::new(0),
        }
    }

    /// Returns a monotonically increasing nanosecond timestamp.
    ///
    /// If the wall clock has gone backward (e.g. NTP adjustment),
    /// returns the previous high-water mark + 1ns instead.
    pub fn now_nanos(&self) -> i64 {
        let wall = Utc::now().timestamp_nanos_opt().unwrap_or(0);
        loop {
            let prev = self.high_water_ns.load(Ordering::Acquire);
            let ts = wall.max(prev + 1);
            match self.high_water_ns.compare_exchange_weak(
                prev,
                ts,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return ts,
                Err(_) => continue,
            }
        }
    }
}

impl Clock for BoundedClock {
    fn now(&self) -> DateTime<Utc> {
        DateTime::from_timestamp_nanos(self.now_nanos())
    }
}

impl Default for BoundedClock {
    fn default() -> Self {
        Self::new()
    }
}

/// A clock that only moves when told to.
///
/// Used by tests and simulations that need to age heartbeats or make
/// refresh schedules come due without sleeping.
pub struct ManualClock {
    now_ms: AtomicI64,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now_ms: AtomicI64::new(start.timestamp_millis()),
        }
    }

    /// Move the clock forward.
    pub fn advance(&self, by: Duration) {
        self.now_ms.fetch_add(by.num_milliseconds(), Ordering::SeqCst);
    }

    pub fn set(&self, to: DateTime<Utc>) {
        self.now_ms.store(to.timestamp_millis(), Ordering::SeqCst);
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new(Utc::now())
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        DateTime::from_timestamp_millis(self.now_ms.load(Ordering::SeqCst)).unwrap_or_default()
    }
}

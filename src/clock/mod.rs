//! Server clock subsystem.
//!
//! # Data Flow
//! ```text
//! ClockSynchronizer (periodic or on demand):
//!     → HEAD probe via Dispatch, round trip r measured on the monotonic clock
//!     → server Date T (second precision)
//!     → offset = T + r/2 − WallClock::now() at receipt
//!     → stored, replacing the previous offset
//!
//! corrected_now() = WallClock::now() + offset
//! ```
//!
//! # Design Decisions
//! - Local wall time comes from an injected `WallClock` so offsets are testable
//! - Failures leave the last good offset in place

pub mod sync;

use chrono::{DateTime, Utc};
use std::sync::Mutex;

pub use sync::{ClockOffset, ClockState, ClockSynchronizer};

/// Source of local wall-clock time.
pub trait WallClock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// The host's system clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl WallClock for SystemClock {
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
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn set(&self, now: DateTime<Utc>) {
        *self.now.lock().expect("manual clock mutex poisoned") = now;
    }

    pub fn advance(&self, by: chrono::Duration) {
        let mut now = self.now.lock().expect("manual clock mutex poisoned");
        *now += by;
    }
}

impl WallClock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().expect("manual clock mutex poisoned")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_manual_clock_moves_only_when_told() {
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let clock = ManualClock::new(start);
        assert_eq!(clock.now(), start);

        clock.advance(chrono::Duration::seconds(5));
        assert_eq!(clock.now(), start + chrono::Duration::seconds(5));
    }
}

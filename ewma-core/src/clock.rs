//! Monotonic time sources.
//!
//! Sample timestamps and aggregation gating share one clock so that the
//! two are always comparable.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// A monotonic nanosecond clock.
pub trait TimeSource: Send + Sync {
    /// Current monotonic time in nanoseconds.
    fn now_nanos(&self) -> u64;
}

/// Production clock backed by [`Instant`].
///
/// Readings are nanoseconds since the clock was created, offset by one so
/// that a real reading is never zero (zero means "never" in host state).
#[derive(Debug, Clone, Copy)]
pub struct MonotonicClock {
    epoch: Instant,
}

impl MonotonicClock {
    /// Create a clock whose epoch is now.
    pub fn new() -> Self {
        Self {
            epoch: Instant::now(),
        }
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl TimeSource for MonotonicClock {
    fn now_nanos(&self) -> u64 {
        let elapsed = self.epoch.elapsed().as_nanos();
        u64::try_from(elapsed).unwrap_or(u64::MAX - 1) + 1
    }
}

/// A clock that only moves when told to. Used by tests and simulations.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicU64,
}

impl ManualClock {
    /// Create a clock reading `start`.
    pub fn new(start: Duration) -> Self {
        Self {
            now: AtomicU64::new(duration_to_nanos(start)),
        }
    }

    /// Jump to an absolute time. Going backwards is allowed.
    pub fn set(&self, now: Duration) {
        self.now.store(duration_to_nanos(now), Ordering::Release);
    }

    /// Move the clock forward.
    pub fn advance(&self, by: Duration) {
        self.now.fetch_add(duration_to_nanos(by), Ordering::AcqRel);
    }
}

impl TimeSource for ManualClock {
    fn now_nanos(&self) -> u64 {
        self.now.load(Ordering::Acquire)
    }
}

/// Convert a duration to whole nanoseconds, saturating at `u64::MAX`.
pub fn duration_to_nanos(duration: Duration) -> u64 {
    u64::try_from(duration.as_nanos()).unwrap_or(u64::MAX)
}

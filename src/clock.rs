//! Time sources for driving the scheduler.
//!
//! The driver reads time through the [`TimeSource`] trait so the same state
//! machine runs against the wall clock in production and against a
//! hand-advanced [`VirtualClock`] in tests.

use crate::types::Time;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Time source abstraction for reading the current instant.
///
/// Implementations must be monotone: successive `now` calls never go
/// backwards. Both built-in sources guarantee this by construction.
pub trait TimeSource: Send + Sync {
    /// Returns the current time.
    fn now(&self) -> Time;
}

/// Wall clock time source for production use.
///
/// Uses `std::time::Instant` internally; the epoch is the instant this
/// source was created, so readings start near [`Time::ZERO`].
#[derive(Debug)]
pub struct WallClock {
    epoch: Instant,
}

impl WallClock {
    /// Creates a new wall clock time source.
    #[must_use]
    pub fn new() -> Self {
        Self {
            epoch: Instant::now(),
        }
    }
}

impl Default for WallClock {
    fn default() -> Self {
        Self::new()
    }
}

impl TimeSource for WallClock {
    fn now(&self) -> Time {
        Time::from_millis(self.epoch.elapsed().as_millis() as u64)
    }
}

/// Virtual time source for deterministic tests.
///
/// Time only advances when explicitly told to, so wheel rotation, firing
/// and horizon math can be exercised without real sleeps.
///
/// # Example
///
/// ```
/// use spindle::{TimeSource, Time, VirtualClock};
///
/// let clock = VirtualClock::new();
/// assert_eq!(clock.now(), Time::ZERO);
///
/// clock.advance(1_000);
/// assert_eq!(clock.now(), Time::from_secs(1));
/// ```
#[derive(Debug)]
pub struct VirtualClock {
    now_ms: AtomicU64,
}

impl VirtualClock {
    /// Creates a virtual clock starting at the epoch.
    #[must_use]
    pub fn new() -> Self {
        Self {
            now_ms: AtomicU64::new(0),
        }
    }

    /// Creates a virtual clock starting at the given time.
    #[must_use]
    pub fn starting_at(time: Time) -> Self {
        Self {
            now_ms: AtomicU64::new(time.as_millis()),
        }
    }

    /// Advances time by the given number of milliseconds.
    pub fn advance(&self, millis: u64) {
        self.now_ms.fetch_add(millis, Ordering::Release);
    }

    /// Advances time to the given absolute time.
    ///
    /// If the target is in the past, this is a no-op; the clock never
    /// moves backwards.
    pub fn advance_to(&self, time: Time) {
        let target = time.as_millis();
        self.now_ms.fetch_max(target, Ordering::Release);
    }
}

impl Default for VirtualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl TimeSource for VirtualClock {
    fn now(&self) -> Time {
        Time::from_millis(self.now_ms.load(Ordering::Acquire))
    }
}

//! Core time type for the scheduler.
//!
//! The engine quantizes everything to one millisecond, so [`Time`] is a
//! millisecond count since the owning timer's epoch (the instant its clock
//! was created). Sub-millisecond precision is intentionally unrepresentable.

use core::fmt;
use core::ops::Add;
use std::time::Duration;

/// A millisecond-resolution instant, measured from the timer's epoch.
///
/// `Time` is a plain `u64` newtype with saturating arithmetic; it never
/// wraps and never goes below the epoch.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Time(u64);

impl Time {
    /// The epoch itself.
    pub const ZERO: Self = Self(0);

    /// The maximum representable instant.
    pub const MAX: Self = Self(u64::MAX);

    /// Creates a time from milliseconds since the epoch.
    #[must_use]
    pub const fn from_millis(millis: u64) -> Self {
        Self(millis)
    }

    /// Creates a time from seconds since the epoch.
    #[must_use]
    pub const fn from_secs(secs: u64) -> Self {
        Self(secs.saturating_mul(1_000))
    }

    /// Returns the time as milliseconds since the epoch.
    #[must_use]
    pub const fn as_millis(self) -> u64 {
        self.0
    }

    /// Returns the time as whole seconds since the epoch (truncated).
    #[must_use]
    pub const fn as_secs(self) -> u64 {
        self.0 / 1_000
    }

    /// Adds a number of milliseconds, saturating on overflow.
    #[must_use]
    pub const fn saturating_add_millis(self, millis: u64) -> Self {
        Self(self.0.saturating_add(millis))
    }

    /// Subtracts a number of milliseconds, saturating at the epoch.
    #[must_use]
    pub const fn saturating_sub_millis(self, millis: u64) -> Self {
        Self(self.0.saturating_sub(millis))
    }

    /// Returns the number of milliseconds between two times.
    ///
    /// Returns 0 if `self` is before `earlier`.
    #[must_use]
    pub const fn duration_since(self, earlier: Self) -> u64 {
        self.0.saturating_sub(earlier.0)
    }
}

impl Add<Duration> for Time {
    type Output = Self;

    /// Adds a duration, rounding any sub-millisecond remainder **up** so a
    /// deadline computed as `now + delay` can only land at or after the
    /// requested instant, never before it.
    fn add(self, rhs: Duration) -> Self::Output {
        let millis = rhs.as_nanos().div_ceil(1_000_000);
        self.saturating_add_millis(u64::try_from(millis).unwrap_or(u64::MAX))
    }
}

impl fmt::Debug for Time {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Time({}ms)", self.0)
    }
}

impl fmt::Display for Time {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0 >= 1_000 {
            write!(f, "{}.{:03}s", self.0 / 1_000, self.0 % 1_000)
        } else {
            write!(f, "{}ms", self.0)
        }
    }
}

//! Error types for the scheduling surface.
//!
//! Nothing is retried internally and no error crosses the intake queue:
//! both variants are surfaced synchronously to the caller of
//! `schedule` / `schedule_at` before an entry is enqueued.

use std::time::Duration;

/// Error returned when a task cannot be scheduled.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ScheduleError {
    /// The requested delay exceeds the wheel's maximum horizon.
    #[error("delay {requested:?} exceeds the maximum schedulable horizon {max:?}")]
    OutOfRange {
        /// The requested delay, relative to the current time.
        requested: Duration,
        /// The maximum supported delay (`64^7 - 1` milliseconds).
        max: Duration,
    },

    /// The timer has been stopped; no further entries are accepted.
    #[error("timer is stopped")]
    Stopped,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_messages() {
        let err = ScheduleError::OutOfRange {
            requested: Duration::from_secs(10),
            max: Duration::from_secs(5),
        };
        assert!(err.to_string().contains("maximum schedulable horizon"));
        assert_eq!(ScheduleError::Stopped.to_string(), "timer is stopped");
    }
}

//! Spindle: a hierarchical timing-wheel delay scheduler.
//!
//! # Overview
//!
//! Spindle schedules millions of one-shot callbacks with millisecond
//! resolution and a horizon of about 139 years. Producers on any thread
//! enqueue entries wait-free; a single driver thread owns the wheel,
//! drains the intake queue in batch, fires whatever is due and sleeps
//! exactly until the next deadline.
//!
//! # Core Guarantees
//!
//! - **Wait-free scheduling**: `schedule` is two atomic operations plus a
//!   pool allocation; it never blocks on the driver or on other producers
//! - **At-most-once firing**: every callback runs at most once, and not
//!   at all if canceled before dispatch
//! - **Bounded lateness**: a callback fires no earlier than its deadline
//!   and no later than one slot span plus scheduler wake latency
//! - **Fault isolation**: a panicking callback is caught at the handler
//!   boundary; the wheel and the driver survive
//!
//! # Example
//!
//! ```
//! use spindle::Timer;
//! use std::time::Duration;
//!
//! let timer = Timer::new(|entry| entry.execute());
//! timer.start();
//!
//! let handle = timer.schedule(Duration::from_millis(10), || {
//!     println!("fired");
//! }).unwrap();
//!
//! // Changed our mind: cancellation is O(1) and wait-free.
//! handle.cancel();
//!
//! timer.sleep(Duration::from_millis(20)).unwrap();
//! timer.stop();
//! ```
//!
//! # Module Structure
//!
//! - [`timer`]: the public [`Timer`], its builder and lifecycle
//! - [`entry`]: pooled entries, [`TimerHandle`], [`ExpiredEntry`]
//! - [`clock`]: [`TimeSource`], [`WallClock`], [`VirtualClock`]
//! - [`types`]: the millisecond [`Time`] instant
//! - [`error`]: [`ScheduleError`]
//! - [`periodic`]: self-rescheduling interval / fixed-instant tasks
//! - [`test_utils`]: tracing-based test logging helpers

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_const_for_fn)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::cast_possible_truncation)]

pub mod clock;
pub mod entry;
pub mod error;
pub mod periodic;
pub mod test_utils;
pub mod timer;
pub mod types;

mod driver;
mod queue;
mod sleep;
mod wheel;

// Re-exports for convenient access to the core surface
pub use clock::{TimeSource, VirtualClock, WallClock};
pub use entry::{ExpiredEntry, TimerHandle};
pub use error::ScheduleError;
pub use periodic::PeriodicTask;
pub use timer::{Timer, TimerBuilder};
pub use types::Time;

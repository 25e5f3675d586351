//! One-shot delay conveniences layered over the core scheduler.
//!
//! [`Timer::after`] hands back a capacity-1 channel that receives the
//! clock reading when the delay fires; [`Timer::sleep`] simply blocks on
//! it. Both assume the timer's handler executes entries (the default
//! `|entry| entry.execute()` handler does).

use crate::clock::TimeSource;
use crate::error::ScheduleError;
use crate::timer::Timer;
use crate::types::Time;
use std::sync::mpsc::{self, Receiver};
use std::sync::Arc;
use std::time::Duration;

impl<C: TimeSource + 'static> Timer<C> {
    /// Returns a channel that receives the current instant once `delay`
    /// has elapsed.
    ///
    /// If the timer stops before the delay fires, the channel closes
    /// without a value.
    pub fn after(&self, delay: Duration) -> Result<Receiver<Time>, ScheduleError> {
        let (sender, receiver) = mpsc::sync_channel(1);
        let shared = Arc::downgrade(self.shared());
        self.schedule(delay, move || {
            if let Some(shared) = shared.upgrade() {
                let _ = sender.try_send(shared.clock.now());
            }
        })?;
        Ok(receiver)
    }

    /// Blocks the calling thread for `delay`, returning the instant the
    /// delay fired.
    ///
    /// Returns [`ScheduleError::Stopped`] if the timer stops first.
    pub fn sleep(&self, delay: Duration) -> Result<Time, ScheduleError> {
        let receiver = self.after(delay)?;
        receiver.recv().map_err(|_| ScheduleError::Stopped)
    }
}

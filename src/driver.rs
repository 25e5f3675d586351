//! The single-consumer driver: drains the intake queue into the wheel,
//! fires expired entries, reshapes the hierarchy and computes how long to
//! sleep.
//!
//! Only the driver touches the wheel and the entry links inside it; the
//! intake queue's head and each entry's cancel flag are the only
//! cross-thread mutable state. The worker blocks on a [`Signal`] — a
//! coalescing wake permit plus a stop latch over one mutex and condvar —
//! with a timeout equal to the distance to the next deadline.

use crate::clock::TimeSource;
use crate::entry::ExpiredEntry;
use crate::timer::Shared;
use crate::wheel::{Wheel, MAX_LEVEL, MAX_MS};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::Ordering;
use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

/// Why a [`Signal::wait`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WaitOutcome {
    /// A producer rang the wake signal.
    Woken,
    /// The sleep horizon elapsed.
    TimedOut,
    /// The timer is shutting down.
    Stopped,
}

#[derive(Default)]
struct SignalState {
    wake: bool,
    stop: bool,
}

/// Coalescing wake/stop signal for the worker.
///
/// The wake side is a single permit: ringing it twice before the driver
/// looks is the same as ringing it once, which is sound because the driver
/// drains the whole queue on every pass. The stop side is a latch.
pub(crate) struct Signal {
    state: Mutex<SignalState>,
    cvar: Condvar,
}

impl Signal {
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(SignalState::default()),
            cvar: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SignalState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Rings the wake permit. Callable from any thread.
    pub(crate) fn ring_wake(&self) {
        let mut state = self.lock();
        if !state.wake {
            state.wake = true;
            self.cvar.notify_one();
        }
    }

    /// Latches the stop flag. Idempotent.
    pub(crate) fn ring_stop(&self) {
        let mut state = self.lock();
        state.stop = true;
        self.cvar.notify_all();
    }

    /// Blocks until woken, stopped, or `timeout` elapses (`None` waits
    /// indefinitely). Consumes the wake permit; the stop latch stays set.
    pub(crate) fn wait(&self, timeout: Option<Duration>) -> WaitOutcome {
        let deadline = timeout.map(|timeout| Instant::now() + timeout);
        let mut state = self.lock();
        loop {
            if state.stop {
                return WaitOutcome::Stopped;
            }
            if state.wake {
                state.wake = false;
                return WaitOutcome::Woken;
            }
            state = match deadline {
                None => match self.cvar.wait(state) {
                    Ok(guard) => guard,
                    Err(poisoned) => poisoned.into_inner(),
                },
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return WaitOutcome::TimedOut;
                    }
                    match self.cvar.wait_timeout(state, deadline - now) {
                        Ok((guard, _)) => guard,
                        Err(poisoned) => poisoned.into_inner().0,
                    }
                }
            };
        }
    }
}

/// Wheel ownership and the driver's view of time.
///
/// `origin_ms` is the clock reading that corresponds to offset 0 of the
/// current root wheel; `live` counts entries resident in the wheel.
pub(crate) struct DriverCore {
    wheel: Option<Box<Wheel>>,
    origin_ms: u64,
    live: u64,
}

impl DriverCore {
    pub(crate) fn new() -> Self {
        Self {
            wheel: None,
            origin_ms: 0,
            live: 0,
        }
    }

    pub(crate) fn live(&self) -> u64 {
        self.live
    }

    #[cfg(test)]
    fn wheel_level(&self) -> Option<usize> {
        self.wheel.as_deref().map(Wheel::level)
    }

    /// Bitmap faithfulness and count conservation, checked recursively.
    #[cfg(test)]
    fn assert_consistent<C: TimeSource>(&self, shared: &Shared<C>) {
        match &self.wheel {
            Some(wheel) => assert_eq!(wheel.assert_consistent(&shared.pool), self.live),
            None => assert_eq!(self.live, 0),
        }
    }

    /// Moves every queued entry into the wheel; overdue entries are
    /// dispatched on the spot. Returns the number drained.
    pub(crate) fn drain<C: TimeSource>(&mut self, shared: &Shared<C>) -> usize {
        let drained = shared
            .intake
            .drain(&shared.pool, |entry| self.place(shared, entry));
        shared.publish_pending(self.live);
        drained
    }

    fn place<C: TimeSource>(&mut self, shared: &Shared<C>, entry: u32) {
        let now_ms = shared.clock.now().as_millis();
        let deadline_ms = shared.pool.slot(entry).deadline().as_millis();

        if deadline_ms <= now_ms {
            dispatch(shared, entry);
            return;
        }

        if self.wheel.is_none() {
            // First resident entry re-anchors the wheel at the present.
            self.origin_ms = now_ms;
            let interval = deadline_ms - now_ms;
            let mut level = 0;
            while level < MAX_LEVEL && interval >= MAX_MS[level] {
                level += 1;
            }
            let mut wheel = Box::new(Wheel::new(level));
            wheel.add(&shared.pool, entry, interval);
            self.wheel = Some(wheel);
        } else {
            let mut wheel = self.wheel.take().expect("wheel checked above");
            let interval = deadline_ms.saturating_sub(self.origin_ms);
            while interval >= wheel.max_ms() && wheel.level() < MAX_LEVEL {
                wheel = Wheel::promote(wheel);
            }
            if interval >= wheel.max_ms() {
                // The origin trails the clock while the driver sleeps, so
                // a horizon-edge deadline can overflow even the top wheel.
                // Refused rather than truncated: a truncated entry would
                // fire early.
                self.wheel = Some(wheel);
                tracing::error!(
                    deadline_ms,
                    origin_ms = self.origin_ms,
                    "deadline beyond the top wheel span; entry dropped unfired"
                );
                shared.pool.release(entry);
                return;
            }
            wheel.add(&shared.pool, entry, interval);
            self.wheel = Some(wheel);
        }
        self.live += 1;
    }

    /// Fires everything due by now, then performs maintenance: drop an
    /// emptied wheel, rotate the origin forward, collapse padding levels.
    /// Returns the number of entries dispatched.
    pub(crate) fn fire<C: TimeSource>(&mut self, shared: &Shared<C>) -> u64 {
        if self.wheel.is_none() || self.live == 0 {
            return 0;
        }
        let now_ms = shared.clock.now().as_millis();
        let elapsed = now_ms.saturating_sub(self.origin_ms);

        let wheel = self.wheel.as_mut().expect("wheel checked above");
        let fired = wheel.expire(&shared.pool, &mut |entry| dispatch(shared, entry), elapsed);
        self.live -= fired;

        self.maintain(elapsed);
        shared.publish_pending(self.live);
        fired
    }

    fn maintain(&mut self, elapsed_ms: u64) {
        let Some(mut wheel) = self.wheel.take() else {
            return;
        };
        if wheel.is_empty() {
            self.live = 0;
            return;
        }

        let slots = elapsed_ms / wheel.ms_per_slot();
        if slots > 0 {
            wheel.rotate(slots);
            self.origin_ms += slots * wheel.ms_per_slot();
        }

        while wheel.can_level_down() {
            wheel = wheel.level_down();
        }
        self.wheel = Some(wheel);
    }

    /// Absolute clock instant of the next wake-up, in milliseconds.
    /// `None` means idle; a value at or before now means re-loop.
    pub(crate) fn next_wake<C: TimeSource>(&self, shared: &Shared<C>) -> Option<u64> {
        let wheel = self.wheel.as_ref()?;
        if self.live == 0 {
            return None;
        }
        let next = wheel.next_expiration_ms();
        let now_ms = shared.clock.now().as_millis();
        let elapsed = now_ms.saturating_sub(self.origin_ms);
        if next <= elapsed {
            Some(now_ms)
        } else {
            Some(self.origin_ms + next)
        }
    }
}

/// Hands one expired entry to the user handler, isolating panics so a
/// faulting callback cannot poison the wheel or kill the worker. The
/// entry's slot is released by the guard even during unwind.
fn dispatch<C: TimeSource>(shared: &Shared<C>, entry: u32) {
    let expired = ExpiredEntry::new(&shared.pool, entry);
    if let Err(payload) = catch_unwind(AssertUnwindSafe(|| (shared.handler)(expired))) {
        let message = panic_message(payload.as_ref());
        tracing::error!(panic = %message, "timer callback panicked; driver continues");
        if let Some(hook) = &shared.panic_hook {
            hook(&message);
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    payload.downcast_ref::<&str>().map_or_else(
        || {
            payload
                .downcast_ref::<String>()
                .cloned()
                .unwrap_or_else(|| "opaque panic payload".to_owned())
        },
        |message| (*message).to_owned(),
    )
}

/// The worker loop: drain, fire, sleep to the horizon, repeat.
pub(crate) fn run<C: TimeSource>(shared: &Shared<C>) {
    tracing::debug!("timer driver running");
    let mut core = DriverCore::new();

    loop {
        core.drain(shared);
        let fired = core.fire(shared);
        if fired > 0 {
            tracing::trace!(fired, pending = core.live(), "dispatched expired entries");
        }

        let outcome = match core.next_wake(shared) {
            None => {
                shared.sleep_until.store(0, Ordering::Release);
                shared.signal.wait(None)
            }
            Some(wake_ms) => {
                // 0 is reserved for "not sleeping"; a horizon in the
                // epoch's first millisecond is published as 1.
                shared.sleep_until.store(wake_ms.max(1), Ordering::Release);
                let now_ms = shared.clock.now().as_millis();
                if wake_ms <= now_ms {
                    shared.sleep_until.store(0, Ordering::Release);
                    continue;
                }
                shared
                    .signal
                    .wait(Some(Duration::from_millis(wake_ms - now_ms)))
            }
        };
        shared.sleep_until.store(0, Ordering::Release);

        if outcome == WaitOutcome::Stopped {
            break;
        }
    }
    tracing::debug!(pending = core.live(), "timer driver stopped");
}

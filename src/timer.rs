//! The public timer: lifecycle, scheduling operations, and the state
//! shared between producers and the driver thread.
//!
//! A [`Timer`] owns one driver worker. Producers on any thread call
//! [`schedule`](Timer::schedule) / [`schedule_at`](Timer::schedule_at);
//! each call allocates a pooled entry, publishes it on the intake queue
//! and, when the push transitioned the queue from empty or the new
//! deadline undercuts the driver's sleep horizon, rings the wake signal.
//! Nothing on that path blocks on the driver.

use crate::clock::{TimeSource, WallClock};
use crate::driver::{self, Signal};
use crate::entry::{Callback, EntryId, EntryPool, ExpiredEntry, TimerHandle};
use crate::error::ScheduleError;
use crate::queue::IntakeQueue;
use crate::types::Time;
use crate::wheel::MAX_SCHEDULE_MS;
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

const STATE_CREATED: u8 = 0;
const STATE_RUNNING: u8 = 1;
const STATE_STOPPED: u8 = 2;

/// The handler invoked on the driver thread for every expired entry.
pub(crate) type Handler = Box<dyn Fn(ExpiredEntry<'_>) + Send + Sync>;

/// Optional observer for isolated callback panics.
pub(crate) type PanicHook = Box<dyn Fn(&str) + Send + Sync>;

/// State shared between the public handle, producers, and the driver.
pub(crate) struct Shared<C> {
    pub(crate) clock: C,
    pub(crate) pool: Arc<EntryPool>,
    pub(crate) intake: IntakeQueue,
    pub(crate) signal: Signal,
    /// Millisecond instant the driver sleeps to; 0 when not sleeping.
    pub(crate) sleep_until: AtomicU64,
    /// Driver-published count of entries resident in the wheel.
    pub(crate) pending: AtomicU64,
    state: AtomicU8,
    pub(crate) handler: Handler,
    pub(crate) panic_hook: Option<PanicHook>,
}

impl<C: TimeSource> Shared<C> {
    fn new(clock: C, handler: Handler, panic_hook: Option<PanicHook>) -> Arc<Self> {
        Arc::new(Self {
            clock,
            pool: Arc::new(EntryPool::new()),
            intake: IntakeQueue::new(),
            signal: Signal::new(),
            sleep_until: AtomicU64::new(0),
            pending: AtomicU64::new(0),
            state: AtomicU8::new(STATE_CREATED),
            handler,
            panic_hook,
        })
    }

    /// Allocates, enqueues, and wakes the driver when needed.
    pub(crate) fn submit_at(
        &self,
        deadline: Time,
        callback: Callback,
    ) -> Result<EntryId, ScheduleError> {
        if self.state.load(Ordering::Acquire) == STATE_STOPPED {
            return Err(ScheduleError::Stopped);
        }

        let now = self.clock.now();
        let delta_ms = deadline.duration_since(now);
        if delta_ms >= MAX_SCHEDULE_MS {
            return Err(ScheduleError::OutOfRange {
                requested: Duration::from_millis(delta_ms),
                max: Duration::from_millis(MAX_SCHEDULE_MS - 1),
            });
        }

        let id = self.pool.insert(deadline, callback);
        let was_empty = self.intake.push(&self.pool, id.index());

        let sleep_until = self.sleep_until.load(Ordering::Acquire);
        if was_empty || (sleep_until > 0 && deadline.as_millis() < sleep_until) {
            self.signal.ring_wake();
        }
        Ok(id)
    }

    pub(crate) fn submit_after(
        &self,
        delay: Duration,
        callback: Callback,
    ) -> Result<EntryId, ScheduleError> {
        self.submit_at(self.clock.now() + delay, callback)
    }

    pub(crate) fn publish_pending(&self, live: u64) {
        self.pending.store(live, Ordering::Relaxed);
    }

    #[cfg(test)]
    pub(crate) fn for_tests(clock: C, handler: Handler) -> Arc<Self> {
        Self::new(clock, handler, None)
    }

    #[cfg(test)]
    pub(crate) fn for_tests_with_hook(clock: C, handler: Handler, hook: PanicHook) -> Arc<Self> {
        Self::new(clock, handler, Some(hook))
    }
}

/// Configuration for a [`Timer`].
///
/// ```
/// use spindle::Timer;
///
/// let timer = Timer::builder()
///     .thread_name("billing-timer")
///     .build(|entry| entry.execute());
/// timer.start();
/// ```
pub struct TimerBuilder {
    thread_name: String,
    panic_hook: Option<PanicHook>,
}

impl TimerBuilder {
    /// Creates a builder with default settings.
    #[must_use]
    pub fn new() -> Self {
        Self {
            thread_name: "spindle-driver".to_owned(),
            panic_hook: None,
        }
    }

    /// Sets the driver thread's name.
    #[must_use]
    pub fn thread_name(mut self, name: impl Into<String>) -> Self {
        self.thread_name = name.into();
        self
    }

    /// Registers a hook invoked with the panic message whenever a user
    /// callback faults. The fault is always logged; the hook is extra.
    #[must_use]
    pub fn on_callback_panic(mut self, hook: impl Fn(&str) + Send + Sync + 'static) -> Self {
        self.panic_hook = Some(Box::new(hook));
        self
    }

    /// Builds a wall-clock timer with the given expiry handler.
    #[must_use]
    pub fn build<F>(self, handler: F) -> Timer<WallClock>
    where
        F: Fn(ExpiredEntry<'_>) + Send + Sync + 'static,
    {
        self.build_with_clock(WallClock::new(), handler)
    }

    /// Builds a timer over a custom time source.
    #[must_use]
    pub fn build_with_clock<C, F>(self, clock: C, handler: F) -> Timer<C>
    where
        C: TimeSource,
        F: Fn(ExpiredEntry<'_>) + Send + Sync + 'static,
    {
        Timer {
            shared: Shared::new(clock, Box::new(handler), self.panic_hook),
            worker: Mutex::new(None),
            thread_name: self.thread_name,
        }
    }
}

impl Default for TimerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for TimerBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimerBuilder")
            .field("thread_name", &self.thread_name)
            .field("panic_hook", &self.panic_hook.is_some())
            .finish()
    }
}

/// A hierarchical timing-wheel delay scheduler.
///
/// One dedicated worker drives the wheel; any number of producer threads
/// schedule and cancel entries without blocking. Resolution is one
/// millisecond; the horizon is `64^7 - 1` ms (about 139 years).
///
/// The expiry `handler` runs on the driver thread for every expired
/// entry; it is expected to call [`ExpiredEntry::execute`], which honors
/// cancellation. Long-running callbacks block the driver and should be
/// offloaded by the caller.
pub struct Timer<C: TimeSource = WallClock> {
    shared: Arc<Shared<C>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    thread_name: String,
}

impl Timer<WallClock> {
    /// Creates a wall-clock timer with the given expiry handler.
    #[must_use]
    pub fn new<F>(handler: F) -> Self
    where
        F: Fn(ExpiredEntry<'_>) + Send + Sync + 'static,
    {
        TimerBuilder::new().build(handler)
    }

    /// Returns a builder for configuring the timer.
    #[must_use]
    pub fn builder() -> TimerBuilder {
        TimerBuilder::new()
    }
}

impl<C: TimeSource> Timer<C> {
    /// Creates a timer over a custom time source.
    #[must_use]
    pub fn with_clock<F>(clock: C, handler: F) -> Self
    where
        F: Fn(ExpiredEntry<'_>) + Send + Sync + 'static,
    {
        TimerBuilder::new().build_with_clock(clock, handler)
    }

    /// The current reading of the timer's clock.
    #[must_use]
    pub fn now(&self) -> Time {
        self.shared.clock.now()
    }

    /// Number of entries resident in the wheel, as last published by the
    /// driver. May lag under load.
    #[must_use]
    pub fn pending(&self) -> u64 {
        self.shared.pending.load(Ordering::Relaxed)
    }

    /// True while the driver worker is running.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.shared.state.load(Ordering::Acquire) == STATE_RUNNING
    }

    /// Schedules `callback` to run after `delay`.
    ///
    /// Sub-millisecond delays are rounded up, so the callback never runs
    /// before the requested delay has elapsed.
    pub fn schedule<F>(&self, delay: Duration, callback: F) -> Result<TimerHandle, ScheduleError>
    where
        F: FnOnce() + Send + 'static,
    {
        self.schedule_at(self.shared.clock.now() + delay, callback)
    }

    /// Schedules `callback` to run at the absolute instant `deadline`.
    ///
    /// A deadline at or before now fires on the driver's next pass.
    pub fn schedule_at<F>(&self, deadline: Time, callback: F) -> Result<TimerHandle, ScheduleError>
    where
        F: FnOnce() + Send + 'static,
    {
        let id = self.shared.submit_at(deadline, Box::new(callback))?;
        Ok(TimerHandle::new(Arc::clone(&self.shared.pool), id))
    }

    /// Stops the driver and joins it. Idempotent.
    ///
    /// Must not be called from inside a timer callback: the driver cannot
    /// join itself. Entries still queued or resident when the driver
    /// exits are dropped without firing.
    pub fn stop(&self) {
        let previous = self.shared.state.swap(STATE_STOPPED, Ordering::AcqRel);
        if previous != STATE_RUNNING {
            return;
        }
        self.shared.signal.ring_stop();
        let worker = match self.worker.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(worker) = worker {
            if worker.join().is_err() {
                tracing::error!("timer driver thread terminated abnormally");
            }
        }
        tracing::debug!("timer stopped");
    }

    pub(crate) fn shared(&self) -> &Arc<Shared<C>> {
        &self.shared
    }
}

impl<C: TimeSource + 'static> Timer<C> {
    /// Starts the driver worker. Idempotent; a stopped timer stays
    /// stopped.
    ///
    /// If the OS refuses a new thread, the failure is logged and the
    /// timer returns to the created state, so a later `start` can retry.
    pub fn start(&self) {
        if self
            .shared
            .state
            .compare_exchange(
                STATE_CREATED,
                STATE_RUNNING,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            return;
        }

        let shared = Arc::clone(&self.shared);
        let spawned = std::thread::Builder::new()
            .name(self.thread_name.clone())
            .spawn(move || driver::run(&shared));

        match spawned {
            Ok(worker) => {
                match self.worker.lock() {
                    Ok(mut guard) => *guard = Some(worker),
                    Err(poisoned) => *poisoned.into_inner() = Some(worker),
                }
                tracing::debug!(thread = %self.thread_name, "timer started");
            }
            Err(error) => {
                // Roll back unless a concurrent stop already latched.
                let _ = self.shared.state.compare_exchange(
                    STATE_RUNNING,
                    STATE_CREATED,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                );
                tracing::error!(%error, "failed to spawn timer driver thread; timer not started");
            }
        }
    }
}

impl<C: TimeSource> Drop for Timer<C> {
    fn drop(&mut self) {
        self.stop();
    }
}

impl<C: TimeSource + fmt::Debug> fmt::Debug for Timer<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Timer")
            .field("clock", &self.shared.clock)
            .field("pending", &self.pending())
            .field("running", &self.is_running())
            .finish()
    }
}

//! Self-rescheduling periodic tasks.
//!
//! [`Timer::interval`] arms a one-shot entry whose callback runs the task
//! and then re-arms itself, so a periodic task is just a chain of
//! ordinary entries. Cancellation sets a flag checked inside the
//! callback and cancels whichever entry is currently armed; the cell
//! holds the entry's plain id, never an owning handle, so the chain
//! cannot keep the timer alive through the pool.

use crate::clock::TimeSource;
use crate::entry::{EntryId, EntryPool};
use crate::error::ScheduleError;
use crate::timer::{Shared, Timer};
use crate::types::Time;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

struct PeriodicInner {
    stopped: AtomicBool,
    current: Mutex<Option<EntryId>>,
}

impl PeriodicInner {
    fn current(&self) -> MutexGuard<'_, Option<EntryId>> {
        match self.current.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// Handle for a periodic or fixed-instant task.
///
/// Dropping the handle does **not** cancel the task; call
/// [`cancel`](Self::cancel).
pub struct PeriodicTask {
    pool: Arc<EntryPool>,
    inner: Arc<PeriodicInner>,
}

impl PeriodicTask {
    /// Stops the cycle: no further runs begin after this call returns.
    ///
    /// A run already dispatched by the driver may still complete
    /// concurrently. Idempotent.
    pub fn cancel(&self) {
        self.inner.stopped.store(true, Ordering::Release);
        if let Some(id) = self.inner.current().take() {
            self.pool.cancel(id);
        }
    }

    /// Returns true once the task has been canceled.
    #[must_use]
    pub fn is_canceled(&self) -> bool {
        self.inner.stopped.load(Ordering::Acquire)
    }
}

impl fmt::Debug for PeriodicTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeriodicTask")
            .field("canceled", &self.is_canceled())
            .finish()
    }
}

impl<C: TimeSource + 'static> Timer<C> {
    /// Runs `task` every `every`, starting one interval from now, until
    /// the returned handle is canceled.
    ///
    /// The task runs on the driver thread; the next interval is measured
    /// from the previous fire, so long tasks stretch the period.
    pub fn interval<F>(&self, every: Duration, task: F) -> Result<PeriodicTask, ScheduleError>
    where
        F: Fn() + Send + Sync + 'static,
    {
        let inner = Arc::new(PeriodicInner {
            stopped: AtomicBool::new(false),
            current: Mutex::new(None),
        });
        let task: Arc<dyn Fn() + Send + Sync> = Arc::new(task);
        arm(self.shared(), &inner, &task, every)?;
        Ok(PeriodicTask {
            pool: Arc::clone(&self.shared().pool),
            inner,
        })
    }

    /// Runs `task` once at the absolute instant `deadline`, cancelable
    /// through the returned handle.
    pub fn at<F>(&self, deadline: Time, task: F) -> Result<PeriodicTask, ScheduleError>
    where
        F: FnOnce() + Send + 'static,
    {
        let inner = Arc::new(PeriodicInner {
            stopped: AtomicBool::new(false),
            current: Mutex::new(None),
        });
        let guard = Arc::clone(&inner);
        let id = self.shared().submit_at(
            deadline,
            Box::new(move || {
                if !guard.stopped.load(Ordering::Acquire) {
                    task();
                }
            }),
        )?;
        *inner.current() = Some(id);
        Ok(PeriodicTask {
            pool: Arc::clone(&self.shared().pool),
            inner,
        })
    }
}

/// Schedules the next link of the chain and records its id.
fn arm<C: TimeSource + 'static>(
    shared: &Arc<Shared<C>>,
    inner: &Arc<PeriodicInner>,
    task: &Arc<dyn Fn() + Send + Sync>,
    every: Duration,
) -> Result<(), ScheduleError> {
    if inner.stopped.load(Ordering::Acquire) {
        return Ok(());
    }

    let weak: Weak<Shared<C>> = Arc::downgrade(shared);
    let chained_inner = Arc::clone(inner);
    let chained_task = Arc::clone(task);
    let id = shared.submit_after(
        every,
        Box::new(move || {
            if chained_inner.stopped.load(Ordering::Acquire) {
                return;
            }
            chained_task();
            if let Some(shared) = weak.upgrade() {
                // A stop racing the fire ends the chain quietly.
                let _ = arm(&shared, &chained_inner, &chained_task, every);
            }
        }),
    )?;
    *inner.current() = Some(id);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::init_test_logging;
    use std::sync::atomic::AtomicU64;
    use std::time::Instant;

    fn wait_until(deadline: Duration, mut condition: impl FnMut() -> bool) -> bool {
        let end = Instant::now() + deadline;
        while Instant::now() < end {
            if condition() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
        condition()
    }

    #[test]
    fn interval_reschedules_until_canceled() {
        init_test_logging();
        let timer = Timer::new(|entry| entry.execute());
        timer.start();

        let count = Arc::new(AtomicU64::new(0));
        let counted = count.clone();
        let task = timer
            .interval(Duration::from_millis(5), move || {
                counted.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();

        assert!(wait_until(Duration::from_secs(2), || {
            count.load(Ordering::SeqCst) >= 3
        }));

        task.cancel();
        assert!(task.is_canceled());

        // Let any in-flight run settle, then confirm the chain is dead.
        std::thread::sleep(Duration::from_millis(30));
        let settled = count.load(Ordering::SeqCst);
        std::thread::sleep(Duration::from_millis(60));
        assert_eq!(count.load(Ordering::SeqCst), settled);

        timer.stop();
    }

    #[test]
    fn at_fires_once_at_the_deadline() {
        init_test_logging();
        let timer = Timer::new(|entry| entry.execute());
        timer.start();

        let count = Arc::new(AtomicU64::new(0));
        let counted = count.clone();
        timer
            .at(timer.now() + Duration::from_millis(10), move || {
                counted.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();

        assert!(wait_until(Duration::from_secs(2), || {
            count.load(Ordering::SeqCst) == 1
        }));
        std::thread::sleep(Duration::from_millis(30));
        assert_eq!(count.load(Ordering::SeqCst), 1);

        timer.stop();
    }

    #[test]
    fn at_cancel_prevents_the_run() {
        init_test_logging();
        let timer = Timer::new(|entry| entry.execute());
        timer.start();

        let count = Arc::new(AtomicU64::new(0));
        let counted = count.clone();
        let task = timer
            .at(timer.now() + Duration::from_millis(40), move || {
                counted.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        task.cancel();

        std::thread::sleep(Duration::from_millis(80));
        assert_eq!(count.load(Ordering::SeqCst), 0);

        timer.stop();
    }
}

//! Pooled task entries and their cancellation handles.
//!
//! Entries live in a shared, append-only slot pool and are addressed by
//! `u32` indices instead of pointers; the intrusive `next` link is an
//! index too, with two reserved values (`NIL` and `PENDING`). Each
//! slot carries a generation counter that is bumped when the slot is
//! released, so a stale handle can never cancel the slot's next occupant.
//!
//! The pool is shared by all producers and the driver:
//! - allocation pops a lock-free free list (tagged head, so index reuse
//!   cannot confuse a racing pop) and falls back to reserving a fresh slot
//!   in an append-only segment table — one allocation per new segment,
//!   O(1) everything else;
//! - release is driver-only and happens exactly once per entry, after the
//!   handler ran or the cancellation was observed.

use crate::types::Time;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, OnceLock};

/// Reserved link value: no successor.
pub(crate) const NIL: u32 = u32::MAX;

/// Reserved link value: a producer has swapped the queue head to this
/// entry but has not yet written its successor.
pub(crate) const PENDING: u32 = u32::MAX - 1;

/// Highest addressable slot index.
const MAX_INDEX: u32 = u32::MAX - 2;

/// Slots in segment 0; segment `s` holds `SEGMENT_BASE << s` slots.
const SEGMENT_BASE: u32 = 64;

/// Enough doubling segments to cover the whole `u32` index space.
const SEGMENT_COUNT: usize = 26;

/// The scheduled action. Invoked at most once, on the driver thread.
pub(crate) type Callback = Box<dyn FnOnce() + Send + 'static>;

/// Lock with poisoned-lock recovery; a panicking callback must not wedge
/// the slot it ran from.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Identifier of a pool slot plus the generation it was handed out under.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct EntryId {
    index: u32,
    generation: u32,
}

impl EntryId {
    pub(crate) const fn index(self) -> u32 {
        self.index
    }
}

impl fmt::Debug for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EntryId({}:{})", self.index, self.generation)
    }
}

/// One pooled entry slot.
///
/// `next` is meaningful in exactly one container at a time: the intake
/// queue (release/acquire), a level-0 wheel bucket (relaxed, driver-only)
/// or the pool free list.
pub(crate) struct EntrySlot {
    pub(crate) next: AtomicU32,
    deadline: AtomicU64,
    generation: AtomicU32,
    canceled: AtomicBool,
    callback: Mutex<Option<Callback>>,
}

impl EntrySlot {
    fn new() -> Self {
        Self {
            next: AtomicU32::new(NIL),
            deadline: AtomicU64::new(0),
            generation: AtomicU32::new(0),
            canceled: AtomicBool::new(false),
            callback: Mutex::new(None),
        }
    }

    pub(crate) fn deadline(&self) -> Time {
        Time::from_millis(self.deadline.load(Ordering::Relaxed))
    }

    pub(crate) fn is_canceled(&self) -> bool {
        self.canceled.load(Ordering::Acquire)
    }
}

/// Maps a slot index to its segment and offset within the segment.
const fn locate(index: u32) -> (usize, usize) {
    let n = index / SEGMENT_BASE + 1;
    let segment = (u32::BITS - 1 - n.leading_zeros()) as usize;
    let start = SEGMENT_BASE * ((1u32 << segment) - 1);
    (segment, (index - start) as usize)
}

const fn segment_len(segment: usize) -> usize {
    (SEGMENT_BASE as usize) << segment
}

/// Packed free-list head: generation tag in the high word, index in the
/// low word. The tag changes on every successful pop and push, which
/// defeats the classic free-list ABA interleaving.
const fn pack(tag: u32, index: u32) -> u64 {
    ((tag as u64) << 32) | index as u64
}

const fn head_index(packed: u64) -> u32 {
    packed as u32
}

const fn head_tag(packed: u64) -> u32 {
    (packed >> 32) as u32
}

/// Shared, thread-safe entry pool.
pub(crate) struct EntryPool {
    segments: [OnceLock<Box<[EntrySlot]>>; SEGMENT_COUNT],
    free: AtomicU64,
    next_fresh: AtomicU32,
}

impl EntryPool {
    pub(crate) fn new() -> Self {
        Self {
            segments: std::array::from_fn(|_| OnceLock::new()),
            free: AtomicU64::new(pack(0, NIL)),
            next_fresh: AtomicU32::new(0),
        }
    }

    /// Returns the slot for an index previously handed out by this pool.
    pub(crate) fn slot(&self, index: u32) -> &EntrySlot {
        let (segment, offset) = locate(index);
        let slots = self.segments[segment]
            .get()
            .expect("slot index from an unallocated segment");
        &slots[offset]
    }

    /// Allocates a slot and installs the entry's payload.
    ///
    /// The returned entry has `next == PENDING`, ready for the intake
    /// queue's two-step publish. O(1) plus one segment allocation on pool
    /// miss.
    pub(crate) fn insert(&self, deadline: Time, callback: Callback) -> EntryId {
        let index = self.pop_free().unwrap_or_else(|| self.alloc_fresh());
        let slot = self.slot(index);
        let generation = slot.generation.load(Ordering::Acquire);
        slot.canceled.store(false, Ordering::Relaxed);
        slot.deadline.store(deadline.as_millis(), Ordering::Relaxed);
        *lock(&slot.callback) = Some(callback);
        slot.next.store(PENDING, Ordering::Relaxed);
        EntryId { index, generation }
    }

    /// Marks the entry canceled. Returns false if the slot has already
    /// been released (and possibly reused) since the id was handed out.
    pub(crate) fn cancel(&self, id: EntryId) -> bool {
        let slot = self.slot(id.index);
        if slot.generation.load(Ordering::Acquire) != id.generation {
            return false;
        }
        slot.canceled.store(true, Ordering::Release);
        true
    }

    /// Reads the cancel flag, generation-checked like [`cancel`](Self::cancel).
    pub(crate) fn is_canceled(&self, id: EntryId) -> bool {
        let slot = self.slot(id.index);
        slot.generation.load(Ordering::Acquire) == id.generation && slot.is_canceled()
    }

    /// Returns the slot to the free list. Driver-only; exactly once per
    /// handed-out entry.
    pub(crate) fn release(&self, index: u32) {
        let slot = self.slot(index);
        slot.generation.fetch_add(1, Ordering::Release);
        drop(lock(&slot.callback).take());
        self.push_free(index);
    }

    fn pop_free(&self) -> Option<u32> {
        let mut head = self.free.load(Ordering::Acquire);
        loop {
            let index = head_index(head);
            if index == NIL {
                return None;
            }
            let next = self.slot(index).next.load(Ordering::Relaxed);
            let replacement = pack(head_tag(head).wrapping_add(1), next);
            match self.free.compare_exchange_weak(
                head,
                replacement,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Some(index),
                Err(observed) => head = observed,
            }
        }
    }

    fn push_free(&self, index: u32) {
        let slot = self.slot(index);
        let mut head = self.free.load(Ordering::Acquire);
        loop {
            slot.next.store(head_index(head), Ordering::Relaxed);
            let replacement = pack(head_tag(head).wrapping_add(1), index);
            match self.free.compare_exchange_weak(
                head,
                replacement,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return,
                Err(observed) => head = observed,
            }
        }
    }

    fn alloc_fresh(&self) -> u32 {
        let index = self.next_fresh.fetch_add(1, Ordering::Relaxed);
        assert!(index <= MAX_INDEX, "entry pool exhausted");
        let (segment, _) = locate(index);
        self.segments[segment].get_or_init(|| {
            (0..segment_len(segment))
                .map(|_| EntrySlot::new())
                .collect::<Vec<_>>()
                .into_boxed_slice()
        });
        index
    }
}

impl fmt::Debug for EntryPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EntryPool")
            .field("slots", &self.next_fresh.load(Ordering::Relaxed))
            .finish()
    }
}

/// Handle for canceling a scheduled task.
///
/// Cancellation is O(1), wait-free and idempotent; no resource is
/// reclaimed at cancel time. A cancel observed before the driver
/// dispatches the entry guarantees the callback will not run.
#[derive(Clone)]
pub struct TimerHandle {
    pool: std::sync::Arc<EntryPool>,
    id: EntryId,
}

impl TimerHandle {
    pub(crate) fn new(pool: std::sync::Arc<EntryPool>, id: EntryId) -> Self {
        Self { pool, id }
    }

    /// Requests that the callback not run.
    ///
    /// A cancel racing the driver's dispatch may lose; the driver checks
    /// the flag immediately before invoking the callback.
    pub fn cancel(&self) {
        self.pool.cancel(self.id);
    }

    /// Returns true if the entry is still live and marked canceled.
    ///
    /// Once the entry has fired (or a cancellation has been reclaimed),
    /// this returns false.
    #[must_use]
    pub fn is_canceled(&self) -> bool {
        self.pool.is_canceled(self.id)
    }
}

impl fmt::Debug for TimerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TimerHandle({:?})", self.id)
    }
}

/// An expired entry, as seen by the timer's handler.
///
/// The handler decides what to do with it — normally just
/// [`execute`](Self::execute). Whatever the handler does, the slot is
/// returned to the pool when this guard drops, including during unwind
/// after a callback panic.
pub struct ExpiredEntry<'a> {
    pool: &'a EntryPool,
    index: u32,
}

impl<'a> ExpiredEntry<'a> {
    pub(crate) fn new(pool: &'a EntryPool, index: u32) -> Self {
        Self { pool, index }
    }

    /// The deadline this entry was scheduled for.
    #[must_use]
    pub fn deadline(&self) -> Time {
        self.pool.slot(self.index).deadline()
    }

    /// Returns true if the entry was canceled.
    #[must_use]
    pub fn is_canceled(&self) -> bool {
        self.pool.slot(self.index).is_canceled()
    }

    /// Runs the callback unless the entry was canceled.
    ///
    /// The cancel flag is re-checked after the callback is taken, so a
    /// cancel that lands before this point always wins.
    pub fn execute(self) {
        let callback = lock(&self.pool.slot(self.index).callback).take();
        if let Some(callback) = callback {
            if !self.is_canceled() {
                callback();
            }
        }
    }
}

impl Drop for ExpiredEntry<'_> {
    fn drop(&mut self) {
        self.pool.release(self.index);
    }
}

impl fmt::Debug for ExpiredEntry<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExpiredEntry")
            .field("index", &self.index)
            .field("deadline", &self.deadline())
            .field("canceled", &self.is_canceled())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    #[test]
    fn locate_maps_segments() {
        assert_eq!(locate(0), (0, 0));
        assert_eq!(locate(63), (0, 63));
        assert_eq!(locate(64), (1, 0));
        assert_eq!(locate(191), (1, 127));
        assert_eq!(locate(192), (2, 0));
    }

    #[test]
    fn insert_release_reuses_slot_with_new_generation() {
        let pool = EntryPool::new();
        let first = pool.insert(Time::from_millis(5), Box::new(|| {}));
        pool.release(first.index());

        let second = pool.insert(Time::from_millis(9), Box::new(|| {}));
        assert_eq!(second.index(), first.index());
        assert_ne!(second, first);

        // The stale id no longer cancels anything.
        assert!(!pool.cancel(first));
        assert!(pool.cancel(second));
        assert!(pool.is_canceled(second));
        assert!(!pool.is_canceled(first));
    }

    #[test]
    fn fresh_allocation_crosses_segments() {
        let pool = EntryPool::new();
        let ids: Vec<_> = (0..130)
            .map(|_| pool.insert(Time::ZERO, Box::new(|| {})))
            .collect();
        for (n, id) in ids.iter().enumerate() {
            assert_eq!(id.index(), n as u32);
            assert_eq!(pool.slot(id.index()).next.load(Ordering::Relaxed), PENDING);
        }
    }

    #[test]
    fn execute_runs_live_callback_once() {
        let pool = EntryPool::new();
        let count = Arc::new(AtomicUsize::new(0));
        let counted = count.clone();
        let id = pool.insert(Time::ZERO, Box::new(move || {
            counted.fetch_add(1, Ordering::SeqCst);
        }));

        ExpiredEntry::new(&pool, id.index()).execute();
        assert_eq!(count.load(Ordering::SeqCst), 1);

        // The slot went back to the free list; a second expiry of the same
        // index belongs to a new entry.
        let reused = pool.insert(Time::ZERO, Box::new(|| {}));
        assert_eq!(reused.index(), id.index());
    }

    #[test]
    fn execute_skips_canceled_callback() {
        let pool = EntryPool::new();
        let count = Arc::new(AtomicUsize::new(0));
        let counted = count.clone();
        let id = pool.insert(Time::ZERO, Box::new(move || {
            counted.fetch_add(1, Ordering::SeqCst);
        }));

        assert!(pool.cancel(id));
        ExpiredEntry::new(&pool, id.index()).execute();
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn dropping_expired_entry_releases_without_running() {
        let pool = EntryPool::new();
        let count = Arc::new(AtomicUsize::new(0));
        let counted = count.clone();
        let id = pool.insert(Time::ZERO, Box::new(move || {
            counted.fetch_add(1, Ordering::SeqCst);
        }));

        drop(ExpiredEntry::new(&pool, id.index()));
        assert_eq!(count.load(Ordering::SeqCst), 0);
        // Slot is reusable again.
        let reused = pool.insert(Time::ZERO, Box::new(|| {}));
        assert_eq!(reused.index(), id.index());
    }

    #[test]
    fn concurrent_inserts_hand_out_distinct_slots() {
        let pool = Arc::new(EntryPool::new());
        let mut workers = Vec::new();
        for _ in 0..4 {
            let pool = pool.clone();
            workers.push(std::thread::spawn(move || {
                (0..500)
                    .map(|_| pool.insert(Time::ZERO, Box::new(|| {})).index())
                    .collect::<Vec<_>>()
            }));
        }
        let mut seen = std::collections::HashSet::new();
        for worker in workers {
            for index in worker.join().unwrap() {
                assert!(seen.insert(index), "index {index} handed out twice");
            }
        }
        assert_eq!(seen.len(), 2_000);
    }
}

//! Wait-free MPSC intake queue.
//!
//! Producers publish entries with exactly two atomic operations: swap the
//! queue head to the new entry, then store the previous head into the
//! entry's `next` link. Between the two stores the link holds the
//! [`PENDING`] sentinel, so the draining consumer can tell "mid-push" from
//! "end of chain" and spin only on that one entry until its producer
//! finishes — a window of a single store.
//!
//! The chain is LIFO while queued; the drain reverses it in place so the
//! consumer observes entries in push order.

use crate::entry::{EntryPool, NIL, PENDING};
use std::sync::atomic::{AtomicU32, Ordering};

/// The intake side of the scheduler: one atomic head, links intrusive.
pub(crate) struct IntakeQueue {
    head: AtomicU32,
}

impl IntakeQueue {
    pub(crate) fn new() -> Self {
        Self {
            head: AtomicU32::new(NIL),
        }
    }

    /// Pushes an entry. Wait-free.
    ///
    /// The entry's `next` must hold [`PENDING`] (the pool leaves freshly
    /// inserted entries in that state). Returns true iff the queue was
    /// empty, i.e. this push is the one that should ring the wake signal.
    pub(crate) fn push(&self, pool: &EntryPool, index: u32) -> bool {
        debug_assert_eq!(
            pool.slot(index).next.load(Ordering::Relaxed),
            PENDING,
            "pushed entry must carry the mid-push sentinel"
        );
        let previous = self.head.swap(index, Ordering::AcqRel);
        pool.slot(index).next.store(previous, Ordering::Release);
        previous == NIL
    }

    /// Takes the whole chain and reverses it, returning the index of the
    /// oldest entry (or [`NIL`]). Single consumer only.
    fn pop_all(&self, pool: &EntryPool) -> u32 {
        let mut current = self.head.swap(NIL, Ordering::Acquire);
        let mut previous = NIL;

        while current != NIL {
            let slot = pool.slot(current);
            let next = loop {
                let next = slot.next.load(Ordering::Acquire);
                if next != PENDING {
                    break next;
                }
                // The producer that swapped this entry in has not stored
                // its successor yet; it is one instruction away.
                std::hint::spin_loop();
            };
            slot.next.store(previous, Ordering::Relaxed);
            previous = current;
            current = next;
        }

        previous
    }

    /// Drains every queued entry into `sink`, oldest first.
    ///
    /// `sink` may relink the entry (the wheel reuses `next` for its bucket
    /// lists), so the successor is read before each call. Returns the
    /// number of entries drained.
    pub(crate) fn drain(&self, pool: &EntryPool, mut sink: impl FnMut(u32)) -> usize {
        let mut current = self.pop_all(pool);
        let mut drained = 0;
        while current != NIL {
            let next = pool.slot(current).next.load(Ordering::Relaxed);
            sink(current);
            current = next;
            drained += 1;
        }
        drained
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Time;
    use std::sync::Arc;

    fn pool_with(n: u32) -> (EntryPool, Vec<u32>) {
        let pool = EntryPool::new();
        let ids = (0..n)
            .map(|_| pool.insert(Time::ZERO, Box::new(|| {})).index())
            .collect();
        (pool, ids)
    }

    #[test]
    fn push_reports_transition_from_empty() {
        let (pool, ids) = pool_with(3);
        let queue = IntakeQueue::new();

        assert!(queue.push(&pool, ids[0]));
        assert!(!queue.push(&pool, ids[1]));
        assert!(!queue.push(&pool, ids[2]));

        let mut order = Vec::new();
        queue.drain(&pool, |index| order.push(index));
        assert_eq!(order, ids);

        // Empty again: the next push transitions again.
        let fresh = pool.insert(Time::ZERO, Box::new(|| {})).index();
        assert!(queue.push(&pool, fresh));
    }

    #[test]
    fn drain_observes_fifo_push_order() {
        let (pool, ids) = pool_with(64);
        let queue = IntakeQueue::new();
        for &index in &ids {
            queue.push(&pool, index);
        }

        let mut order = Vec::new();
        let drained = queue.drain(&pool, |index| order.push(index));
        assert_eq!(drained, 64);
        assert_eq!(order, ids);
        assert_eq!(queue.drain(&pool, |_| {}), 0);
    }

    #[test]
    fn drain_empty_queue_is_a_noop() {
        let pool = EntryPool::new();
        let queue = IntakeQueue::new();
        assert_eq!(queue.drain(&pool, |_| unreachable!("nothing queued")), 0);
    }

    #[test]
    fn concurrent_producers_keep_per_producer_order() {
        const PRODUCERS: u32 = 8;
        const PER_PRODUCER: u64 = 1_000;

        let pool = Arc::new(EntryPool::new());
        let queue = Arc::new(IntakeQueue::new());

        let mut producers = Vec::new();
        for producer in 0..PRODUCERS {
            let pool = pool.clone();
            let queue = queue.clone();
            producers.push(std::thread::spawn(move || {
                for sequence in 0..PER_PRODUCER {
                    // Deadline doubles as a (producer, sequence) tag.
                    let tag = u64::from(producer) * PER_PRODUCER + sequence;
                    let id = pool.insert(Time::from_millis(tag), Box::new(|| {}));
                    queue.push(&pool, id.index());
                }
            }));
        }
        for producer in producers {
            producer.join().unwrap();
        }

        let mut last_seen = vec![None::<u64>; PRODUCERS as usize];
        let mut total = 0;
        queue.drain(&pool, |index| {
            let tag = pool.slot(index).deadline().as_millis();
            let producer = (tag / PER_PRODUCER) as usize;
            let sequence = tag % PER_PRODUCER;
            if let Some(previous) = last_seen[producer] {
                assert!(
                    sequence > previous,
                    "producer {producer} reordered: {sequence} after {previous}"
                );
            }
            last_seen[producer] = Some(sequence);
            total += 1;
        });
        assert_eq!(total, PRODUCERS as usize * PER_PRODUCER as usize);
    }
}

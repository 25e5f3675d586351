//! Hierarchical timing wheel.
//!
//! Every wheel has 64 slots. At level 0 a slot covers one millisecond and
//! holds an intrusive list of entries; at level ℓ a slot covers `64^ℓ` ms
//! and holds a child wheel of level ℓ-1, created on demand and dropped
//! when it empties. A 64-bit occupancy bitmap mirrors the slots exactly,
//! so the expiry scan walks set bits with `trailing_zeros` instead of
//! probing arrays.
//!
//! Indexing re-uses the entry's full interval at every level, masking the
//! six bits that belong to that level. Because a child masks its own bits
//! of the same interval, entries land in the correct leaf slot without any
//! re-bucketing when the root rotates.
//!
//! The wheel is single-owner: only the driver touches it, so entry links
//! are manipulated with relaxed loads and stores.

use crate::entry::{EntryPool, NIL};
use std::sync::atomic::Ordering;

/// Bits of the interval consumed per level.
pub(crate) const SLOT_BITS: u32 = 6;

/// Slots per wheel.
pub(crate) const SLOTS: usize = 1 << SLOT_BITS;

const SLOT_MASK: u64 = SLOTS as u64 - 1;

/// Highest wheel level; level 6 spans roughly 139 years.
pub(crate) const MAX_LEVEL: usize = 6;

/// Milliseconds covered by one slot at each level (`64^level`).
pub(crate) const MS_PER_SLOT: [u64; MAX_LEVEL + 1] = [
    1,
    64,
    4_096,
    262_144,
    16_777_216,
    1_073_741_824,
    68_719_476_736,
];

/// Milliseconds covered by a whole wheel at each level (`64^(level+1)`).
pub(crate) const MAX_MS: [u64; MAX_LEVEL + 1] = [
    64,
    4_096,
    262_144,
    16_777_216,
    1_073_741_824,
    68_719_476_736,
    4_398_046_511_104,
];

/// Largest schedulable interval, exclusive.
pub(crate) const MAX_SCHEDULE_MS: u64 = MAX_MS[MAX_LEVEL];

fn slot_index(level: usize, interval_ms: u64) -> usize {
    ((interval_ms >> (SLOT_BITS * level as u32)) & SLOT_MASK) as usize
}

enum Slots {
    /// Level 0: head of an intrusive entry list per slot.
    Entries(Box<[u32; SLOTS]>),
    /// Levels above 0: optional child wheel per slot.
    Children(Box<[Option<Box<Wheel>>; SLOTS]>),
}

/// One level of the hierarchy, owning its sub-wheels.
pub(crate) struct Wheel {
    level: usize,
    bitmap: u64,
    slots: Slots,
}

impl Wheel {
    pub(crate) fn new(level: usize) -> Self {
        debug_assert!(level <= MAX_LEVEL);
        let slots = if level == 0 {
            Slots::Entries(Box::new([NIL; SLOTS]))
        } else {
            Slots::Children(Box::new(std::array::from_fn(|_| None)))
        };
        Self {
            level,
            bitmap: 0,
            slots,
        }
    }

    /// Wraps `child` as the sole occupant of slot 0 of a wheel one level
    /// up. The caller checks the [`MAX_LEVEL`] cap.
    pub(crate) fn promote(child: Box<Self>) -> Box<Self> {
        debug_assert!(child.level < MAX_LEVEL);
        let mut parent = Box::new(Self::new(child.level + 1));
        parent.bitmap = 1;
        if let Slots::Children(children) = &mut parent.slots {
            children[0] = Some(child);
        }
        parent
    }

    /// True when only slot 0 is occupied and a finer wheel suffices.
    pub(crate) fn can_level_down(&self) -> bool {
        self.bitmap == 1 && self.level > 0
    }

    /// Replaces the wheel with its slot-0 child. Identity when
    /// [`can_level_down`](Self::can_level_down) does not hold.
    pub(crate) fn level_down(mut self: Box<Self>) -> Box<Self> {
        if !self.can_level_down() {
            return self;
        }
        if let Slots::Children(children) = &mut self.slots {
            if let Some(child) = children[0].take() {
                return child;
            }
        }
        self
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.bitmap == 0
    }

    pub(crate) fn level(&self) -> usize {
        self.level
    }

    pub(crate) fn ms_per_slot(&self) -> u64 {
        MS_PER_SLOT[self.level]
    }

    pub(crate) fn max_ms(&self) -> u64 {
        MAX_MS[self.level]
    }

    /// Inserts an entry at `interval_ms` from the wheel's origin.
    ///
    /// The interval must be below [`max_ms`](Self::max_ms); the driver
    /// levels up first when it is not.
    pub(crate) fn add(&mut self, pool: &EntryPool, entry: u32, interval_ms: u64) {
        debug_assert!(interval_ms < self.max_ms());
        let level = self.level;
        let slot = slot_index(level, interval_ms);
        match &mut self.slots {
            Slots::Entries(heads) => {
                pool.slot(entry).next.store(heads[slot], Ordering::Relaxed);
                heads[slot] = entry;
            }
            Slots::Children(children) => {
                let child = children[slot]
                    .get_or_insert_with(|| Box::new(Self::new(level - 1)));
                child.add(pool, entry, interval_ms);
            }
        }
        self.bitmap |= 1 << slot;
    }

    /// Fires every entry within `remaining_ms` of the wheel's origin,
    /// in bit order, and prunes emptied sub-wheels. Returns the number of
    /// entries handed to `fire`.
    pub(crate) fn expire(
        &mut self,
        pool: &EntryPool,
        fire: &mut dyn FnMut(u32),
        remaining_ms: u64,
    ) -> u64 {
        let level = self.level;
        let mut count = 0;

        while self.bitmap != 0 {
            let slot = self.bitmap.trailing_zeros() as usize;
            match &mut self.slots {
                Slots::Entries(heads) => {
                    if slot as u64 > remaining_ms {
                        break;
                    }
                    while heads[slot] != NIL {
                        let entry = heads[slot];
                        heads[slot] = pool.slot(entry).next.load(Ordering::Relaxed);
                        fire(entry);
                        count += 1;
                    }
                    self.bitmap &= !(1 << slot);
                }
                Slots::Children(children) => {
                    let slot_start = slot as u64 * MS_PER_SLOT[level];
                    if slot_start > remaining_ms {
                        break;
                    }
                    let child = children[slot]
                        .as_mut()
                        .expect("occupied slot without a child");
                    count += child.expire(pool, fire, remaining_ms - slot_start);
                    if child.is_empty() {
                        children[slot] = None;
                        self.bitmap &= !(1 << slot);
                    } else {
                        // Whatever time remains expires inside this slot's
                        // sub-wheel; later slots cannot be due yet.
                        break;
                    }
                }
            }
        }

        count
    }

    /// Milliseconds from the wheel's origin to the earliest entry, or
    /// `u64::MAX` when empty.
    pub(crate) fn next_expiration_ms(&self) -> u64 {
        if self.bitmap == 0 {
            return u64::MAX;
        }
        let slot = self.bitmap.trailing_zeros() as usize;
        match &self.slots {
            Slots::Entries(_) => slot as u64,
            Slots::Children(children) => {
                let child = children[slot]
                    .as_ref()
                    .expect("occupied slot without a child");
                slot as u64 * MS_PER_SLOT[self.level] + child.next_expiration_ms()
            }
        }
    }

    /// Verifies the bitmap is an exact summary of slot occupancy, at
    /// every level. Returns the number of entries resident in the wheel.
    #[cfg(test)]
    pub(crate) fn assert_consistent(&self, pool: &EntryPool) -> u64 {
        let mut total = 0;
        for slot in 0..SLOTS {
            let occupied = self.bitmap & (1 << slot) != 0;
            match &self.slots {
                Slots::Entries(heads) => {
                    let mut len = 0;
                    let mut current = heads[slot];
                    while current != NIL {
                        len += 1;
                        current = pool.slot(current).next.load(Ordering::Relaxed);
                    }
                    assert_eq!(
                        occupied,
                        len > 0,
                        "level 0 slot {slot}: bit {occupied}, {len} entries"
                    );
                    total += len;
                }
                Slots::Children(children) => match &children[slot] {
                    None => assert!(!occupied, "level {} slot {slot}: bit without child", self.level),
                    Some(child) => {
                        assert!(occupied, "level {} slot {slot}: child without bit", self.level);
                        assert!(!child.is_empty(), "empty sub-wheel was not pruned");
                        assert_eq!(child.level, self.level - 1);
                        total += child.assert_consistent(pool);
                    }
                },
            }
        }
        total
    }

    /// Shifts slots down by `n` after the driver advanced the origin by
    /// `n` of this wheel's slot spans. `n` is below [`SLOTS`]: the driver
    /// fires before rotating, and anything a full span old has fired.
    pub(crate) fn rotate(&mut self, n: u64) {
        if n == 0 || n >= SLOTS as u64 {
            debug_assert!(n < SLOTS as u64, "rotation past the wheel span");
            return;
        }
        let n = n as usize;
        match &mut self.slots {
            Slots::Entries(heads) => {
                heads.copy_within(n.., 0);
                heads[SLOTS - n..].fill(NIL);
            }
            Slots::Children(children) => {
                for slot in n..SLOTS {
                    children[slot - n] = children[slot].take();
                }
            }
        }
        self.bitmap >>= n;
    }
}

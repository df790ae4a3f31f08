//! Per-NUMA-node, per-cache bookkeeping.

use core::ptr::NonNull;

use slab_utils::Mutex;

use crate::intrusive_list::IntrusiveList;
use crate::magazine::Magazine;
use crate::slab::Slab;

/// Alien magazines: one per remote node, used to hand freed objects back to
/// their home node without ever holding two node locks at once.
pub const MAX_NODES: usize = 8;

/// Everything protected by a `NodeLists`' single spinlock: one spinlock per
/// node, held while touching that node's three slab lists, counters, or its
/// shared magazine.
pub struct NodeListsInner {
    pub full: IntrusiveList<Slab>,
    pub partial: IntrusiveList<Slab>,
    pub free: IntrusiveList<Slab>,

    /// Sum of `(num - in_use)` over every slab on `partial` and `free`.
    /// Objects sitting in `shared` are *not* counted here — they are
    /// accounted for separately, as free-but-not-yet-returned-to-a-slab.
    pub free_objects: usize,
    /// Above this many free objects, a slab is released to the page source
    /// instead of being kept on `free`.
    pub free_limit: usize,
    /// Next coloring value to assign, as a multiple of `colour_unit`.
    pub colour_next: u32,
    /// Cached from the cache's geometry so this module doesn't need a
    /// back-reference to `Cache` to advance coloring.
    pub colour_count: u32,

    /// Overflow/refill buffer shared by every CPU on this node.
    pub shared: Option<Magazine>,
    /// One magazine per remote node, for objects freed here that belong to
    /// a slab owned by that remote node.
    pub alien: [Option<Magazine>; MAX_NODES],

    /// Reap deadline (in the host's tick units) for this node's shared
    /// magazine / free-list trim.
    pub next_reap: u64,
    /// Cleared by the reaper; set whenever the `free` list gains or the
    /// shared magazine is pulled from. Mirrors `Magazine::touched` but at
    /// node granularity.
    pub free_touched: bool,
}

impl NodeListsInner {
    fn new(colour_count: u32, free_limit: usize) -> Self {
        Self {
            full: IntrusiveList::new(),
            partial: IntrusiveList::new(),
            free: IntrusiveList::new(),
            free_objects: 0,
            free_limit,
            colour_next: 0,
            colour_count: colour_count.max(1),
            shared: None,
            alien: Default::default(),
            next_reap: 0,
            free_touched: false,
        }
    }

    /// Assign the next coloring offset and advance the cursor modulo
    /// `colour_count`.
    pub fn next_coloring_offset(&mut self, colour_unit: u32) -> u32 {
        let offset = self.colour_next * colour_unit;
        self.colour_next = (self.colour_next + 1) % self.colour_count;
        offset
    }

    /// Move `slab` from whichever of the three lists it is currently on to
    /// the list matching its current `in_use` count. No-op if it is
    /// already on the right list. Caller holds this node's lock.
    ///
    /// # Safety
    /// `slab` must currently be linked into exactly one of
    /// `self.full`/`self.partial`/`self.free`, given by `from`.
    pub unsafe fn move_to_current_list(&mut self, slab: NonNull<Slab>, from: SlabList) {
        use crate::slab::SlabState;
        // SAFETY: caller asserts `slab` is linked into the list `from`
        // names; removing it from that list is therefore sound.
        unsafe {
            match from {
                SlabList::Full => self.full.remove(slab),
                SlabList::Partial => self.partial.remove(slab),
                SlabList::Free => self.free.remove(slab),
            }
        }
        let target = match slab.as_ref().state() {
            SlabState::Full => &mut self.full,
            SlabState::Partial => &mut self.partial,
            SlabState::Free => &mut self.free,
        };
        // SAFETY: `slab` was just unlinked above, so it is not a member of
        // any list.
        unsafe { target.push_front(slab) };
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SlabList {
    Full,
    Partial,
    Free,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn coloring_offset_cycles_through_every_slot_then_repeats() {
        // P4: across colour_count + 1 slabs, the observed offsets are
        // {0, colour_unit, ..., (colour_count-1)*colour_unit} and then
        // the sequence repeats from 0.
        let colour_count = 4u32;
        let colour_unit = 64u32;
        let mut inner = NodeListsInner::new(colour_count, 1024);

        let mut seen = alloc::vec::Vec::new();
        for _ in 0..colour_count {
            seen.push(inner.next_coloring_offset(colour_unit));
        }
        let expected: alloc::vec::Vec<u32> = (0..colour_count).map(|i| i * colour_unit).collect();
        assert_eq!(seen, expected);

        // The (colour_count + 1)-th slab wraps back to offset 0.
        assert_eq!(inner.next_coloring_offset(colour_unit), 0);
    }

    #[test]
    fn colour_count_of_one_always_assigns_offset_zero() {
        let mut inner = NodeListsInner::new(1, 64);
        for _ in 0..5 {
            assert_eq!(inner.next_coloring_offset(32), 0);
        }
    }
}

/// Per-node state for one cache: a lock plus the three slab lists, shared
/// magazine, alien magazines, and reap bookkeeping it guards.
pub struct NodeLists {
    inner: Mutex<NodeListsInner>,
}

impl NodeLists {
    pub fn new(colour_count: u32, free_limit: usize) -> Self {
        Self {
            inner: Mutex::new(NodeListsInner::new(colour_count, free_limit)),
        }
    }

    pub fn lock(&self) -> slab_utils::MutexGuard<'_, NodeListsInner> {
        self.inner.lock()
    }
}

//! A single slab: one contiguous run of `2^order` pages carved into `num`
//! equal-size objects, plus its freelist index vector.

use core::ptr::NonNull;

use crate::cache::Cache;
use crate::geometry::Reciprocal;
use crate::intrusive_list::ListNode;
use crate::page_source::NodeId;

/// Index type for the freelist vector. `FREE_INDEX_END` is the sentinel
/// marking "no more free slots"; this caps a single slab at
/// `FREE_INDEX_END - 1` objects.
pub type FreeIndex = u16;
pub const FREE_INDEX_END: FreeIndex = FreeIndex::MAX;

/// Which of a node's three lists a slab currently sits on.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SlabState {
    Free,
    Partial,
    Full,
}

/// One contiguous run of pages, carved into objects of a single cache.
///
/// Lives either at the start of its own pages (on-slab) or in a separate
/// allocation from the cache's backing meta-cache (off-slab); either way
/// the freelist index vector (`num` entries of [`FreeIndex`]) immediately
/// follows this struct in memory, pointed to by `freelist`.
#[repr(C)]
pub struct Slab {
    list_next: Option<NonNull<Slab>>,
    list_prev: Option<NonNull<Slab>>,

    /// The cache this slab belongs to.
    pub cache: NonNull<Cache>,
    /// NUMA node this slab's pages were obtained from.
    pub node: NodeId,
    /// Bytes of padding before the first object.
    pub coloring_offset: u32,
    /// Address of object index 0.
    pub first_object_addr: NonNull<u8>,
    /// Address of the page run backing this slab (what was handed back by
    /// `PageSource::get_pages`), needed to free it later.
    pub page_addr: NonNull<u8>,
    /// Whether `freelist`/this descriptor live off-slab.
    pub off_slab: bool,

    /// Number of objects currently handed out.
    pub in_use: u16,
    /// Total objects this slab holds.
    pub num: u16,
    /// Index of the first free object, or `FREE_INDEX_END` if none.
    pub free_head: FreeIndex,

    /// Pointer to the `num`-entry freelist index vector.
    freelist: NonNull<FreeIndex>,
}

// SAFETY: all access to a `Slab` happens while the owning node's spinlock
// is held, or (for a slab not yet linked into any node list, during
// carve/grow) exclusively by the growing CPU.
unsafe impl Send for Slab {}

impl ListNode for Slab {
    fn next(&self) -> Option<NonNull<Self>> {
        self.list_next
    }
    fn prev(&self) -> Option<NonNull<Self>> {
        self.list_prev
    }
    fn set_next(&mut self, next: Option<NonNull<Self>>) {
        self.list_next = next;
    }
    fn set_prev(&mut self, prev: Option<NonNull<Self>>) {
        self.list_prev = prev;
    }
}

impl Slab {
    pub fn state(&self) -> SlabState {
        if self.in_use == 0 {
            SlabState::Free
        } else if self.in_use == self.num {
            SlabState::Full
        } else {
            SlabState::Partial
        }
    }

    #[inline]
    fn freelist_slice(&self) -> &[FreeIndex] {
        // SAFETY: `freelist` was built to point at exactly `num` entries
        // during `carve`, and outlives the slab (on-slab: same allocation;
        // off-slab: a separate allocation freed only in `Slab` destruction).
        unsafe { core::slice::from_raw_parts(self.freelist.as_ptr(), self.num as usize) }
    }

    #[inline]
    fn freelist_slice_mut(&mut self) -> &mut [FreeIndex] {
        // SAFETY: see `freelist_slice`.
        unsafe { core::slice::from_raw_parts_mut(self.freelist.as_ptr(), self.num as usize) }
    }

    /// Address of object `idx`.
    #[inline]
    pub fn object_at(&self, idx: u16, object_size: u32) -> NonNull<u8> {
        debug_assert!(idx < self.num);
        // SAFETY: stays within this slab's object area, which the caller
        // (cache grow) sized for exactly `num` objects of `object_size`.
        unsafe {
            NonNull::new_unchecked(
                self.first_object_addr.as_ptr().add(idx as usize * object_size as usize),
            )
        }
    }

    /// Take the next free object. Caller must have already checked
    /// `in_use < num`.
    pub fn get_obj(&mut self, object_size: u32) -> NonNull<u8> {
        debug_assert!(self.in_use < self.num, "get_obj on an exhausted slab");
        let idx = self.free_head;
        let obj = self.object_at(idx, object_size);
        self.free_head = self.freelist_slice()[idx as usize];
        self.in_use += 1;
        obj
    }

    /// Return `obj` to this slab's freelist. `recip` must be the cache's
    /// `object_size` reciprocal.
    ///
    /// # Panics
    /// If `idx` is out of range — a double free or other freelist
    /// corruption, which is treated as fatal rather than recoverable.
    pub fn put_obj(&mut self, obj: NonNull<u8>, recip: Reciprocal) {
        let offset = obj.as_ptr() as usize - self.first_object_addr.as_ptr() as usize;
        let idx = recip.divide(offset as u32) as FreeIndex;
        if idx >= self.num {
            log::error!(
                "[SLAB] put_obj({obj:p}): computed index {idx} >= num {} (freelist corruption)",
                self.num
            );
        }
        assert!(idx < self.num, "put_obj: object outside slab bounds (corruption)");
        let prev_head = self.free_head;
        self.freelist_slice_mut()[idx as usize] = prev_head;
        self.free_head = idx;
        self.in_use -= 1;
    }
}

/// Parameters needed to carve a freshly-obtained page run into a new slab.
pub struct CarveParams {
    pub page_addr: NonNull<u8>,
    pub descriptor: NonNull<Slab>,
    pub freelist: NonNull<FreeIndex>,
    pub first_object_addr: NonNull<u8>,
    pub off_slab: bool,
    pub coloring_offset: u32,
    pub node: NodeId,
    pub num: u16,
    pub cache: NonNull<Cache>,
}

/// Initialize a slab descriptor and its freelist vector over freshly
/// obtained pages. Does **not** invoke the cache's constructor — the
/// caller does that once per object right after this returns, since a
/// constructor runs once per lifetime of the page memory, not once per
/// allocation.
///
/// # Safety
/// `params.descriptor` and `params.freelist` must point at writable,
/// exclusively-owned memory of the right sizes (as computed by
/// [`crate::geometry::plan`]), and must not already be linked into any
/// list.
pub unsafe fn carve(params: CarveParams) -> NonNull<Slab> {
    let CarveParams {
        page_addr,
        mut descriptor,
        freelist,
        first_object_addr,
        off_slab,
        coloring_offset,
        node,
        num,
        cache,
    } = params;

    // SAFETY: caller guarantees `descriptor` is writable and unlinked.
    unsafe {
        descriptor.as_ptr().write(Slab {
            list_next: None,
            list_prev: None,
            cache,
            node,
            coloring_offset,
            first_object_addr,
            page_addr,
            off_slab,
            in_use: 0,
            num,
            free_head: 0,
            freelist,
        });

        let slab = descriptor.as_mut();
        let fl = slab.freelist_slice_mut();
        for i in 0..num {
            fl[i as usize] = if i + 1 == num { FREE_INDEX_END } else { i + 1 };
        }
    }

    descriptor
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::geometry::Reciprocal;

    const OBJECT_SIZE: u32 = 32;
    const NUM: u16 = 16;

    /// Stack-backed object arena plus a freshly carved slab descriptor over
    /// it, for tests that only exercise `Slab`'s own bookkeeping. `cache` is
    /// a dangling pointer: nothing under test reads it.
    struct Fixture {
        objects: [[u8; OBJECT_SIZE as usize]; NUM as usize],
        freelist: [FreeIndex; NUM as usize],
        slab: core::mem::MaybeUninit<Slab>,
    }

    impl Fixture {
        fn slab(&self) -> &Slab {
            // SAFETY: `build` initializes this field via `carve` before
            // returning, and never re-uninitializes it afterward.
            unsafe { self.slab.assume_init_ref() }
        }
        fn slab_mut(&mut self) -> &mut Slab {
            // SAFETY: see `slab`.
            unsafe { self.slab.assume_init_mut() }
        }
    }

    fn build() -> alloc::boxed::Box<Fixture> {
        let mut boxed = alloc::boxed::Box::new(Fixture {
            objects: [[0u8; OBJECT_SIZE as usize]; NUM as usize],
            freelist: [0; NUM as usize],
            slab: core::mem::MaybeUninit::uninit(),
        });
        let first_object_addr = NonNull::new(boxed.objects.as_mut_ptr().cast::<u8>()).unwrap();
        let freelist = NonNull::new(boxed.freelist.as_mut_ptr()).unwrap();
        let descriptor = NonNull::new(boxed.slab.as_mut_ptr()).unwrap();
        let params = CarveParams {
            page_addr: first_object_addr,
            descriptor,
            freelist,
            first_object_addr,
            off_slab: true,
            coloring_offset: 0,
            node: 0,
            num: NUM,
            cache: NonNull::dangling(),
        };
        // SAFETY: all pointers above are freshly taken from `boxed`'s own
        // fields, sized exactly for `NUM` objects/indices, and not linked
        // into any list.
        unsafe { carve(params) };
        boxed
    }

    #[test]
    fn freelist_starts_full_and_terminates_in_end() {
        let fx = build();
        let mut idx = fx.slab().free_head;
        let mut seen = alloc::vec::Vec::new();
        for _ in 0..NUM {
            assert_ne!(idx, FREE_INDEX_END, "freelist ended early");
            assert!(!seen.contains(&idx), "freelist index repeated: {idx}");
            seen.push(idx);
            idx = fx.slab().freelist_slice()[idx as usize];
        }
        assert_eq!(idx, FREE_INDEX_END, "freelist must terminate in END after exactly num steps");
        assert_eq!(seen.len(), NUM as usize);
    }

    #[test]
    fn get_obj_then_put_obj_is_lifo() {
        let mut fx = build();
        let recip = Reciprocal::for_divisor(OBJECT_SIZE);

        let a = fx.slab_mut().get_obj(OBJECT_SIZE);
        let b = fx.slab_mut().get_obj(OBJECT_SIZE);
        assert_eq!(fx.slab().in_use, 2);
        assert_ne!(a, b);

        fx.slab_mut().put_obj(b, recip);
        fx.slab_mut().put_obj(a, recip);
        assert_eq!(fx.slab().in_use, 0);
        assert_eq!(fx.slab().state(), SlabState::Free);

        // P3: a single-threaded alloc/free/alloc sequence on an idle slab
        // returns the same pointer for both allocs.
        let c = fx.slab_mut().get_obj(OBJECT_SIZE);
        assert_eq!(c, a, "LIFO reuse must hand back the most recently freed object");
    }

    #[test]
    fn state_transitions_follow_in_use_count() {
        let mut fx = build();
        assert_eq!(fx.slab().state(), SlabState::Free);

        let mut handed_out = alloc::vec::Vec::new();
        for _ in 0..NUM {
            handed_out.push(fx.slab_mut().get_obj(OBJECT_SIZE));
        }
        assert_eq!(fx.slab().state(), SlabState::Full);

        let recip = Reciprocal::for_divisor(OBJECT_SIZE);
        fx.slab_mut().put_obj(handed_out.pop().unwrap(), recip);
        assert_eq!(fx.slab().state(), SlabState::Partial);

        while let Some(obj) = handed_out.pop() {
            fx.slab_mut().put_obj(obj, recip);
        }
        assert_eq!(fx.slab().state(), SlabState::Free);
    }

    #[test]
    #[should_panic(expected = "corruption")]
    fn put_obj_out_of_bounds_is_fatal() {
        let mut fx = build();
        // A pointer well past this slab's object region. `put_obj` only
        // ever turns this into an integer offset (never dereferences it),
        // so computing it via plain integer arithmetic avoids relying on
        // out-of-bounds pointer arithmetic.
        let base = fx.objects.as_ptr() as usize;
        let bogus = NonNull::new(base.wrapping_add(1 << 20) as *mut u8).unwrap();
        fx.slab_mut().put_obj(bogus, Reciprocal::for_divisor(OBJECT_SIZE));
    }
}

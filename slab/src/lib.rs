#![cfg_attr(not(feature = "std"), no_std)]

//! A CPU-cache-aware, NUMA-aware slab allocator for fixed-size kernel
//! objects, built on a three-tier free structure (per-CPU magazine, per-node
//! shared magazine, per-node slab lists) on top of a host-supplied physical
//! page allocator.
//!
//! # Layout
//! - [`cache`]: the `Cache` type and the alloc/free hot path.
//! - [`chain`]: the global cache registry and size-class lookup.
//! - [`geometry`]: the slab layout planner (page order, on/off-slab, coloring).
//! - [`slab`]: one contiguous run of pages carved into objects.
//! - [`magazine`]: the fixed-capacity pointer stack backing every tier.
//! - [`node_list`]: per-NUMA-node bookkeeping (the three slab lists, shared
//!   and alien magazines).
//! - [`bootstrap`]: the phased startup that breaks the "caches need caches"
//!   cycle.
//! - [`reaper`]: the periodic idle-resource sweep.
//! - [`page_source`]: the trait a host implements against its physical page
//!   allocator.
//!
//! # Threading and NUMA model
//! Per-CPU magazines are accessed without a lock, proven safe by a
//! [`slab_utils::NoPreemptGuard`] — the caller disables preemption for the
//! duration of the access, which this crate's `alloc`/`free` do
//! automatically. Per-node state is protected by one spinlock per node; at
//! most one such lock is ever held at a time by a single call.

extern crate alloc;

pub mod bootstrap;
pub mod cache;
pub mod chain;
pub mod error;
pub mod flags;
pub mod geometry;
mod intrusive_list;
pub mod magazine;
pub mod node_list;
pub mod page_source;
mod raw_alloc;
pub mod reaper;
pub mod slab;
pub mod tuning;

pub use bootstrap::{advance_to as advance_bootstrap_phase, is_full as bootstrap_is_full, set_meta_cache, BootstrapPhase};
pub use cache::{Cache, Constructor, MAX_CPUS};
pub use chain::size_class_lookup;
pub use error::Error;
pub use flags::CacheFlags;
pub use geometry::Geometry;
pub use node_list::MAX_NODES;
pub use page_source::{NodeId, PageFlags, PageSource, NODE_ANY};
pub use tuning::CacheTuning;

use core::ptr::NonNull;

/// Create a cache for fixed-size objects of `object_size` bytes.
///
/// Thin wrapper over [`Cache::create`] kept at the crate root so callers
/// don't need to reach into the `cache` module for the common entry
/// point; see that function for the full parameter contract.
#[allow(clippy::too_many_arguments)]
pub fn create_cache(
    name: &'static str,
    object_size: u32,
    align: u32,
    flags: CacheFlags,
    ctor: Option<Constructor>,
    tuning: CacheTuning,
    page_source: &'static dyn PageSource,
    backing_meta_cache: Option<NonNull<Cache>>,
) -> Result<NonNull<Cache>, Error> {
    Cache::create(name, object_size, align, flags, ctor, tuning, page_source, backing_meta_cache)
}

/// Destroy an empty cache.
///
/// # Safety
/// See [`Cache::destroy`].
pub unsafe fn destroy_cache(cache: NonNull<Cache>) -> Result<(), Error> {
    // SAFETY: forwarded from caller's contract.
    unsafe { Cache::destroy(cache) }
}

/// Allocate one object from `cache`, preferring the calling CPU's local
/// NUMA node.
pub fn alloc(cache: &Cache) -> Option<NonNull<u8>> {
    cache.alloc()
}

/// Allocate one object from `cache`, preferring `node`.
pub fn alloc_node(cache: &Cache, node: NodeId) -> Option<NonNull<u8>> {
    cache.alloc_node(node)
}

/// Return `obj` to the cache it came from.
///
/// # Safety
/// See [`Cache::free`].
pub unsafe fn free(cache: &Cache, obj: NonNull<u8>) {
    // SAFETY: forwarded from caller's contract.
    unsafe { cache.free(obj) }
}

/// Release every empty slab `cache` is holding back to its page source.
/// Returns `true` if any pages were released.
pub fn shrink(cache: &Cache) -> bool {
    cache.shrink()
}

#[cfg(all(test, feature = "std"))]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod integration_tests {
    use super::*;
    use core::alloc::Layout;
    use std::boxed::Box;
    use std::sync::Mutex as StdMutex;
    use std::vec::Vec;

    /// A `std`-backed `PageSource` for hosted tests: leaks page-order
    /// allocations through the system allocator and keeps its own
    /// page->(cache, slab) map, since there is no real MMU here.
    struct TestPageSource {
        map: StdMutex<Vec<(usize, NonNull<Cache>, NonNull<slab::Slab>)>>,
    }

    // SAFETY: all access goes through the internal `StdMutex`.
    unsafe impl Sync for TestPageSource {}

    impl TestPageSource {
        fn new() -> Self {
            Self { map: StdMutex::new(Vec::new()) }
        }
    }

    unsafe impl PageSource for TestPageSource {
        fn get_pages(&self, order: u32, _node: NodeId, _flags: PageFlags) -> Option<NonNull<u8>> {
            let bytes = geometry::PAGE_SIZE << order;
            let layout = Layout::from_size_align(bytes, geometry::PAGE_SIZE).ok()?;
            // SAFETY: non-zero-size layout.
            let ptr = unsafe { alloc::alloc::alloc(layout) };
            NonNull::new(ptr)
        }

        unsafe fn free_pages(&self, page_addr: NonNull<u8>, order: u32) {
            let bytes = geometry::PAGE_SIZE << order;
            let layout = Layout::from_size_align(bytes, geometry::PAGE_SIZE).expect("matches get_pages");
            let mut map = self.map.lock().expect("lock poisoned");
            map.retain(|(addr, _, _)| *addr != page_addr.as_ptr() as usize);
            drop(map);
            // SAFETY: `page_addr`/`order` match a prior `get_pages` call.
            unsafe { alloc::alloc::dealloc(page_addr.as_ptr(), layout) };
        }

        fn page_to_slab(&self, addr: NonNull<u8>) -> Option<(NonNull<Cache>, NonNull<slab::Slab>)> {
            let page = (addr.as_ptr() as usize) & !(geometry::PAGE_SIZE - 1);
            let map = self.map.lock().expect("lock poisoned");
            map.iter().find(|(a, _, _)| *a == page).map(|(_, c, s)| (*c, *s))
        }

        fn set_page_slab(&self, addr: NonNull<u8>, cache: NonNull<Cache>, slab: NonNull<slab::Slab>) {
            let page = addr.as_ptr() as usize;
            self.map.lock().expect("lock poisoned").push((page, cache, slab));
        }

        fn rcu_call(&self, cb: &mut dyn FnMut()) {
            cb();
        }

        fn addr_to_node(&self, _addr: NonNull<u8>) -> NodeId {
            0
        }
    }

    fn fresh_source() -> &'static TestPageSource {
        Box::leak(Box::new(TestPageSource::new()))
    }

    #[test]
    fn alloc_then_free_round_trip() {
        bootstrap::reset_for_test();
        let source = fresh_source();
        let cache = create_cache(
            "test-64",
            64,
            8,
            CacheFlags::empty(),
            None,
            CacheTuning::for_object_size(64),
            source,
            None,
        )
        .expect("create_cache");
        // SAFETY: cache is valid and exclusively owned by this test.
        let cache_ref = unsafe { cache.as_ref() };

        let obj = alloc(cache_ref).expect("alloc");
        // SAFETY: obj came from this cache's alloc and has not been freed.
        unsafe { free(cache_ref, obj) };

        let obj2 = alloc(cache_ref).expect("alloc after free reuses freed slot");
        assert_eq!(obj, obj2, "a single free slot must be reused LIFO");
        // SAFETY: obj2 is live and belongs to this cache.
        unsafe { free(cache_ref, obj2) };

        assert!(shrink(cache_ref), "an idle cache should have a free slab to release");
    }

    #[test]
    fn many_objects_stay_disjoint() {
        bootstrap::reset_for_test();
        let source = fresh_source();
        let cache = create_cache(
            "test-32",
            32,
            8,
            CacheFlags::empty(),
            None,
            CacheTuning::for_object_size(32),
            source,
            None,
        )
        .expect("create_cache");
        // SAFETY: exclusively owned by this test.
        let cache_ref = unsafe { cache.as_ref() };

        let mut seen = Vec::new();
        for _ in 0..500 {
            let obj = alloc(cache_ref).expect("alloc");
            assert!(!seen.contains(&obj), "allocator handed out the same object twice");
            seen.push(obj);
        }
        for obj in seen {
            // SAFETY: every pointer in `seen` came from `alloc` on this cache
            // and has not been freed yet.
            unsafe { free(cache_ref, obj) };
        }
    }

    /// Sum of `num - in_use` over every slab on `partial` and `free`,
    /// recomputed from the lists themselves rather than the running
    /// counter under test.
    fn recount_free_objects(cache: &Cache, node: NodeId) -> usize {
        let locked = cache.node_lists(node).lock();
        let mut total = 0usize;
        for slab in locked.partial.iter() {
            // SAFETY: every member of `partial` is a live slab while the
            // node lock (held by `locked`) is held.
            let s = unsafe { slab.as_ref() };
            total += (s.num - s.in_use) as usize;
        }
        for slab in locked.free.iter() {
            // SAFETY: see above.
            let s = unsafe { slab.as_ref() };
            total += (s.num - s.in_use) as usize;
        }
        total
    }

    #[test]
    fn free_objects_counter_matches_recount_from_the_lists() {
        // P1: node.free_objects == sum(num - in_use) over free + partial
        // slabs, after a mixed workload that leaves some slabs full, some
        // partial, and some free.
        bootstrap::reset_for_test();
        let source = fresh_source();
        let cache = create_cache(
            "test-p1",
            48,
            8,
            CacheFlags::empty(),
            None,
            CacheTuning::for_object_size(48),
            source,
            None,
        )
        .expect("create_cache");
        // SAFETY: exclusively owned by this test.
        let cache_ref = unsafe { cache.as_ref() };
        let num = cache_ref.geometry().num as usize;

        let mut held = Vec::new();
        for _ in 0..(num * 3 + num / 2) {
            held.push(alloc(cache_ref).expect("alloc"));
        }
        // Free roughly a third of what's outstanding, scattered across the
        // allocation order, so some slabs end up partial and some free.
        let mut i = 0;
        while i < held.len() {
            let obj = held.remove(i);
            // SAFETY: `obj` came from this cache and has not been freed.
            unsafe { free(cache_ref, obj) };
            i += 2;
        }

        let recorded = cache_ref.node_lists(0).lock().free_objects;
        let recounted = recount_free_objects(cache_ref, 0);
        assert_eq!(recorded, recounted, "free_objects counter drifted from the lists it summarizes");
    }

    fn xorshift32(state: &mut u32) -> u32 {
        let mut x = *state;
        x ^= x << 13;
        x ^= x >> 17;
        x ^= x << 5;
        *state = x;
        x
    }

    #[test]
    fn fuzzed_alloc_free_stream_never_misfiles_a_slab() {
        // P6: no slab ever sits on the wrong list for its in_use count,
        // checked after every step of a deterministic fuzzed alloc/free
        // stream.
        bootstrap::reset_for_test();
        let source = fresh_source();
        let cache = create_cache(
            "test-p6",
            40,
            8,
            CacheFlags::empty(),
            None,
            CacheTuning::for_object_size(40),
            source,
            None,
        )
        .expect("create_cache");
        // SAFETY: exclusively owned by this test.
        let cache_ref = unsafe { cache.as_ref() };

        let mut rng = 0x1234_5678u32;
        let mut outstanding = Vec::new();
        for _ in 0..4000 {
            let want_alloc = outstanding.is_empty() || (xorshift32(&mut rng) % 3 != 0 && outstanding.len() < 4096);
            if want_alloc {
                if let Some(obj) = alloc(cache_ref) {
                    outstanding.push(obj);
                }
            } else {
                let idx = (xorshift32(&mut rng) as usize) % outstanding.len();
                let obj = outstanding.swap_remove(idx);
                // SAFETY: `obj` was pushed by a prior successful `alloc` on
                // this cache and has not been freed since.
                unsafe { free(cache_ref, obj) };
            }

            for node in 0..slab_utils_max_nodes() {
                let locked = cache_ref.node_lists(node).lock();
                for slab in locked.full.iter() {
                    // SAFETY: live while the node lock is held.
                    let s = unsafe { slab.as_ref() };
                    assert_eq!(s.in_use, s.num, "slab on `full` with in_use != num");
                }
                for slab in locked.partial.iter() {
                    // SAFETY: see above.
                    let s = unsafe { slab.as_ref() };
                    assert!(s.in_use > 0 && s.in_use < s.num, "slab on `partial` with in_use={} num={}", s.in_use, s.num);
                }
                for slab in locked.free.iter() {
                    // SAFETY: see above.
                    let s = unsafe { slab.as_ref() };
                    assert_eq!(s.in_use, 0, "slab on `free` with in_use != 0");
                }
            }
        }

        for obj in outstanding {
            // SAFETY: every remaining pointer came from `alloc` on this
            // cache and has not been freed yet.
            unsafe { free(cache_ref, obj) };
        }
    }

    fn slab_utils_max_nodes() -> usize {
        node_list::MAX_NODES
    }

    #[test]
    fn destroyed_cache_is_not_found_in_the_chain() {
        // P7: destroy_cache on an empty cache followed by re-lookup
        // returns not-found.
        bootstrap::reset_for_test();
        let source = fresh_source();
        let cache = create_cache(
            "test-p7",
            48,
            8,
            CacheFlags::empty(),
            None,
            CacheTuning::for_object_size(48),
            source,
            None,
        )
        .expect("create_cache");
        let raw = cache.as_ptr();

        // SAFETY: the cache is empty (nothing was ever allocated from it).
        unsafe { destroy_cache(cache) }.expect("destroy of an empty cache must succeed");

        let mut found = false;
        chain::for_each(|c| {
            if core::ptr::eq(c as *const Cache, raw) {
                found = true;
            }
        });
        assert!(!found, "a destroyed cache must not still be registered in the chain");
    }

    #[test]
    fn destroy_with_outstanding_object_fails_then_succeeds_after_free() {
        // S6: destroy_cache on a cache with one outstanding object returns
        // CacheNotEmpty and leaves it registered; freeing the object and
        // destroying again succeeds.
        bootstrap::reset_for_test();
        let source = fresh_source();
        let cache = create_cache(
            "test-s6",
            40,
            8,
            CacheFlags::empty(),
            None,
            CacheTuning::for_object_size(40),
            source,
            None,
        )
        .expect("create_cache");
        let raw = cache.as_ptr();
        // SAFETY: exclusively owned by this test.
        let cache_ref = unsafe { cache.as_ref() };
        let obj = alloc(cache_ref).expect("alloc");

        // SAFETY: `cache` is a live, valid cache descriptor.
        let err = unsafe { destroy_cache(cache) }.unwrap_err();
        assert_eq!(err, Error::CacheNotEmpty);

        let mut still_there = false;
        chain::for_each(|c| {
            if core::ptr::eq(c as *const Cache, raw) {
                still_there = true;
            }
        });
        assert!(still_there, "a cache that failed to destroy must remain in the chain");

        // SAFETY: `obj` came from this cache and has not been freed.
        unsafe { free(cache_ref, obj) };
        // SAFETY: the cache is now empty and was not freed by the failed
        // destroy attempt above.
        unsafe { destroy_cache(cache) }.expect("destroy after freeing the outstanding object");
    }

    #[test]
    fn reap_trims_excess_free_slabs_toward_the_configured_limit() {
        // S5: allocate enough to force growth across several slabs, free
        // them all, then invoke the reaper once and check the free list
        // shrank by the expected trim ratio.
        bootstrap::reset_for_test();
        let source = fresh_source();
        let mut tuning = CacheTuning::for_object_size(40);
        // Large enough that freeing everything below never triggers the
        // eager per-object release in the free path; the test drives the
        // limit down afterward so only the reaper's sweep can act on it.
        tuning.free_limit_objects = 1 << 20;
        // Small enough that most of the frees below overflow straight past
        // the per-CPU and shared magazines onto their slabs, rather than
        // sitting in a magazine where the free list can't see them yet.
        tuning.cpu_magazine_capacity = 8;
        tuning.cpu_batch_count = 4;
        tuning.shared_magazine_capacity = 16;
        let cache = create_cache("test-s5", 40, 8, CacheFlags::empty(), None, tuning, source, None)
            .expect("create_cache");
        // SAFETY: exclusively owned by this test.
        let cache_ref = unsafe { cache.as_ref() };
        let num = cache_ref.geometry().num as usize;

        const SLABS: usize = 6;
        let mut held = Vec::new();
        for _ in 0..(num * SLABS) {
            held.push(alloc(cache_ref).expect("alloc"));
        }
        for obj in held {
            // SAFETY: every pointer came from `alloc` on this cache and has
            // not been freed yet.
            unsafe { free(cache_ref, obj) };
        }

        let free_limit = num * 2;
        {
            let mut locked = cache_ref.node_lists(0).lock();
            locked.free_limit = free_limit;
        }
        let before = cache_ref.node_lists(0).lock().free.len();
        assert!(before > free_limit / num, "test setup must start over the limit it then trims to");

        cache_ref.reap(1_000);

        let after = cache_ref.node_lists(0).lock().free.len();
        let excess = before.saturating_sub(free_limit / num);
        let expected_release = excess.div_ceil(5);
        assert_eq!(before - after, expected_release, "reap released a different number of slabs than the trim ratio predicts");
    }

    #[test]
    fn off_slab_layout_grows_a_second_slab_from_its_backing_cache() {
        // S3: a 2048-byte object (>= PAGE_SIZE/8) plans off-slab outside
        // early boot. Growth must carve the slab descriptor/freelist out of
        // a backing cache rather than the slab's own pages, and allocating
        // `num + 1` objects must grow exactly one additional slab.
        bootstrap::reset_for_test();
        let source = fresh_source();

        let target_geometry = geometry::plan(2048, 8, CacheFlags::empty(), false, geometry::DEFAULT_SLAB_BREAK_ORDER)
            .expect("geometry plan for the off-slab target");
        assert!(target_geometry.off_slab, "2048-byte objects must plan off-slab outside early boot");

        // The backing cache is created during early boot (on-slab,
        // regardless of its own size) and sized to hold exactly one
        // off-slab descriptor + freelist vector for the target geometry.
        let backing = create_cache(
            "test-s3-backing",
            target_geometry.slab_meta_bytes,
            8,
            CacheFlags::empty(),
            None,
            CacheTuning::for_object_size(target_geometry.slab_meta_bytes),
            source,
            None,
        )
        .expect("create backing cache");

        bootstrap::advance_to(BootstrapPhase::PartialMag);
        bootstrap::advance_to(BootstrapPhase::PartialList);
        bootstrap::advance_to(BootstrapPhase::Full);

        let cache = create_cache(
            "test-s3",
            2048,
            8,
            CacheFlags::empty(),
            None,
            CacheTuning::for_object_size(2048),
            source,
            Some(backing),
        )
        .expect("create_cache");
        // SAFETY: exclusively owned by this test.
        let cache_ref = unsafe { cache.as_ref() };
        assert!(cache_ref.geometry().off_slab, "cache under test must actually use off-slab layout");
        let num = cache_ref.geometry().num as usize;

        let mut held = Vec::new();
        for _ in 0..=num {
            held.push(alloc(cache_ref).expect("alloc"));
        }

        let slab_count = {
            let locked = cache_ref.node_lists(0).lock();
            locked.full.len() + locked.partial.len() + locked.free.len()
        };
        assert_eq!(slab_count, 2, "allocating num + 1 objects off-slab must grow exactly one extra slab");

        for obj in held {
            // SAFETY: every pointer came from `alloc` on this cache and has
            // not been freed yet.
            unsafe { free(cache_ref, obj) };
        }
    }

    #[test]
    fn off_slab_backing_cache_too_small_is_rejected() {
        // A backing cache whose own object size cannot hold this cache's
        // slab_meta_bytes must be refused at create time rather than let
        // carve_and_publish overrun it.
        bootstrap::reset_for_test();
        let source = fresh_source();

        let backing = create_cache(
            "test-undersized-backing",
            8,
            8,
            CacheFlags::empty(),
            None,
            CacheTuning::for_object_size(8),
            source,
            None,
        )
        .expect("create backing cache");

        bootstrap::advance_to(BootstrapPhase::PartialMag);
        bootstrap::advance_to(BootstrapPhase::PartialList);
        bootstrap::advance_to(BootstrapPhase::Full);

        let err = create_cache(
            "test-oversized-for-backing",
            2048,
            8,
            CacheFlags::empty(),
            None,
            CacheTuning::for_object_size(2048),
            source,
            Some(backing),
        )
        .unwrap_err();
        assert_eq!(err, Error::InvalidArgument);
    }
}

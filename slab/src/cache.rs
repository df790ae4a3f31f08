//! The typed object pool itself: geometry, per-CPU magazines, per-node
//! lists, growth/shrink policy, and the alloc/free hot path.

use core::ptr::NonNull;

use slab_utils::{preempt_disabled, NoPreemptGuard, PerCpu};

use crate::bootstrap;
use crate::error::Error;
use crate::flags::CacheFlags;
use crate::geometry::{self, Geometry};
use crate::intrusive_list::ListNode;
use crate::magazine::Magazine;
use crate::node_list::{NodeLists, SlabList, MAX_NODES};
use crate::page_source::{NodeId, PageFlags, PageSource, NODE_ANY};
use crate::raw_alloc;
use crate::slab::{self, CarveParams, FreeIndex, Slab, SlabState};
use crate::tuning::CacheTuning;

/// Upper bound on the number of CPUs a `Cache`'s per-CPU magazine array is
/// sized for. The host's actual CPU count (`<=` this) comes from
/// `slab_utils::guard::max_cpus`.
pub const MAX_CPUS: usize = 32;

/// Byte pattern stamped across a freed object's storage when
/// `CacheFlags::POISON` is set and the `debug-slab` feature is compiled in.
/// Same value `mm/slab.c` uses for its `POISON_FREE` byte.
#[cfg(feature = "debug-slab")]
const POISON_FREE: u8 = 0x6b;

/// A constructor invoked once per object, the moment its backing page
/// memory is carved into a slab — not on every `alloc`.
pub type Constructor = fn(NonNull<u8>);

/// A typed object pool.
pub struct Cache {
    chain_next: Option<NonNull<Cache>>,
    chain_prev: Option<NonNull<Cache>>,

    pub name: &'static str,
    geometry: Geometry,
    flags: CacheFlags,
    tuning: CacheTuning,
    ctor: Option<Constructor>,
    page_source: &'static dyn PageSource,

    cpu_magazines: PerCpu<Magazine, MAX_CPUS>,
    nodes: [NodeLists; MAX_NODES],

    /// Cache objects are carved from live pages; for a meta-cache (one that
    /// allocates off-slab metadata for *other* caches) this is `None` — its
    /// own metadata is always on-slab, to avoid infinite regress.
    backing_meta_cache: Option<NonNull<Cache>>,
}

impl ListNode for Cache {
    fn next(&self) -> Option<NonNull<Self>> {
        self.chain_next
    }
    fn prev(&self) -> Option<NonNull<Self>> {
        self.chain_prev
    }
    fn set_next(&mut self, next: Option<NonNull<Self>>) {
        self.chain_next = next;
    }
    fn set_prev(&mut self, prev: Option<NonNull<Self>>) {
        self.chain_prev = prev;
    }
}

// SAFETY: `Cache` coordinates internal mutability through `NodeLists`' own
// per-node spinlocks and through per-CPU magazines guarded by
// `NoPreemptGuard`; nothing else in the struct needs external
// synchronization.
unsafe impl Send for Cache {}
unsafe impl Sync for Cache {}

impl Cache {
    /// Create a cache for `object_size`-byte objects. `backing_meta_cache`
    /// supplies off-slab metadata storage when the planner picks off-slab
    /// layout; pass `None` to force on-slab (used for the bootstrap
    /// meta-caches themselves, before a general cache is available to lean
    /// on).
    // Bootstrap magazine allocation failure is unrecoverable this early:
    // there is no fallback allocator to retry with.
    #[allow(clippy::too_many_arguments, clippy::expect_used)]
    pub fn create(
        name: &'static str,
        object_size: u32,
        align: u32,
        flags: CacheFlags,
        ctor: Option<Constructor>,
        tuning: CacheTuning,
        page_source: &'static dyn PageSource,
        backing_meta_cache: Option<NonNull<Cache>>,
    ) -> Result<NonNull<Cache>, Error> {
        if object_size == 0 {
            return Self::fail(flags, Error::InvalidArgument);
        }

        let early_boot = !bootstrap::is_full();
        let geometry = match geometry::plan(
            object_size,
            align,
            flags,
            early_boot,
            geometry::DEFAULT_SLAB_BREAK_ORDER,
        ) {
            Ok(g) => g,
            Err(e) => return Self::fail(flags, e),
        };
        if geometry.off_slab {
            match backing_meta_cache {
                // Off-slab layout requires a ready backing cache; without
                // one this is a bootstrap ordering bug in the caller.
                None => return Self::fail(flags, Error::BootstrapViolation),
                // The backing cache's own object size must hold the
                // descriptor plus the freelist vector (`slab_meta_bytes`)
                // for *this* cache's `num`; a backing cache sized for a
                // smaller `num` would have `carve_and_publish` overrun it.
                Some(backing) => {
                    // SAFETY: `backing` is a live cache handed in by the
                    // caller, valid for the duration of this borrow.
                    let backing_size = unsafe { backing.as_ref() }.object_size();
                    if backing_size < geometry.slab_meta_bytes {
                        return Self::fail(flags, Error::InvalidArgument);
                    }
                }
            }
        }

        let cpu_magazine_capacity = tuning.cpu_magazine_capacity;
        let cpu_batch_count = tuning.cpu_batch_count;

        // SAFETY: allocation sized for exactly one `Cache`; freed in `destroy`.
        let cache_ptr = match unsafe { raw_alloc::alloc_one::<Cache>() } {
            Some(p) => p,
            None => return Self::fail(flags, Error::OutOfMemory),
        };

        let nodes: [NodeLists; MAX_NODES] =
            core::array::from_fn(|_| NodeLists::new(geometry.colour_count, tuning.free_limit_objects));

        let cpu_magazines = PerCpu::new(|_| {
            // SAFETY: sized for exactly `cpu_magazine_capacity` slots,
            // matching what push/pop/transfer on this magazine assume.
            let entries = unsafe { raw_alloc::alloc_array::<NonNull<u8>>(cpu_magazine_capacity as usize) }
                .expect("bootstrap: failed to allocate a per-CPU magazine");
            // SAFETY: `entries` points at `cpu_magazine_capacity` writable,
            // exclusively-owned slots that outlive this `Magazine`.
            unsafe { Magazine::new(entries, cpu_magazine_capacity, cpu_batch_count) }
        });

        let mut cache_ptr = cache_ptr;
        // SAFETY: `cache_ptr` is a fresh, exclusively-owned allocation.
        unsafe {
            cache_ptr.as_ptr().write(Cache {
                chain_next: None,
                chain_prev: None,
                name,
                geometry,
                flags,
                tuning,
                ctor,
                page_source,
                cpu_magazines,
                nodes,
                backing_meta_cache,
            });
        }

        crate::chain::register(cache_ptr);
        log::debug!(
            "[SLAB] created cache \"{name}\": object_size={} align={} order={} num={} off_slab={}",
            geometry.object_size,
            geometry.align,
            geometry.order,
            geometry.num,
            geometry.off_slab
        );
        Ok(cache_ptr)
    }

    fn fail(flags: CacheFlags, err: Error) -> Result<NonNull<Cache>, Error> {
        if flags.contains(CacheFlags::PANIC_ON_FAIL) {
            panic!("cache creation failed: {err}");
        }
        Err(err)
    }

    pub fn object_size(&self) -> u32 {
        self.geometry.object_size
    }

    pub fn geometry(&self) -> &Geometry {
        &self.geometry
    }

    /// Test-only introspection hook: the per-node lists, lock and all, so
    /// hosted tests can check invariants (list membership, accounting)
    /// without duplicating the production lock/list plumbing.
    #[cfg(test)]
    pub(crate) fn node_lists(&self, node: NodeId) -> &NodeLists {
        &self.nodes[node]
    }

    /// Destroy an empty cache. Fails with `CacheNotEmpty` if any slab is
    /// still `partial` or `full` on any node.
    ///
    /// # Safety
    /// `cache` must not be used again (by any CPU) after this returns `Ok`.
    pub unsafe fn destroy(cache: NonNull<Cache>) -> Result<(), Error> {
        let mut cache = cache;
        // SAFETY: caller guarantees exclusive, valid access to `cache` for
        // the duration of this call.
        let this = unsafe { cache.as_mut() };
        let max_cpus = slab_utils::guard::max_cpus();

        // Drain every per-CPU magazine back to its node's free lists.
        for cpu in 0..max_cpus {
            // SAFETY: destroy requires the caller to have already quiesced
            // every other user of this cache, so no CPU can be mid-access
            // to its own slot.
            let mag = unsafe { this.cpu_magazines.get_unchecked(cpu) };
            let home = cpu % MAX_NODES;
            let n = mag.available();
            this.free_block_from_magazine(home, mag, n);
        }

        for node in 0..MAX_NODES {
            let mut guard = this.nodes[node].lock();

            if let Some(mut shared) = guard.shared.take() {
                drop(guard);
                let n = shared.available();
                this.free_block(node, &mut shared, n);
                // SAFETY: matches the allocation made lazily in `refill`/`flush_and_push`.
                unsafe { raw_alloc::free_array(shared.entries_ptr(), shared.capacity() as usize) };
                guard = this.nodes[node].lock();
            }

            for remote in 0..MAX_NODES {
                if let Some(mut alien) = guard.alien[remote].take() {
                    drop(guard);
                    let n = alien.available();
                    this.free_block(remote, &mut alien, n);
                    // SAFETY: matches the allocation made lazily in `free_to_alien`.
                    unsafe { raw_alloc::free_array(alien.entries_ptr(), alien.capacity() as usize) };
                    guard = this.nodes[node].lock();
                }
            }

            if !guard.full.is_empty() || !guard.partial.is_empty() {
                drop(guard);
                return Err(Error::CacheNotEmpty);
            }

            while let Some(slab) = guard.free.pop_front() {
                // SAFETY: slab was obtained fully-free, so it held exactly
                // `geometry.num` free objects.
                guard.free_objects -= this.geometry.num as usize;
                drop(guard);
                // SAFETY: `slab` was just unlinked; nothing else can see it.
                unsafe { this.release_slab(slab) };
                guard = this.nodes[node].lock();
            }
        }

        crate::chain::unregister(cache);
        log::debug!("[SLAB] destroyed cache \"{}\"", this.name);

        for cpu in 0..max_cpus {
            // SAFETY: same as the drain loop above — exclusive at this point.
            let mag = unsafe { this.cpu_magazines.get_unchecked(cpu) };
            // SAFETY: matches the allocation made in `create`.
            unsafe { raw_alloc::free_array(mag.entries_ptr(), mag.capacity() as usize) };
        }

        // SAFETY: `cache` was allocated with `alloc_one::<Cache>` in `create`.
        unsafe { raw_alloc::free_one(cache) };
        Ok(())
    }

    // ---------------------------------------------------------------
    // Hot path: alloc
    // ---------------------------------------------------------------

    /// Allocate one object, preferring the local NUMA node. Runs with
    /// preemption disabled for its whole duration.
    pub fn alloc(&self) -> Option<NonNull<u8>> {
        let guard = preempt_disabled();
        self.alloc_with_guard(&guard, NODE_ANY)
    }

    /// Allocate from a specific NUMA node, falling back to other nodes and
    /// finally to an unrestricted-node grow if `node` is exhausted.
    pub fn alloc_node(&self, node: NodeId) -> Option<NonNull<u8>> {
        let guard = preempt_disabled();
        self.alloc_with_guard(&guard, node)
    }

    fn alloc_with_guard(&self, guard: &NoPreemptGuard, requested_node: NodeId) -> Option<NonNull<u8>> {
        // Tier 1: per-CPU magazine hit.
        if let Some(obj) = self.cpu_magazines.get(guard).pop() {
            self.verify_poison_on_alloc(obj);
            return Some(obj);
        }

        let primary = if requested_node == NODE_ANY {
            guard.cpu_id() % MAX_NODES
        } else {
            requested_node
        };

        if let Some(obj) = self.refill_and_pop(guard, primary) {
            return Some(obj);
        }
        for node in 0..MAX_NODES {
            if node == primary {
                continue;
            }
            if let Some(obj) = self.refill_and_pop(guard, node) {
                return Some(obj);
            }
        }

        // Every node's lists are exhausted. A caller that named a specific
        // node gets a grow attempt pinned to that node before we fall back
        // to an unrestricted hint, per the NUMA policy in spec.md §4.4.
        if requested_node != NODE_ANY {
            if let Some(obj) = self.grow_on_node(guard, requested_node) {
                return Some(obj);
            }
        }
        self.grow_unrestricted(guard)
    }

    /// Pages must come from a DMA-capable zone whenever the cache was
    /// created with [`CacheFlags::DMA`]; every other context may sleep
    /// while growing.
    fn page_flags(&self) -> PageFlags {
        let mut flags = PageFlags::MAY_SLEEP;
        if self.flags.contains(CacheFlags::DMA) {
            flags |= PageFlags::DMA;
        }
        flags
    }

    /// Tier 3, pinned to `node`: ask the page source for pages on that node
    /// specifically. Falls through to `None` (letting the caller try an
    /// unrestricted grow) if `node` itself cannot supply pages — it does
    /// not retry on other nodes itself, since `alloc_with_guard` already
    /// walked every node's existing lists before reaching here.
    fn grow_on_node(&self, guard: &NoPreemptGuard, node: NodeId) -> Option<NonNull<u8>> {
        let order = self.geometry.order;
        let page_addr = self.page_source.get_pages(order, node, self.page_flags())?;
        let actual_node = self.page_source.addr_to_node(page_addr) % MAX_NODES;
        log::trace!(
            "[SLAB] \"{}\": grew one slab on node {actual_node} (requested node={node}, order={order})",
            self.name
        );
        self.carve_and_publish(page_addr, actual_node);
        self.refill_and_pop(guard, actual_node)
    }

    /// Tier 2 (refill) followed by a Tier-1 retry, for one node.
    fn refill_and_pop(&self, guard: &NoPreemptGuard, node: NodeId) -> Option<NonNull<u8>> {
        self.refill(guard, node);
        let obj = self.cpu_magazines.get(guard).pop()?;
        self.verify_poison_on_alloc(obj);
        Some(obj)
    }

    /// Check (when the `debug-slab` feature and [`CacheFlags::POISON`] are
    /// both active, and the cache has no constructor) that an object about
    /// to be handed to a caller still holds the poison pattern written when
    /// it was freed — anything else means something wrote through a
    /// dangling pointer after the free.
    #[cfg(feature = "debug-slab")]
    fn verify_poison_on_alloc(&self, obj: NonNull<u8>) {
        if self.ctor.is_some() || !self.flags.contains(CacheFlags::POISON) {
            return;
        }
        let size = self.geometry.object_size as usize;
        // SAFETY: `obj` was just taken from a magazine and is exclusively
        // ours until this function returns it to the caller above.
        let bytes = unsafe { core::slice::from_raw_parts(obj.as_ptr(), size) };
        if bytes.iter().any(|&b| b != POISON_FREE) {
            log::error!(
                "[SLAB] \"{}\": poison check failed for {obj:p} ({})",
                self.name,
                Error::CorruptionDetected
            );
            panic!("slab: write to freed object detected (poison mismatch)");
        }
    }

    #[cfg(not(feature = "debug-slab"))]
    fn verify_poison_on_alloc(&self, _obj: NonNull<u8>) {}

    /// Stamp the poison pattern across an object the instant it becomes
    /// free, regardless of which tier (alien/shared/per-CPU magazine, or
    /// straight back to its slab) it ends up resting in.
    #[cfg(feature = "debug-slab")]
    fn poison_on_free(&self, obj: NonNull<u8>) {
        if !self.flags.contains(CacheFlags::POISON) {
            return;
        }
        let size = self.geometry.object_size as usize;
        // SAFETY: the caller of `free` guarantees `obj` is no longer
        // referenced by anyone else from this point on.
        unsafe { core::ptr::write_bytes(obj.as_ptr(), POISON_FREE, size) };
    }

    #[cfg(not(feature = "debug-slab"))]
    fn poison_on_free(&self, _obj: NonNull<u8>) {}

    /// Tier 2: refill the calling CPU's magazine from the shared magazine
    /// or from node lists.
    // Shared-magazine allocation failure here has no fallback path.
    #[allow(clippy::expect_used)]
    fn refill(&self, guard: &NoPreemptGuard, node: NodeId) {
        let mut locked = self.nodes[node].lock();

        // (a) Shared magazine first; allocated lazily on first use.
        let shared_cap = self.tuning.shared_magazine_capacity;
        let shared_batch = self.tuning.cpu_batch_count;
        let shared = locked.shared.get_or_insert_with(|| {
            // SAFETY: sized for exactly `shared_cap` slots, matching
            // Magazine's contract.
            let entries = unsafe { raw_alloc::alloc_array::<NonNull<u8>>(shared_cap as usize) }
                .expect("bootstrap: failed to allocate a shared magazine");
            unsafe { Magazine::new(entries, shared_cap, shared_batch) }
        });
        let mag = self.cpu_magazines.get(guard);
        let batch = mag.batch_count;
        let moved = Magazine::transfer(mag, shared, batch);
        if moved > 0 {
            return;
        }

        // (b) Node lists: partial first, then free.
        let want = self.cpu_magazines.get(guard).batch_count;
        let mut taken = 0u16;

        while taken < want {
            let (slab_ptr, from) = if let Some(s) = locked.partial.head() {
                (s, SlabList::Partial)
            } else if let Some(s) = locked.free.head() {
                locked.free_touched = true;
                (s, SlabList::Free)
            } else {
                break;
            };

            // SAFETY: `slab_ptr` is a live member of `locked`'s lists,
            // whose lock we hold.
            let slab = unsafe { &mut *slab_ptr.as_ptr() };
            let mut taken_from_slab = 0u16;
            while taken < want && slab.in_use < slab.num {
                let obj = slab.get_obj(self.geometry.object_size);
                self.cpu_magazines.get(guard).push(obj);
                taken += 1;
                taken_from_slab += 1;
            }
            locked.free_objects -= taken_from_slab as usize;
            // SAFETY: `slab_ptr` is currently linked into the list named
            // by `from`.
            unsafe { locked.move_to_current_list(slab_ptr, from) };
        }
    }

    /// Grow with an unrestricted node hint, filing the resulting slab
    /// under whichever node it actually landed on, then retrying the
    /// allocation once.
    fn grow_unrestricted(&self, guard: &NoPreemptGuard) -> Option<NonNull<u8>> {
        let order = self.geometry.order;
        let page_addr = self.page_source.get_pages(order, NODE_ANY, self.page_flags());
        let Some(page_addr) = page_addr else {
            log::warn!("[SLAB] \"{}\": page source exhausted while growing (order={order})", self.name);
            return None;
        };
        let actual_node = self.page_source.addr_to_node(page_addr) % MAX_NODES;
        log::trace!("[SLAB] \"{}\": grew one slab on node {actual_node} (order={order})", self.name);
        self.carve_and_publish(page_addr, actual_node);
        self.refill_and_pop(guard, actual_node)
    }

    // Both `expect`s below are geometry-planner invariants: `plan` only
    // picks off-slab when `create` was given a backing cache, and that
    // cache's own allocation only fails under OOM, which is as
    // unrecoverable here as failing to grow at all.
    #[allow(clippy::expect_used)]
    fn carve_and_publish(&self, page_addr: NonNull<u8>, node: NodeId) {
        let g = &self.geometry;
        let mut locked = self.nodes[node].lock();
        let coloring_offset = locked.next_coloring_offset(g.colour_unit);
        drop(locked);

        let (descriptor, freelist) = if g.off_slab {
            let backing = self
                .backing_meta_cache
                .expect("off-slab geometry chosen without a backing cache");
            // SAFETY: backing cache is sized to hold one slab's worth of
            // descriptor + freelist bytes.
            let meta = unsafe { backing.as_ref() }
                .alloc()
                .expect("bootstrap: failed to allocate off-slab slab metadata");
            let descriptor = meta.cast::<Slab>();
            // SAFETY: the freelist vector sits right after the descriptor
            // within the same backing allocation, sized for
            // `slab_meta_bytes` bytes by the backing cache's own geometry.
            let freelist = unsafe {
                NonNull::new_unchecked(meta.as_ptr().add(core::mem::size_of::<Slab>()) as *mut FreeIndex)
            };
            (descriptor, freelist)
        } else {
            // SAFETY: the slab's own pages have room for the descriptor
            // and freelist vector up front; the planner placed coloring
            // padding and objects after `slab_meta_bytes`.
            let descriptor = page_addr.cast::<Slab>();
            let freelist = unsafe {
                NonNull::new_unchecked(
                    page_addr.as_ptr().add(core::mem::size_of::<Slab>()) as *mut FreeIndex
                )
            };
            (descriptor, freelist)
        };

        let objects_base = if g.off_slab {
            page_addr
        } else {
            // SAFETY: stays within the slab's own pages; the planner
            // placed `slab_meta_bytes` then coloring padding then objects.
            unsafe { NonNull::new_unchecked(page_addr.as_ptr().add(g.slab_meta_bytes as usize)) }
        };
        let first_object_addr =
            // SAFETY: coloring_offset < colour_count * colour_unit <= the
            // leftover space the planner reserved for it.
            unsafe { NonNull::new_unchecked(objects_base.as_ptr().add(coloring_offset as usize)) };

        let cache_ptr = NonNull::from(self);
        let params = CarveParams {
            page_addr,
            descriptor,
            freelist,
            first_object_addr,
            off_slab: g.off_slab,
            coloring_offset,
            node,
            num: g.num,
            cache: cache_ptr,
        };
        // SAFETY: `descriptor`/`freelist` point at freshly obtained,
        // exclusively-owned memory sized per `geometry::plan`.
        let slab = unsafe { slab::carve(params) };

        #[cfg(feature = "debug-slab")]
        if self.flags.contains(CacheFlags::POISON) {
            for i in 0..g.num {
                let obj = unsafe { slab.as_ref() }.object_at(i, g.object_size);
                // SAFETY: freshly carved, exclusively-owned object storage.
                unsafe { core::ptr::write_bytes(obj.as_ptr(), POISON_FREE, g.object_size as usize) };
            }
        }

        if let Some(ctor) = self.ctor {
            for i in 0..g.num {
                // SAFETY: `i < num`, within the slab's object area.
                let obj = unsafe { slab.as_ref() }.object_at(i, g.object_size);
                ctor(obj);
            }
        }

        for p in 0..(1usize << g.order) {
            // SAFETY: `page_addr` spans `2^order` pages; `p` stays in range.
            let page =
                unsafe { NonNull::new_unchecked(page_addr.as_ptr().add(p * geometry::PAGE_SIZE)) };
            self.page_source.set_page_slab(page, cache_ptr, slab);
        }

        let mut locked = self.nodes[node].lock();
        // SAFETY: `slab` is a fresh descriptor not linked into any list.
        unsafe { locked.free.push_front(slab) };
        locked.free_objects += g.num as usize;
    }

    // ---------------------------------------------------------------
    // Hot path: free
    // ---------------------------------------------------------------

    /// Return `obj` to the cache it came from.
    ///
    /// # Safety
    /// `obj` must have been returned by a prior `alloc`/`alloc_node` on
    /// this cache and not already freed.
    // A missing page->slab mapping here means the caller handed back a
    // pointer this allocator never produced; there is nothing to recover.
    #[allow(clippy::expect_used)]
    pub unsafe fn free(&self, obj: NonNull<u8>) {
        let guard = preempt_disabled();
        let page = page_of(obj);
        let Some((owner_cache, owner_slab)) = self.page_source.page_to_slab(page) else {
            log::error!(
                "[SLAB] \"{}\": free({obj:p}) maps to no known slab ({})",
                self.name,
                Error::CorruptionDetected
            );
            panic!("free: object does not belong to any known slab (corruption)");
        };
        if owner_cache.as_ptr() != self as *const Cache as *mut Cache {
            log::error!(
                "[SLAB] \"{}\": free({obj:p}) belongs to a different cache ({})",
                self.name,
                Error::CorruptionDetected
            );
            panic!("free: object belongs to a different cache");
        }

        let local_node = guard.cpu_id() % MAX_NODES;
        // SAFETY: `owner_slab` is a live slab descriptor registered by a
        // prior `carve`.
        let owner_node = unsafe { owner_slab.as_ref() }.node;

        self.poison_on_free(obj);

        if owner_node != local_node {
            self.free_to_alien(local_node, owner_node, obj);
            return;
        }

        let mag = self.cpu_magazines.get(&guard);
        if mag.available() < mag.capacity() {
            mag.push(obj);
            return;
        }

        self.flush_and_push(&guard, local_node, obj);
    }

    // The alien-magazine allocation has no fallback, and the post-`take`
    // `expect` follows a lock held continuously since the check above.
    #[allow(clippy::expect_used)]
    fn free_to_alien(&self, local_node: NodeId, home_node: NodeId, obj: NonNull<u8>) {
        let mut locked = self.nodes[local_node].lock();
        let cap = self.tuning.shared_magazine_capacity;
        let batch = self.tuning.cpu_batch_count;
        let alien = locked.alien[home_node].get_or_insert_with(|| {
            // SAFETY: sized for exactly `cap` slots, matching Magazine's contract.
            let entries = unsafe { raw_alloc::alloc_array::<NonNull<u8>>(cap as usize) }
                .expect("bootstrap: failed to allocate an alien magazine");
            unsafe { Magazine::new(entries, cap, batch) }
        });

        if alien.available() < alien.capacity() {
            alien.push(obj);
            return;
        }

        // Alien magazine is full: flush it to its home node's slabs, then retry.
        let mut full = locked.alien[home_node].take().expect("checked Some above");
        drop(locked);
        let n = full.available();
        self.free_block(home_node, &mut full, n);
        self.nodes[local_node].lock().alien[home_node] = Some(full);
        self.free_to_alien(local_node, home_node, obj);
    }

    #[allow(clippy::expect_used)]
    fn flush_and_push(&self, guard: &NoPreemptGuard, node: NodeId, obj: NonNull<u8>) {
        let mag = self.cpu_magazines.get(guard);
        let batch = mag.batch_count;

        let mut locked = self.nodes[node].lock();
        let cap = self.tuning.shared_magazine_capacity;
        let shared_batch = self.tuning.cpu_batch_count;
        let shared = locked.shared.get_or_insert_with(|| {
            // SAFETY: sized for exactly `cap` slots, matching Magazine's contract.
            let entries = unsafe { raw_alloc::alloc_array::<NonNull<u8>>(cap as usize) }
                .expect("bootstrap: failed to allocate a shared magazine");
            unsafe { Magazine::new(entries, cap, shared_batch) }
        });
        let moved_to_shared = Magazine::transfer(shared, self.cpu_magazines.get(guard), batch);
        drop(locked);

        let still_to_move = batch.saturating_sub(moved_to_shared);
        if still_to_move > 0 {
            let mag = self.cpu_magazines.get(guard);
            self.free_block_from_magazine(node, mag, still_to_move);
        }

        let mag = self.cpu_magazines.get(guard);
        debug_assert!(mag.available() < mag.capacity());
        mag.push(obj);
    }

    /// Pull `n` objects from the bottom of `mag` and return each directly
    /// to its owning slab. `mag` must belong to `self`.
    fn free_block_from_magazine(&self, _home_node_hint: NodeId, mag: &mut Magazine, n: u16) {
        let page_source = self.page_source;
        mag.drain_bottom(
            &mut |obj| {
                let page = page_of(obj);
                if let Some((_, slab)) = page_source.page_to_slab(page) {
                    // SAFETY: slab is a live descriptor.
                    let home = unsafe { slab.as_ref() }.node;
                    self.put_one(home, slab, obj);
                }
            },
            n,
        );
    }

    fn free_block(&self, node: NodeId, mag: &mut Magazine, n: u16) {
        self.free_block_from_magazine(node, mag, n);
    }

    /// Return one object to its slab, moving the slab between
    /// `full`/`partial`/`free` as needed, and releasing the slab to the
    /// page source if doing so would push `free_objects` over
    /// `free_limit`.
    fn put_one(&self, node: NodeId, slab_ptr: NonNull<Slab>, obj: NonNull<u8>) {
        let mut locked = self.nodes[node].lock();
        // SAFETY: slab is a live descriptor belonging to `node`, whose
        // lock we hold.
        let slab = unsafe { &mut *slab_ptr.as_ptr() };
        let was = slab_list_of(slab.state());
        slab.put_obj(obj, self.geometry.recip);
        locked.free_objects += 1;

        if slab.state() == SlabState::Free && locked.free_objects > locked.free_limit {
            // SAFETY: `slab_ptr` is linked into `was`.
            unsafe { locked.move_to_current_list(slab_ptr, was) };
            // SAFETY: `slab_ptr` is now linked into `free` (just moved there).
            unsafe { locked.free.remove(slab_ptr) };
            locked.free_objects -= self.geometry.num as usize;
            drop(locked);
            // SAFETY: `slab_ptr` was just unlinked from every list.
            unsafe { self.release_slab(slab_ptr) };
        } else {
            // SAFETY: `slab_ptr` is linked into `was`.
            unsafe { locked.move_to_current_list(slab_ptr, was) };
        }
    }

    /// Release an empty slab's pages back to the page source, honoring
    /// `DESTROY_BY_RCU`.
    ///
    /// # Safety
    /// `slab` must not be linked into any list and must have `in_use == 0`.
    unsafe fn release_slab(&self, slab: NonNull<Slab>) {
        // SAFETY: caller guarantees exclusive access to an unlinked, empty slab.
        let s = unsafe { slab.as_ref() };
        let page_addr = s.page_addr;
        let order = self.geometry.order;
        let off_slab = s.off_slab;
        let page_source = self.page_source;
        let backing = self.backing_meta_cache;

        let do_release = move || {
            // SAFETY: `page_addr`/`order` match a prior `get_pages` call
            // for this slab and have not been freed since.
            unsafe { page_source.free_pages(page_addr, order) };
            if off_slab {
                if let Some(backing) = backing {
                    // SAFETY: `slab` was allocated from `backing` in `carve_and_publish`.
                    unsafe { backing.as_ref().free(slab.cast::<u8>()) };
                }
            }
        };

        if self.flags.rcu_destroy() {
            let mut do_release = Some(do_release);
            self.page_source.rcu_call(&mut || {
                if let Some(f) = do_release.take() {
                    f();
                }
            });
        } else {
            do_release();
        }
    }

    /// Drain idle magazines / excess free slabs for this cache. See
    /// [`crate::reaper`] for the per-CPU periodic driver that calls this
    /// across every registered cache.
    // Every `expect` below follows an `is_some`/just-checked-`Some` guard
    // under the same node lock, never released in between.
    #[allow(clippy::expect_used)]
    pub(crate) fn reap(&self, now_tick: u64) {
        let max_cpus = slab_utils::guard::max_cpus();
        for cpu in 0..max_cpus {
            // SAFETY: the reaper runs inline on each CPU in turn, never
            // concurrently with that CPU's own hot path, so no aliasing
            // `&mut Magazine` can exist for the same slot at the same time.
            let mag = unsafe { self.cpu_magazines.get_unchecked(cpu) };
            let local_node = cpu % MAX_NODES;
            if !mag.touched {
                let n = mag.available() / 5;
                if n > 0 {
                    self.free_block_from_magazine(local_node, mag, n);
                }
            } else {
                mag.touched = false;
            }
        }

        for node in 0..MAX_NODES {
            // Round-robin alien drain.
            let mut locked = self.nodes[node].lock();
            for remote in 0..MAX_NODES {
                if let Some(mut alien) = locked.alien[remote].take() {
                    let n = alien.available();
                    drop(locked);
                    if n > 0 {
                        self.free_block(remote, &mut alien, n);
                    }
                    locked = self.nodes[node].lock();
                    locked.alien[remote] = Some(alien);
                }
            }

            if locked.next_reap <= now_tick {
                locked.next_reap = now_tick + self.tuning.reap_interval_ticks;

                if locked.shared.is_some() {
                    let touched = locked.shared.as_ref().expect("checked Some above").touched;
                    if touched {
                        locked.shared.as_mut().expect("checked Some above").touched = false;
                    } else {
                        let n = locked.shared.as_ref().expect("checked Some above").available() / 5;
                        if n > 0 {
                            let mut taken = locked.shared.take().expect("checked Some above");
                            drop(locked);
                            self.free_block(node, &mut taken, n);
                            locked = self.nodes[node].lock();
                            locked.shared = Some(taken);
                        }
                    }
                }

                if !locked.free_touched {
                    let limit = locked.free_limit;
                    let num = self.geometry.num.max(1) as usize;
                    let free_slabs = locked.free.len();
                    let excess = free_slabs.saturating_sub(limit / num);
                    let to_release = excess.div_ceil(5);
                    if to_release > 0 {
                        log::trace!(
                            "[SLAB] \"{}\": reap trimming up to {to_release} free slab(s) on node {node}",
                            self.name
                        );
                    }
                    for _ in 0..to_release {
                        let Some(slab) = locked.free.pop_front() else { break };
                        locked.free_objects -= self.geometry.num as usize;
                        drop(locked);
                        // SAFETY: `slab` was just unlinked.
                        unsafe { self.release_slab(slab) };
                        locked = self.nodes[node].lock();
                    }
                } else {
                    locked.free_touched = false;
                }
            }
        }
    }

    /// Release every empty slab this cache is holding back to the page
    /// source. Returns `true` if any pages were released.
    pub fn shrink(&self) -> bool {
        let mut released_any = false;
        for node in 0..MAX_NODES {
            loop {
                let mut locked = self.nodes[node].lock();
                let Some(slab) = locked.free.pop_front() else { break };
                locked.free_objects -= self.geometry.num as usize;
                drop(locked);
                // SAFETY: `slab` was just unlinked.
                unsafe { self.release_slab(slab) };
                released_any = true;
            }
        }
        released_any
    }
}

fn slab_list_of(state: SlabState) -> SlabList {
    match state {
        SlabState::Full => SlabList::Full,
        SlabState::Partial => SlabList::Partial,
        SlabState::Free => SlabList::Free,
    }
}

fn page_of(obj: NonNull<u8>) -> NonNull<u8> {
    let mask = !(geometry::PAGE_SIZE - 1);
    let page = (obj.as_ptr() as usize) & mask;
    // SAFETY: `obj` is non-null, so masking to its containing page is too.
    unsafe { NonNull::new_unchecked(page as *mut u8) }
}

//! The page allocator this subsystem sits on top of.
//!
//! Deliberately a thin trait: the buddy allocator (or equivalent) that
//! backs it is out of scope here — only the interface it must expose is
//! specified. A host implements this once against its real physical-page
//! allocator; tests implement it against a `std`-backed arena.

use core::ptr::NonNull;

use crate::cache::Cache;
use crate::slab::Slab;

/// NUMA node identifier. `NODE_ANY` asks the source to pick for itself.
pub type NodeId = usize;
pub const NODE_ANY: NodeId = usize::MAX;

bitflags::bitflags! {
    /// Allocation-context hints passed down to [`PageSource::get_pages`].
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct PageFlags: u32 {
        /// Caller may block (the call is allowed to sleep/suspend).
        const MAY_SLEEP = 1 << 0;
        /// Pages must come from a DMA-capable zone.
        const DMA       = 1 << 1;
    }
}

/// Required downward interface to the physical page allocator.
///
/// # Safety
/// Implementations must hand back pages that are not aliased by any other
/// live allocation, and `page_to_slab` must agree with the most recent
/// `set_page_slab` call for every page in `get_pages`'s returned range.
pub unsafe trait PageSource {
    /// Supply `2^order` contiguous pages, preferably from `node`. May block
    /// if `flags` allows it. Returns `None` on exhaustion.
    fn get_pages(&self, order: u32, node: NodeId, flags: PageFlags) -> Option<NonNull<u8>>;

    /// Return a previously obtained `2^order`-page run.
    ///
    /// # Safety
    /// `page_addr` must be a value previously returned by `get_pages` with
    /// the same `order`, not yet freed.
    unsafe fn free_pages(&self, page_addr: NonNull<u8>, order: u32);

    /// Reverse-map a page address to the `(cache, slab)` that owns it, if
    /// any. Used by the free hot path to find which slab an object belongs
    /// to without threading that information through every pointer.
    fn page_to_slab(&self, addr: NonNull<u8>) -> Option<(NonNull<Cache>, NonNull<Slab>)>;

    /// Record that `addr`'s page belongs to `(cache, slab)`. Called once per
    /// page during [`crate::slab::carve`].
    fn set_page_slab(&self, addr: NonNull<u8>, cache: NonNull<Cache>, slab: NonNull<Slab>);

    /// Schedule `cb` to run once no reader can still be observing
    /// RCU-protected data carved from a `DESTROY_BY_RCU` cache. Only
    /// required if such caches are used; a source with no RCU-destroy
    /// caches may implement this by calling `cb` immediately.
    fn rcu_call(&self, cb: &mut dyn FnMut());

    /// Which NUMA node `addr` physically belongs to, used after an
    /// unrestricted-node grow to file the new slab under the right node.
    fn addr_to_node(&self, addr: NonNull<u8>) -> NodeId;
}

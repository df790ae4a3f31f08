//! Creation-time flags for a [`crate::cache::Cache`].

use bitflags::bitflags;

bitflags! {
    /// Composable bitmask passed to [`crate::cache::Cache::create`].
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct CacheFlags: u32 {
        /// Bump alignment to the hardware cache-line size.
        const HWCACHE_ALIGN   = 1 << 0;
        /// Pages must come from a DMA-capable zone.
        const DMA             = 1 << 1;
        /// Pages count against the reclaimable pool; relaxes the
        /// fragmentation test in the geometry planner.
        const RECLAIM_ACCOUNT = 1 << 2;
        /// Page release is deferred through an RCU-equivalent quiescence
        /// barrier instead of happening synchronously.
        const DESTROY_BY_RCU  = 1 << 3;
        /// Abort instead of returning `None`/`Err` on creation failure.
        const PANIC_ON_FAIL   = 1 << 4;
        /// Debug-only: pad each object with a canary before/after it.
        const RED_ZONE        = 1 << 5;
        /// Debug-only: stamp the caller's return address into freed objects.
        const STORE_USER      = 1 << 6;
        /// Debug-only: fill freed objects with a poison byte pattern.
        const POISON          = 1 << 7;
    }
}

impl CacheFlags {
    /// Flags that only have meaning when the `debug-slab` feature is on.
    pub const DEBUG_ONLY: CacheFlags =
        CacheFlags::RED_ZONE.union(CacheFlags::STORE_USER).union(CacheFlags::POISON);

    pub fn reclaimable(self) -> bool {
        self.contains(CacheFlags::RECLAIM_ACCOUNT)
    }

    pub fn rcu_destroy(self) -> bool {
        self.contains(CacheFlags::DESTROY_BY_RCU)
    }
}

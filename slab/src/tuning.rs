//! Per-cache tunables analogous to what some allocators derive from `/proc`
//! knobs or boot parameters. This crate has no config file or CLI; callers
//! that want non-default behavior pass a [`CacheTuning`] to
//! [`crate::cache::Cache::create`] instead.

/// Knobs governing magazine sizes, the node free-list cap, and reap
/// cadence for one cache. `CacheTuning::for_object_size` picks the same
/// kind of size-tiered defaults `mm/slab.c` computes internally.
#[derive(Clone, Copy, Debug)]
pub struct CacheTuning {
    /// Capacity of each per-CPU magazine.
    pub cpu_magazine_capacity: u16,
    /// Objects moved per refill/flush.
    pub cpu_batch_count: u16,
    /// Capacity of the per-node shared magazine. Should stay smaller than
    /// the sum of per-CPU magazine capacities so it amortizes refill/flush
    /// traffic rather than becoming the dominant pool itself.
    pub shared_magazine_capacity: u16,
    /// Free objects a node may retain on its `free` list before slabs
    /// start being released back to the page source.
    pub free_limit_objects: usize,
    /// Reap interval, expressed as a tick count since this crate has no
    /// notion of wall time; the host maps ticks to its own timer.
    pub reap_interval_ticks: u64,
}

impl CacheTuning {
    /// Size-tiered defaults, loosely following the brackets `mm/slab.c`
    /// uses when picking its array cache `limit`/`batchcount`: smaller
    /// objects get bigger magazines since more of them fit in the same
    /// cache footprint.
    pub fn for_object_size(object_size: u32) -> Self {
        let cpu_magazine_capacity: u16 = if object_size >= 131_072 {
            1
        } else if object_size >= 32_768 {
            8
        } else if object_size >= 4096 {
            24
        } else if object_size >= 1024 {
            54
        } else if object_size >= 256 {
            120
        } else {
            252
        };
        Self {
            cpu_magazine_capacity,
            cpu_batch_count: (cpu_magazine_capacity / 2).max(1),
            shared_magazine_capacity: cpu_magazine_capacity.saturating_mul(2),
            free_limit_objects: 64,
            reap_interval_ticks: 200,
        }
    }
}

impl Default for CacheTuning {
    fn default() -> Self {
        Self::for_object_size(64)
    }
}

//! Per-CPU storage without dynamic dispatch.
//!
//! The allocator hot path needs one `T` per possible CPU, indexed by
//! `smp_processor_id()`-equivalent, accessed without a lock because only the
//! owning CPU ever touches its own slot. [`NoPreemptGuard`] is the proof
//! that condition holds; [`PerCpu::get`] will not compile-time-forbid a
//! sneaky second access, but every call site in this workspace is built to
//! require a guard, so the lock-free access is auditable at each call site.

use crate::guard::NoPreemptGuard;
use core::cell::UnsafeCell;

/// One `T` per CPU. `N` is an upper bound on the number of CPUs the host
/// will ever report via [`crate::guard::max_cpus`]; indices beyond the
/// host's actual CPU count are simply never touched.
pub struct PerCpu<T, const N: usize> {
    slots: [UnsafeCell<T>; N],
}

// SAFETY: access to a given slot is only ever performed by the CPU that
// owns it, and only while that CPU holds a `NoPreemptGuard` proving it
// cannot be preempted mid-access. Cross-CPU access never happens in this
// workspace's call sites.
unsafe impl<T: Send, const N: usize> Sync for PerCpu<T, N> {}

impl<T, const N: usize> PerCpu<T, N> {
    /// Build a per-CPU array from a constructor invoked once per slot.
    pub fn new(mut make: impl FnMut(usize) -> T) -> Self {
        Self {
            slots: core::array::from_fn(|i| UnsafeCell::new(make(i))),
        }
    }

    /// Borrow the slot for the CPU the guard was taken on.
    ///
    /// The guard proves preemption is disabled on this CPU, so no other
    /// task can interleave a conflicting access to the same slot for as
    /// long as the returned reference is live.
    #[inline]
    pub fn get<'g>(&self, guard: &'g NoPreemptGuard) -> &'g mut T {
        let idx = guard.cpu_id();
        debug_assert!(idx < N, "cpu index out of range for PerCpu storage");
        // SAFETY: `idx` is this CPU's own slot, and `guard` proves this CPU
        // cannot be preempted for the lifetime `'g`, so no concurrent
        // access to `slots[idx]` can happen while this reference is live.
        unsafe { &mut *self.slots[idx].get() }
    }

    /// Borrow an arbitrary CPU's slot. Used by the reaper and by cross-CPU
    /// diagnostics, which run with the owning node's list lock held rather
    /// than a per-CPU guard — callers must not alias this with a concurrent
    /// `get` on the same index from the owning CPU.
    ///
    /// # Safety
    /// The caller must ensure no other reference (mutable or not) to
    /// `slots[cpu]` is live for the duration of the returned reference.
    #[inline]
    pub unsafe fn get_unchecked(&self, cpu: usize) -> &mut T {
        debug_assert!(cpu < N);
        // SAFETY: forwarded to the caller's contract above.
        unsafe { &mut *self.slots[cpu].get() }
    }

    /// Number of slots.
    pub const fn len(&self) -> usize {
        N
    }
}

//! Small backing allocations the allocator needs for itself: per-CPU/shared
//! magazine pointer arrays, and off-slab slab metadata.
//!
//! A general-purpose variable-size allocator is out of scope for this
//! crate, so these bootstrap-phase allocations are satisfied through
//! `alloc`'s global allocator rather than by standing up a second,
//! self-hosting kmalloc inside this crate. See DESIGN.md for the
//! rationale. Only used during `Cache::create` and `Cache::destroy` —
//! never on the alloc/free hot path.

extern crate alloc;

use alloc::alloc::{alloc as raw_alloc, dealloc as raw_dealloc, Layout};
use core::ptr::NonNull;

/// Allocate `n` elements of `T`, zero-initialized is not guaranteed.
///
/// # Safety
/// The returned pointer must be freed with [`free_array`] using the same
/// `n`, and not used past that free.
pub unsafe fn alloc_array<T>(n: usize) -> Option<NonNull<T>> {
    if n == 0 {
        return NonNull::new(core::mem::align_of::<T>() as *mut T);
    }
    let layout = Layout::array::<T>(n).ok()?;
    // SAFETY: layout has non-zero size since n > 0.
    let ptr = unsafe { raw_alloc(layout) };
    NonNull::new(ptr as *mut T)
}

/// Free memory obtained from [`alloc_array`] with the same `n`.
///
/// # Safety
/// `ptr`/`n` must match a prior `alloc_array::<T>(n)` call whose result has
/// not already been freed.
pub unsafe fn free_array<T>(ptr: NonNull<T>, n: usize) {
    if n == 0 {
        return;
    }
    if let Ok(layout) = Layout::array::<T>(n) {
        // SAFETY: caller guarantees `ptr` was allocated with this exact
        // layout via `alloc_array` and has not been freed yet.
        unsafe { raw_dealloc(ptr.as_ptr() as *mut u8, layout) };
    }
}

/// Allocate space for one `T`, uninitialized.
///
/// # Safety
/// Must be freed with [`free_one`].
pub unsafe fn alloc_one<T>() -> Option<NonNull<T>> {
    let layout = Layout::new::<T>();
    // SAFETY: `T` always has a valid (possibly zero-size) layout.
    let ptr = unsafe { raw_alloc(layout) };
    NonNull::new(ptr as *mut T)
}

/// # Safety
/// `ptr` must have come from [`alloc_one::<T>`] and not already be freed.
pub unsafe fn free_one<T>(ptr: NonNull<T>) {
    let layout = Layout::new::<T>();
    // SAFETY: forwarded from caller's contract.
    unsafe { raw_dealloc(ptr.as_ptr() as *mut u8, layout) };
}

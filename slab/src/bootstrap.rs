//! The phased startup that breaks the "caches need caches to exist" cycle.
//!
//! `NONE -> PARTIAL_MAG -> PARTIAL_LIST -> FULL`, monotonic forward only.
//! While below `FULL`, off-slab layout is forbidden and using a
//! not-yet-ready general cache is a [`crate::error::Error::BootstrapViolation`].

use core::ptr::NonNull;
use core::sync::atomic::{AtomicU8, Ordering};

use spin::Once;

use crate::cache::Cache;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum BootstrapPhase {
    /// No dynamic allocation is possible yet; only the statically reserved
    /// meta-cache and static magazines exist.
    None = 0,
    /// The magazine-sized general cache is usable.
    PartialMag = 1,
    /// The node-lists-sized general cache is usable too.
    PartialList = 2,
    /// Every static magazine/node-list has been replaced by a dynamically
    /// allocated equivalent; off-slab layout is now permitted.
    Full = 3,
}

impl BootstrapPhase {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::None,
            1 => Self::PartialMag,
            2 => Self::PartialList,
            _ => Self::Full,
        }
    }
}

static PHASE: AtomicU8 = AtomicU8::new(BootstrapPhase::None as u8);

pub fn phase() -> BootstrapPhase {
    BootstrapPhase::from_u8(PHASE.load(Ordering::Acquire))
}

/// Advance to `next`. Panics if `next` is not strictly later than the
/// current phase — the state machine is monotonic forward only, so going
/// backward or re-entering a phase is a programming error.
pub fn advance_to(next: BootstrapPhase) {
    let current = phase();
    assert!(
        next as u8 > current as u8,
        "bootstrap phase must advance monotonically (was {:?}, asked for {:?})",
        current,
        next
    );
    PHASE.store(next as u8, Ordering::Release);
}

/// `true` once dynamic allocation (including off-slab layout) is fully
/// available.
pub fn is_full() -> bool {
    phase() == BootstrapPhase::Full
}

/// Reset the phase to `None`. Only for test harnesses that construct more
/// than one independent allocator "universe" in the same process. Does
/// not reset [`set_meta_cache`]'s value — `spin::Once` has no unset, so a
/// test harness that needs a second bootstrap sequence from scratch
/// should use a fresh `META_CACHE`-equivalent via a separate process or
/// accept that the meta cache is shared across "universes".
#[cfg(any(test, feature = "std"))]
pub fn reset_for_test() {
    PHASE.store(BootstrapPhase::None as u8, Ordering::Release);
}

// SAFETY: `NonNull<Cache>` is not `Send`/`Sync` by default, but the cache
// it points at synchronizes its own internals; the cell is only ever
// written once, during early boot, and read afterward.
struct MetaCacheCell(core::cell::Cell<Option<NonNull<Cache>>>);
unsafe impl Sync for MetaCacheCell {}

static META_CACHE: Once<MetaCacheCell> = Once::new();

/// Record the general cache that supplies off-slab slab metadata, once
/// bootstrap has produced one. Call exactly once, before advancing past
/// [`BootstrapPhase::PartialList`].
pub fn set_meta_cache(cache: NonNull<Cache>) {
    META_CACHE.call_once(|| MetaCacheCell(core::cell::Cell::new(Some(cache))));
}

/// The cache backing off-slab slab metadata.
///
/// # Panics
/// If [`set_meta_cache`] has not been called yet.
pub fn meta_cache() -> NonNull<Cache> {
    META_CACHE
        .get()
        .and_then(|c| c.0.get())
        .expect("meta cache requested before bootstrap installed one")
}

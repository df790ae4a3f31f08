//! The global registry of live caches: a mutex-protected intrusive list
//! used to create/destroy caches and to look up a general-purpose cache by
//! size class, the way a host-facing `kmalloc`-style entry point needs to.

use core::ptr::NonNull;

use slab_utils::Mutex;

use crate::bootstrap;
use crate::cache::{Cache, Constructor};
use crate::error::Error;
use crate::flags::CacheFlags;
use crate::intrusive_list::IntrusiveList;
use crate::page_source::PageSource;
use crate::tuning::CacheTuning;

static CHAIN: Mutex<IntrusiveList<Cache>> = Mutex::new(IntrusiveList::new());

/// Link a freshly created cache into the global chain.
pub(crate) fn register(cache: NonNull<Cache>) {
    let mut chain = CHAIN.lock();
    // SAFETY: `cache` is a fresh descriptor not linked into any list.
    unsafe { chain.push_front(cache) };
}

/// Unlink a cache that is about to be freed.
///
/// # Safety
/// `cache` must currently be a member of the chain.
pub(crate) unsafe fn unregister(cache: NonNull<Cache>) {
    let mut chain = CHAIN.lock();
    // SAFETY: forwarded from caller's contract.
    unsafe { chain.remove(cache) };
}

/// Iterate every live cache, calling `f` with the node lock *not* held.
/// Used by the reaper to sweep the whole chain each tick.
pub(crate) fn for_each(mut f: impl FnMut(&Cache)) {
    let chain = CHAIN.lock();
    for cache in chain.iter() {
        // SAFETY: every member of the chain is a live `Cache` for as long
        // as the chain lock is held (destroy unregisters before freeing).
        f(unsafe { cache.as_ref() });
    }
}

/// One bracket of the general-purpose size-class ladder.
struct SizeClass {
    bytes: u32,
    cache: Mutex<Option<NonNull<Cache>>>,
}

// SAFETY: the only access to `cache` goes through the `Mutex`; the `Cache`
// it eventually points at synchronizes its own internals.
unsafe impl Sync for SizeClass {}

/// Powers-of-two-ish buckets from 32 bytes to 64 KiB, the same rough ladder
/// a general-purpose `kmalloc` front end sits on top of a slab allocator
/// with.
const SIZE_CLASS_BYTES: [u32; 12] = [32, 64, 128, 256, 512, 1024, 2048, 4096, 8192, 16384, 32768, 65536];

static SIZE_CLASSES: [SizeClass; 12] = [
    SizeClass { bytes: SIZE_CLASS_BYTES[0], cache: Mutex::new(None) },
    SizeClass { bytes: SIZE_CLASS_BYTES[1], cache: Mutex::new(None) },
    SizeClass { bytes: SIZE_CLASS_BYTES[2], cache: Mutex::new(None) },
    SizeClass { bytes: SIZE_CLASS_BYTES[3], cache: Mutex::new(None) },
    SizeClass { bytes: SIZE_CLASS_BYTES[4], cache: Mutex::new(None) },
    SizeClass { bytes: SIZE_CLASS_BYTES[5], cache: Mutex::new(None) },
    SizeClass { bytes: SIZE_CLASS_BYTES[6], cache: Mutex::new(None) },
    SizeClass { bytes: SIZE_CLASS_BYTES[7], cache: Mutex::new(None) },
    SizeClass { bytes: SIZE_CLASS_BYTES[8], cache: Mutex::new(None) },
    SizeClass { bytes: SIZE_CLASS_BYTES[9], cache: Mutex::new(None) },
    SizeClass { bytes: SIZE_CLASS_BYTES[10], cache: Mutex::new(None) },
    SizeClass { bytes: SIZE_CLASS_BYTES[11], cache: Mutex::new(None) },
];

/// Find (creating lazily, on first use) the general-purpose cache whose
/// object size is the smallest bracket `>= size`, honoring `flags` (e.g.
/// `DMA`). Used by a host's `kmalloc`-equivalent front end; callers that
/// want a dedicated, typed cache should call [`Cache::create`] directly
/// instead.
pub fn size_class_lookup(
    size: usize,
    flags: CacheFlags,
    page_source: &'static dyn PageSource,
) -> Result<NonNull<Cache>, Error> {
    let class = SIZE_CLASSES
        .iter()
        .find(|c| c.bytes as usize >= size)
        .ok_or(Error::InvalidArgument)?;

    let mut slot = class.cache.lock();
    if let Some(cache) = *slot {
        return Ok(cache);
    }

    let backing = if bootstrap::is_full() {
        Some(bootstrap::meta_cache())
    } else {
        None
    };
    let name: &'static str = size_class_name(class.bytes);
    let created = Cache::create(
        name,
        class.bytes,
        1,
        flags,
        None as Option<Constructor>,
        CacheTuning::for_object_size(class.bytes),
        page_source,
        backing,
    )?;
    *slot = Some(created);
    Ok(created)
}

fn size_class_name(bytes: u32) -> &'static str {
    match bytes {
        32 => "size-32",
        64 => "size-64",
        128 => "size-128",
        256 => "size-256",
        512 => "size-512",
        1024 => "size-1024",
        2048 => "size-2048",
        4096 => "size-4096",
        8192 => "size-8192",
        16384 => "size-16384",
        32768 => "size-32768",
        _ => "size-65536",
    }
}

//! Error taxonomy.
//!
//! `InvalidArgument`, `OutOfMemory` and `CacheNotEmpty` are ordinary,
//! recoverable failures a caller is expected to handle. `BootstrapViolation`
//! and `CorruptionDetected` are programming errors treated as fatal, so the
//! operations that can hit them assert/panic rather than returning this
//! enum — it exists for them mainly so the diagnostic message has a stable
//! name to print.

use core::fmt;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Error {
    /// The page allocator returned nothing while growing a cache.
    OutOfMemory,
    /// Zero/oversize object, forbidden calling context, or unknown flags.
    InvalidArgument,
    /// `destroy_cache` was called with a slab still in `partial` or `full`.
    CacheNotEmpty,
    /// Off-slab layout or dynamic allocation attempted before the
    /// bootstrap state machine reached the required phase.
    BootstrapViolation,
    /// Freelist loop, double-free, or redzone mismatch detected.
    CorruptionDetected,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            Error::OutOfMemory => "page allocator exhausted while growing cache",
            Error::InvalidArgument => "invalid cache creation argument",
            Error::CacheNotEmpty => "destroy_cache called on a non-empty cache",
            Error::BootstrapViolation => "slab bootstrap invariant violated",
            Error::CorruptionDetected => "slab freelist or redzone corruption detected",
        };
        f.write_str(msg)
    }
}

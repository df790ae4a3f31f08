//! The periodic sweep that drains idle per-CPU/shared magazines and
//! releases excess free slabs across every registered cache.
//!
//! This module has no timer or thread of its own — it is no_std and has
//! no notion of wall-clock time. A host calls [`run_once`] from its own
//! periodic tick (a timer interrupt, a kernel worker thread, or a test
//! loop), passing a monotonically increasing tick counter.

use crate::chain;

/// Sweep every live cache once. `now_tick` is the host's tick counter;
/// each cache's `next_reap` (per node) is compared against it to decide
/// whether that node's shared magazine / free list is due for a trim this
/// call, independent of per-CPU magazine draining (which happens every
/// call, since there is no per-CPU deadline — only a "touched" flag).
pub fn run_once(now_tick: u64) {
    chain::for_each(|cache| cache.reap(now_tick));
}

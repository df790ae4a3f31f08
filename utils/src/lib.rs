#![cfg_attr(not(feature = "std"), no_std)]

//! Shared primitives for the allocator crates in this workspace.
//!
//! Re-exports `spin`'s lock types under a stable local name so the rest of
//! the workspace depends on this crate rather than on `spin` directly, and
//! adds the per-CPU / no-preempt-guard primitives that the slab cache's hot
//! path is built on.

pub mod guard;
pub mod percpu;

pub use spin::{Lazy, Once};
pub use spin::{Mutex, MutexGuard};
pub use spin::{RwLock, RwLockReadGuard, RwLockWriteGuard};

pub use guard::{preempt_disabled, NoPreemptGuard};
pub use percpu::PerCpu;

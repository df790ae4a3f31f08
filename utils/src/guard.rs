//! Scoped proof that preemption (and local interrupts) are disabled on the
//! calling CPU.
//!
//! Real preemption/interrupt control is host-specific hardware state (on
//! aarch64 this is `msr daifset`, on x86_64 `cli`/`popf`, in a hosted test
//! build it is nothing at all) — this crate only consumes it, the same way
//! the rest of the allocator only consumes a `PageSource`. The host installs
//! an implementation of [`PreemptControl`] once at boot; [`NoPreemptGuard`]
//! is the RAII token that makes "I am running with preemption disabled" a
//! type-level fact instead of a convention.

use core::marker::PhantomData;
use spin::Once;

/// Hook into the host's scheduler/interrupt controller.
///
/// `disable` must be re-entrant: nested guards are legal and only the
/// outermost one observably restores the prior state.
pub trait PreemptControl: Sync {
    /// Disable preemption (and, if the host conflates the two, local
    /// interrupts) on the calling CPU. Returns an opaque token describing
    /// the state to restore.
    fn disable(&self) -> usize;
    /// Undo a prior `disable`, restoring the state it returned.
    fn restore(&self, state: usize);
    /// The logical index (0-based) of the CPU currently executing.
    fn current_cpu(&self) -> usize;
    /// Upper bound on `current_cpu()` across the system's lifetime.
    fn max_cpus(&self) -> usize;
}

static HOST: Once<&'static dyn PreemptControl> = Once::new();

/// Single-CPU stand-in used until a host installs a real [`PreemptControl`]
/// (and by hosted unit tests, which never run concurrently with themselves).
struct SingleCpu;

impl PreemptControl for SingleCpu {
    fn disable(&self) -> usize {
        0
    }
    fn restore(&self, _state: usize) {}
    fn current_cpu(&self) -> usize {
        0
    }
    fn max_cpus(&self) -> usize {
        1
    }
}

static SINGLE_CPU: SingleCpu = SingleCpu;

/// Install the host's preemption/interrupt controller. Calling this more
/// than once is a no-op after the first call (matches `spin::Once`'s
/// semantics) — the host is expected to call it exactly once at boot,
/// before any `PerCpu<T>` is touched.
pub fn install(host: &'static dyn PreemptControl) {
    HOST.call_once(|| host);
}

fn host() -> &'static dyn PreemptControl {
    *HOST.call_once(|| &SINGLE_CPU)
}

/// Number of CPUs the allocator should size its per-CPU arrays for.
pub fn max_cpus() -> usize {
    host().max_cpus()
}

/// RAII proof that preemption is disabled on the calling CPU for the
/// lifetime of the guard. `PerCpu::get` requires one of these rather than
/// taking a lock: the guard itself is the evidence that no other task can
/// run on this CPU and race the access.
pub struct NoPreemptGuard {
    state: usize,
    // Not Send/Sync: a guard only makes sense pinned to the CPU that created it.
    _not_send: PhantomData<*const ()>,
}

impl NoPreemptGuard {
    /// The CPU this guard was taken on. Stable for the guard's lifetime.
    pub fn cpu_id(&self) -> usize {
        host().current_cpu()
    }
}

impl Drop for NoPreemptGuard {
    fn drop(&mut self) {
        host().restore(self.state);
    }
}

/// Disable preemption on the calling CPU and return the proof token. Nested
/// calls are safe; each `Drop` restores only what its own `disable` changed.
pub fn preempt_disabled() -> NoPreemptGuard {
    NoPreemptGuard {
        state: host().disable(),
        _not_send: PhantomData,
    }
}

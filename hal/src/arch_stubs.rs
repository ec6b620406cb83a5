//! # Architecture Stubs
//!
//! Fallback implementations used until an architecture crate provides the
//! real ones.

use crate::cpu::{CpuId, CpuTopology};
use core::sync::atomic::{AtomicUsize, Ordering};

/// Architecture name constant
pub const ARCH_NAME: &str = {
    #[cfg(target_arch = "x86_64")]
    { "x86_64" }
    #[cfg(target_arch = "aarch64")]
    { "aarch64" }
    #[cfg(target_arch = "riscv64")]
    { "riscv64" }
    #[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64", target_arch = "riscv64")))]
    { "unknown" }
};

/// Single-core topology
///
/// Always reports CPU 0. Tracks the preemption nesting depth so unbalanced
/// enable calls are caught.
///
/// A sleep-lock waiter gives up the processor through the scheduler hook
/// passed to [`with_scheduler`](Self::with_scheduler). Without one,
/// [`relax`](CpuTopology::relax) only issues a spin hint, which is valid
/// as long as no sleep lock is ever contended (a single context of
/// execution, as during early boot).
#[derive(Debug, Default)]
pub struct UniprocessorCpu {
    depth: AtomicUsize,
    yield_now: Option<fn()>,
}

impl UniprocessorCpu {
    /// Create a new stub CPU with no scheduler
    pub const fn new() -> Self {
        Self {
            depth: AtomicUsize::new(0),
            yield_now: None,
        }
    }

    /// Create a stub CPU whose waiters call `yield_now` to switch away
    pub const fn with_scheduler(yield_now: fn()) -> Self {
        Self {
            depth: AtomicUsize::new(0),
            yield_now: Some(yield_now),
        }
    }

    /// Current preemption-disable nesting depth
    pub fn preempt_depth(&self) -> usize {
        self.depth.load(Ordering::Relaxed)
    }
}

impl CpuTopology for UniprocessorCpu {
    fn current_cpu_id(&self) -> CpuId {
        0
    }

    fn cpu_count(&self) -> usize {
        1
    }

    fn preempt_disable(&self) {
        self.depth.fetch_add(1, Ordering::Relaxed);
    }

    fn preempt_enable(&self) {
        let prev = self.depth.fetch_sub(1, Ordering::Relaxed);
        if prev == 0 {
            panic!("pop_off: preemption not disabled");
        }
    }

    fn relax(&self) {
        match self.yield_now {
            Some(yield_now) => yield_now(),
            None => core::hint::spin_loop(),
        }
    }
}

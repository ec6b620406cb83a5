//! # Hosted CPU Topology
//!
//! Runs the resource core on OS threads: each thread claims a simulated
//! core with [`ThreadCpus::bind`], and contended sleep locks yield to the
//! host scheduler.

use crate::cpu::{CpuId, CpuTopology};
use std::cell::Cell;

std::thread_local! {
    static CURRENT_CPU: Cell<CpuId> = const { Cell::new(0) };
    static PREEMPT_DEPTH: Cell<usize> = const { Cell::new(0) };
}

/// Thread-backed CPU topology
#[derive(Debug, Clone)]
pub struct ThreadCpus {
    count: usize,
}

impl ThreadCpus {
    /// Create a topology with `count` simulated cores
    pub fn new(count: usize) -> Self {
        assert!(count > 0, "ThreadCpus: need at least one core");
        Self { count }
    }

    /// Make the calling thread run as core `id`
    pub fn bind(id: CpuId) {
        CURRENT_CPU.with(|cpu| cpu.set(id));
    }

    /// Preemption-disable depth of the calling thread
    pub fn preempt_depth() -> usize {
        PREEMPT_DEPTH.with(Cell::get)
    }
}

impl CpuTopology for ThreadCpus {
    fn current_cpu_id(&self) -> CpuId {
        let id = CURRENT_CPU.with(Cell::get);
        assert!(id < self.count, "cpu {} out of range ({} cores)", id, self.count);
        id
    }

    fn cpu_count(&self) -> usize {
        self.count
    }

    fn preempt_disable(&self) {
        PREEMPT_DEPTH.with(|depth| depth.set(depth.get() + 1));
    }

    fn preempt_enable(&self) {
        PREEMPT_DEPTH.with(|depth| {
            let current = depth.get();
            assert!(current > 0, "pop_off: preemption not disabled");
            depth.set(current - 1);
        });
    }

    fn relax(&self) {
        std::thread::yield_now();
    }
}

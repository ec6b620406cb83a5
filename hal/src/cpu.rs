//! # CPU Abstraction
//!
//! Per-core identification and preemption control.
//!
//! Per-core data (such as per-CPU free lists) may only be touched by its
//! owning core, so callers pin themselves with a [`PreemptGuard`] before
//! reading [`CpuTopology::current_cpu_id`] and keep the guard alive for as
//! long as they use the id.

use core::fmt;

/// Index of an execution core, `0..cpu_count()`
pub type CpuId = usize;

/// CPU topology trait
///
/// Supplied by the kernel at boot. All methods must be callable from any
/// core, concurrently.
pub trait CpuTopology: Send + Sync {
    /// Get the current CPU ID
    ///
    /// Only stable while preemption is disabled.
    fn current_cpu_id(&self) -> CpuId;

    /// Get the number of CPUs available
    fn cpu_count(&self) -> usize;

    /// Disable preemption on the current core (nests)
    fn preempt_disable(&self);

    /// Re-enable preemption on the current core (nests)
    fn preempt_enable(&self);

    /// Give up the processor while waiting on a contended sleep lock
    fn relax(&self);
}

/// RAII preemption guard
///
/// Disables preemption on creation and captures the current CPU id,
/// re-enables preemption on drop.
pub struct PreemptGuard<'a> {
    cpu: &'a dyn CpuTopology,
    id: CpuId,
}

impl<'a> PreemptGuard<'a> {
    /// Disable preemption and pin to the current core
    pub fn new(cpu: &'a dyn CpuTopology) -> Self {
        cpu.preempt_disable();
        let id = cpu.current_cpu_id();
        Self { cpu, id }
    }

    /// The core this guard pinned
    #[inline]
    pub fn cpu_id(&self) -> CpuId {
        self.id
    }
}

impl Drop for PreemptGuard<'_> {
    fn drop(&mut self) {
        self.cpu.preempt_enable();
    }
}

impl fmt::Debug for PreemptGuard<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PreemptGuard").field("cpu", &self.id).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch_stubs::UniprocessorCpu;

    #[test]
    fn test_preempt_guard_nesting() {
        let cpu = UniprocessorCpu::new();
        {
            let outer = PreemptGuard::new(&cpu);
            assert_eq!(outer.cpu_id(), 0);
            assert_eq!(cpu.preempt_depth(), 1);
            {
                let _inner = PreemptGuard::new(&cpu);
                assert_eq!(cpu.preempt_depth(), 2);
            }
            assert_eq!(cpu.preempt_depth(), 1);
        }
        assert_eq!(cpu.preempt_depth(), 0);
    }
}

//! # Per-CPU Free Lists
//!
//! One free list per core, each behind its own spin lock. A core allocates
//! from its own list and, when that is empty, takes a single frame from the
//! next non-empty list in rotation. Frees always go to the freeing core's
//! list, wherever the frame came from, so list lengths drift apart under
//! cross-core traffic. Nothing rebalances them.
//!
//! At most one list lock is held at any time: the local lock is dropped
//! before the first remote lock is taken.
//!
//! Each list is a [`FreeList`], linked through the free frames themselves,
//! so adding cores adds one head per core and nothing per frame.

use super::freelist::FreeList;
use super::{AllocatorBackend, FramePool};
use crate::param::MAX_CPUS;
use crate::FrameNumber;
use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, Ordering};
use kestrel_hal::cpu::{CpuId, CpuTopology, PreemptGuard};
use spin::Mutex;

/// Free lists partitioned by core
pub struct PerCpuFreeLists {
    /// One list per core, indexed by CPU id
    lists: Box<[Mutex<FreeList>]>,
    /// Frames managed in total (seeding split)
    capacity: usize,
    /// Core identification and preemption control
    cpu: Arc<dyn CpuTopology>,
    /// Frames taken from a remote list
    steals: AtomicU64,
}

impl PerCpuFreeLists {
    /// Create one empty list per core for a pool of `capacity` frames
    pub fn new(capacity: usize, cpu: Arc<dyn CpuTopology>) -> Self {
        let cores = cpu.cpu_count();
        assert!(
            (1..=MAX_CPUS).contains(&cores),
            "kinit: {} cores, expected 1..={}",
            cores,
            MAX_CPUS
        );

        let lists = (0..cores)
            .map(|_| Mutex::new(FreeList::new()))
            .collect();

        Self {
            lists,
            capacity,
            cpu,
            steals: AtomicU64::new(0),
        }
    }

    /// Free frames on `cpu`'s list
    pub fn free_frames_on(&self, cpu: CpuId) -> usize {
        self.lists[cpu].lock().len()
    }

    /// Number of lists
    pub fn cpu_count(&self) -> usize {
        self.lists.len()
    }

    fn steal(&self, pool: &FramePool, thief: CpuId) -> Option<FrameNumber> {
        let cores = self.lists.len();
        for step in 1..cores {
            let victim = (thief + step) % cores;
            let frame = self.lists[victim].lock().pop(pool);
            if let Some(frame) = frame {
                self.steals.fetch_add(1, Ordering::Relaxed);
                log::debug!(
                    "cpu {} took frame {} from cpu {}",
                    thief,
                    frame.index(),
                    victim
                );
                return Some(frame);
            }
        }
        None
    }
}

impl AllocatorBackend for PerCpuFreeLists {
    fn name(&self) -> &'static str {
        "per-cpu free lists"
    }

    /// Split the frames into contiguous, equal runs, one per core.
    unsafe fn seed(&self, pool: &FramePool, frames: &mut dyn Iterator<Item = FrameNumber>) {
        let cores = self.lists.len();
        let run = self.capacity.div_ceil(cores).max(1);
        for (i, frame) in frames.enumerate() {
            // SAFETY: seeded frames are unused and handed over once.
            unsafe { self.lists[(i / run).min(cores - 1)].lock().push(pool, frame) };
        }
    }

    fn pop(&self, pool: &FramePool) -> Option<FrameNumber> {
        let guard = PreemptGuard::new(&*self.cpu);
        let me = guard.cpu_id();

        let local = self.lists[me].lock().pop(pool);
        local.or_else(|| self.steal(pool, me))
    }

    unsafe fn push(&self, pool: &FramePool, frame: FrameNumber) {
        let guard = PreemptGuard::new(&*self.cpu);
        // SAFETY: forwarded from the caller.
        unsafe { self.lists[guard.cpu_id()].lock().push(pool, frame) };
    }

    fn list_lengths(&self) -> Vec<usize> {
        self.lists.iter().map(|list| list.lock().len()).collect()
    }

    fn for_each_free(&self, pool: &FramePool, visit: &mut dyn FnMut(FrameNumber)) {
        for list in self.lists.iter() {
            list.lock().for_each(pool, visit);
        }
    }

    fn steals(&self) -> u64 {
        self.steals.load(Ordering::Relaxed)
    }
}

impl core::fmt::Debug for PerCpuFreeLists {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("PerCpuFreeLists")
            .field("cpus", &self.lists.len())
            .field("steals", &self.steals())
            .finish_non_exhaustive()
    }
}

//! # Page Allocator
//!
//! Allocate and free whole frames of the pool. Every frame is overwritten
//! with [`ALLOC_JUNK`] when handed out and with [`FREE_JUNK`] when returned,
//! so reads of stale or uninitialized memory show up as recognizable
//! garbage. A free frame's first [`LINK_BYTES`] are then taken over by its
//! free-list link.

use super::freelist::SingleFreeList;
use super::percpu::PerCpuFreeLists;
use super::{
    AllocStrategy, AllocatorBackend, AllocatorConfig, AllocatorStats, FramePool, LINK_BYTES,
};
use crate::param::{ALLOC_JUNK, FREE_JUNK};
use crate::Frame;
use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec;
use core::fmt;
use core::sync::atomic::{AtomicU64, Ordering};
use kestrel_hal::cpu::CpuTopology;

/// Accounting inconsistency found by [`PageAllocator::audit`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuditError {
    /// A frame sits on the free lists more than once
    ListedTwice(Frame),
    /// Free plus allocated frames do not add up to the pool size
    Accounting {
        /// Frames on free lists
        free: usize,
        /// Frames the caller holds
        allocated: usize,
        /// Frames in the pool
        total: usize,
    },
}

impl fmt::Display for AuditError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuditError::ListedTwice(frame) => {
                write!(f, "frame {:#x} is on the free lists twice", frame.address())
            }
            AuditError::Accounting {
                free,
                allocated,
                total,
            } => write!(f, "{} free + {} allocated != {} total", free, allocated, total),
        }
    }
}

/// Page allocator
pub struct PageAllocator {
    /// Managed frames
    pool: FramePool,
    /// Free-list strategy
    backend: Box<dyn AllocatorBackend>,
    /// Successful allocations
    allocations: AtomicU64,
    /// Frees
    frees: AtomicU64,
    /// Allocations that found every list empty
    failed: AtomicU64,
}

impl PageAllocator {
    /// Build the backend selected by `config` and hand it every frame
    pub fn new(pool: FramePool, config: &AllocatorConfig, cpu: Arc<dyn CpuTopology>) -> Self {
        let total = pool.total_frames();
        let backend: Box<dyn AllocatorBackend> = match config.strategy {
            AllocStrategy::Single => Box::new(SingleFreeList::new()),
            AllocStrategy::PerCpu => Box::new(PerCpuFreeLists::new(total, cpu)),
        };
        Self::with_backend(pool, backend)
    }

    /// Seed a caller-supplied backend with every frame of `pool`
    pub fn with_backend(pool: FramePool, backend: Box<dyn AllocatorBackend>) -> Self {
        for number in pool.numbers() {
            // SAFETY: nothing references the frames before they are seeded.
            unsafe { pool.fill(number, FREE_JUNK) };
        }
        // SAFETY: every frame of the pool, each once, none in use.
        unsafe { backend.seed(&pool, &mut pool.numbers()) };

        log::info!(
            "kinit: {} frames at {:#x}..{:#x} ({})",
            pool.total_frames(),
            pool.base(),
            pool.end(),
            backend.name()
        );

        Self {
            pool,
            backend,
            allocations: AtomicU64::new(0),
            frees: AtomicU64::new(0),
            failed: AtomicU64::new(0),
        }
    }

    /// Allocate one frame, or `None` when every list is empty
    pub fn allocate(&self) -> Option<Frame> {
        let Some(number) = self.backend.pop(&self.pool) else {
            self.failed.fetch_add(1, Ordering::Relaxed);
            return None;
        };

        // SAFETY: just popped off the free lists, so nobody else holds it.
        unsafe { self.pool.fill(number, ALLOC_JUNK) };
        self.allocations.fetch_add(1, Ordering::Relaxed);
        Some(self.pool.frame(number))
    }

    /// Return a frame to the free lists
    ///
    /// # Panics
    /// If `frame` lies outside the managed range.
    pub fn free(&self, frame: Frame) {
        let number = match self.pool.frame_number(frame) {
            Ok(number) => number,
            Err(_) => panic!("kfree: frame {:#x} out of range", frame.address()),
        };

        // SAFETY: the caller gives up the frame.
        unsafe {
            self.pool.fill(number, FREE_JUNK);
            self.backend.push(&self.pool, number);
        }
        self.frees.fetch_add(1, Ordering::Relaxed);
    }

    /// Frames currently on free lists
    pub fn free_frames(&self) -> usize {
        self.backend.free_frames()
    }

    /// Frames under management
    pub fn total_frames(&self) -> usize {
        self.pool.total_frames()
    }

    /// Get the frame pool
    pub fn pool(&self) -> &FramePool {
        &self.pool
    }

    /// Get the free-list backend
    pub fn backend(&self) -> &dyn AllocatorBackend {
        &*self.backend
    }

    /// Get statistics
    pub fn stats(&self) -> AllocatorStats {
        AllocatorStats {
            allocations: self.allocations.load(Ordering::Relaxed),
            frees: self.frees.load(Ordering::Relaxed),
            failed_allocations: self.failed.load(Ordering::Relaxed),
            steals: self.backend.steals(),
            free_frames: self.free_frames(),
            total_frames: self.total_frames(),
        }
    }

    /// Check the free lists against `allocated` frames held by the caller
    ///
    /// Only meaningful while no other core allocates or frees.
    pub fn audit(&self, allocated: usize) -> Result<(), AuditError> {
        let mut seen = vec![false; self.total_frames()];
        let mut twice = None;
        let mut free = 0;
        self.backend.for_each_free(&self.pool, &mut |number| {
            free += 1;
            if core::mem::replace(&mut seen[number.index()], true) {
                twice.get_or_insert(number);
            }
        });

        if let Some(number) = twice {
            return Err(AuditError::ListedTwice(self.pool.frame(number)));
        }
        let total = self.total_frames();
        if free + allocated != total {
            return Err(AuditError::Accounting {
                free,
                allocated,
                total,
            });
        }
        Ok(())
    }
}

impl fmt::Debug for PageAllocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PageAllocator")
            .field("pool", &self.pool)
            .field("backend", &self.backend.name())
            .field("free", &self.free_frames())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::physical::testing::{pool, RAM_BASE};
    use alloc::vec::Vec;
    use kestrel_hal::hosted::ThreadCpus;
    use kestrel_hal::PhysAddr;

    fn allocator(frames: usize, config: AllocatorConfig) -> PageAllocator {
        PageAllocator::new(pool(frames), &config, Arc::new(ThreadCpus::new(2)))
    }

    fn contents(allocator: &PageAllocator, frame: Frame) -> Vec<u8> {
        unsafe { allocator.pool().bytes(frame).unwrap().to_vec() }
    }

    #[test]
    fn test_junk_patterns() {
        let allocator = allocator(2, AllocatorConfig::single());
        let frame = allocator.allocate().unwrap();
        assert!(contents(&allocator, frame).iter().all(|&b| b == ALLOC_JUNK));

        allocator.free(frame);
        let freed = contents(&allocator, frame);
        assert!(freed[LINK_BYTES..].iter().all(|&b| b == FREE_JUNK));
        // The only other free frame sits below it on the list.
        let below = allocator.pool().frame_number(frame).unwrap().index() ^ 1;
        assert_eq!(&freed[..LINK_BYTES], &(below as u32).to_ne_bytes());
    }

    #[test]
    fn test_exhaustion_is_recoverable() {
        let allocator = allocator(2, AllocatorConfig::single());
        let a = allocator.allocate().unwrap();
        let _b = allocator.allocate().unwrap();

        assert_eq!(allocator.allocate(), None);
        assert_eq!(allocator.stats().failed_allocations, 1);

        allocator.free(a);
        assert_eq!(allocator.allocate(), Some(a));
    }

    #[test]
    fn test_round_trip_keeps_count() {
        for config in [AllocatorConfig::single(), AllocatorConfig::per_cpu()] {
            let allocator = allocator(8, config);
            let before = allocator.free_frames();

            let frames: Vec<Frame> = (0..5).map(|_| allocator.allocate().unwrap()).collect();
            assert_eq!(allocator.audit(frames.len()), Ok(()));
            frames.into_iter().for_each(|frame| allocator.free(frame));

            assert_eq!(allocator.free_frames(), before);
            assert_eq!(allocator.audit(0), Ok(()));
        }
    }

    #[test]
    fn test_audit_catches_double_free() {
        let allocator = allocator(4, AllocatorConfig::single());
        let frame = allocator.allocate().unwrap();
        allocator.free(frame);
        allocator.free(frame);

        assert_eq!(allocator.audit(0), Err(AuditError::ListedTwice(frame)));
    }

    #[test]
    fn test_audit_catches_leak() {
        let allocator = allocator(4, AllocatorConfig::single());
        let _leaked = allocator.allocate().unwrap();

        assert_eq!(
            allocator.audit(0),
            Err(AuditError::Accounting {
                free: 3,
                allocated: 0,
                total: 4
            })
        );
    }

    #[test]
    #[should_panic(expected = "kfree")]
    fn test_free_out_of_range() {
        let allocator = allocator(2, AllocatorConfig::single());
        let outside = Frame::from_start(PhysAddr::new(RAM_BASE + 0x2000)).unwrap();
        allocator.free(outside);
    }

    #[test]
    fn test_stats() {
        let allocator = allocator(3, AllocatorConfig::single());
        let frame = allocator.allocate().unwrap();
        allocator.free(frame);

        let stats = allocator.stats();
        assert_eq!(stats.allocations, 1);
        assert_eq!(stats.frees, 1);
        assert_eq!(stats.free_frames, 3);
        assert_eq!(stats.total_frames, 3);
        assert_eq!(stats.steals, 0);
    }
}

//! # Physical Memory Management
//!
//! Frame allocation over a fixed pool of page frames.
//!
//! The moving parts, leaves first:
//! - [`FramePool`] - the managed range and the kernel window onto it
//! - [`AllocatorBackend`] - where free frames live: one shared list
//!   ([`freelist::SingleFreeList`]) or one list per core
//!   ([`percpu::PerCpuFreeLists`])
//! - [`PageAllocator`] - the allocate/free front end with junk filling and
//!   address checks
//! - [`RefCountTable`] - how many mappings reference each frame
//! - [`PhysicalMemoryManager`] - allocator and table together

pub mod frame_allocator;
pub mod freelist;
pub mod percpu;
pub mod pool;
pub mod refcount;

pub use frame_allocator::{AuditError, PageAllocator};
pub use pool::{FramePool, LINK_BYTES};
pub use refcount::{RefCount, RefCountTable};

use crate::{Frame, FrameNumber, MemResult};
use alloc::sync::Arc;
use alloc::vec::Vec;
use kestrel_hal::cpu::CpuTopology;
use kestrel_hal::PhysAddr;

/// Free-list strategy
///
/// Implementations only shuffle frame numbers; filling, address checks and
/// statistics belong to [`PageAllocator`]. Lists are intrusive: a free
/// frame's first [`pool::LINK_BYTES`] hold the next frame's number, so a
/// backend keeps nothing per frame beyond what lives in `pool`.
pub trait AllocatorBackend: Send + Sync {
    /// Get backend name
    fn name(&self) -> &'static str;

    /// Hand over the initial free frames
    ///
    /// # Safety
    /// Every frame must belong to `pool`, be unused, and be seeded once.
    unsafe fn seed(&self, pool: &FramePool, frames: &mut dyn Iterator<Item = FrameNumber>);

    /// Take one free frame, if any is reachable
    fn pop(&self, pool: &FramePool) -> Option<FrameNumber>;

    /// Return a frame to the free list(s)
    ///
    /// # Safety
    /// The caller gives up `frame`; nothing may touch it until it is
    /// popped again.
    unsafe fn push(&self, pool: &FramePool, frame: FrameNumber);

    /// Length of every free list, in list order
    fn list_lengths(&self) -> Vec<usize>;

    /// Call `visit` for every free frame, list by list
    fn for_each_free(&self, pool: &FramePool, visit: &mut dyn FnMut(FrameNumber));

    /// Free frames across all lists
    fn free_frames(&self) -> usize {
        self.list_lengths().iter().sum()
    }

    /// Frames taken from another core's list
    fn steals(&self) -> u64 {
        0
    }
}

/// Contiguous physical range handed to the allocator at boot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PhysicalRegion {
    /// Start address
    pub start: PhysAddr,
    /// Size in bytes
    pub size: u64,
}

impl PhysicalRegion {
    /// Create a new region
    pub fn new(start: PhysAddr, size: u64) -> Self {
        Self { start, size }
    }

    /// Get end address
    pub fn end(&self) -> PhysAddr {
        self.start.add(self.size)
    }
}

/// Free-list strategy selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AllocStrategy {
    /// One free list behind one lock
    #[default]
    Single,
    /// One free list per core, stealing from other cores when empty
    PerCpu,
}

/// Page allocator configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AllocatorConfig {
    /// Free-list strategy
    pub strategy: AllocStrategy,
}

impl AllocatorConfig {
    /// Single shared free list
    pub const fn single() -> Self {
        Self {
            strategy: AllocStrategy::Single,
        }
    }

    /// Per-core free lists
    pub const fn per_cpu() -> Self {
        Self {
            strategy: AllocStrategy::PerCpu,
        }
    }

    /// Set the strategy
    pub const fn strategy(mut self, strategy: AllocStrategy) -> Self {
        self.strategy = strategy;
        self
    }
}

/// Allocator statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AllocatorStats {
    /// Successful allocations
    pub allocations: u64,
    /// Frames freed
    pub frees: u64,
    /// Allocations that found no frame
    pub failed_allocations: u64,
    /// Frames taken from another core's list
    pub steals: u64,
    /// Frames currently on free lists
    pub free_frames: usize,
    /// Frames under management
    pub total_frames: usize,
}

/// Physical memory manager
///
/// Owns the page allocator and the per-frame reference counts. Frames that
/// end up in page tables should go through [`alloc_frame`](Self::alloc_frame)
/// and [`put_frame`](Self::put_frame) so their counts stay exact.
pub struct PhysicalMemoryManager {
    /// Frame allocator
    allocator: PageAllocator,
    /// Mapping counts, indexed by frame number
    refs: RefCountTable,
}

impl PhysicalMemoryManager {
    /// Build the allocator over `pool` and seed its free lists
    pub fn new(pool: FramePool, config: &AllocatorConfig, cpu: Arc<dyn CpuTopology>) -> Self {
        Self::from_allocator(PageAllocator::new(pool, config, cpu))
    }

    /// Wrap an already seeded allocator
    pub fn from_allocator(allocator: PageAllocator) -> Self {
        let refs = RefCountTable::new(allocator.pool().total_frames());
        Self { allocator, refs }
    }

    /// Get the allocator
    pub fn allocator(&self) -> &PageAllocator {
        &self.allocator
    }

    /// Get the frame pool
    pub fn pool(&self) -> &FramePool {
        self.allocator.pool()
    }

    /// Allocate a frame with a reference count of one
    pub fn alloc_frame(&self) -> Option<Frame> {
        let frame = self.allocator.allocate()?;
        self.refs.init_one(self.number_of(frame, "alloc_frame"));
        Some(frame)
    }

    /// Drop one reference, freeing the frame when none remain
    pub fn put_frame(&self, frame: Frame) {
        let number = self.number_of(frame, "put_frame");
        if self.refs.decrement(number) == 0 {
            self.allocator.free(frame);
        }
    }

    /// Record one more mapping of `frame`
    ///
    /// The caller marks both mappings read-only and copy-on-write.
    pub fn duplicate_mapping(&self, frame: Frame) {
        let number = self.number_of(frame, "duplicate_mapping");
        self.refs.increment(number);
    }

    /// Current reference count of `frame`
    pub fn ref_count(&self, frame: Frame) -> MemResult<RefCount> {
        let number = self.pool().frame_number(frame)?;
        Ok(self.refs.get(number))
    }

    /// Get statistics
    pub fn stats(&self) -> AllocatorStats {
        self.allocator.stats()
    }

    fn number_of(&self, frame: Frame, op: &str) -> FrameNumber {
        match self.pool().frame_number(frame) {
            Ok(number) => number,
            Err(err) => panic!("{}: frame {:#x}: {}", op, frame.address(), err),
        }
    }
}

impl core::fmt::Debug for PhysicalMemoryManager {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("PhysicalMemoryManager")
            .field("allocator", &self.allocator)
            .finish_non_exhaustive()
    }
}

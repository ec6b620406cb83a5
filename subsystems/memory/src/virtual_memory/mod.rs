//! # Virtual Memory
//!
//! The leaf page-table interface the copy-on-write handler works through.
//! Hardware page tables live in the kernel; [`mapper::SoftPageTable`] is a
//! software implementation for hosted kernels and tests.

pub mod mapper;

pub use mapper::SoftPageTable;

use crate::{Frame, MemResult, PageFlags};
use kestrel_hal::VirtAddr;

/// Leaf page table entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageTableEntry {
    /// Mapped frame
    pub frame: Frame,
    /// Entry flags
    pub flags: PageFlags,
}

impl PageTableEntry {
    /// Create a new entry
    pub fn new(frame: Frame, flags: PageFlags) -> Self {
        Self { frame, flags }
    }

    /// Check the present bit
    pub fn is_present(&self) -> bool {
        self.flags.contains(PageFlags::PRESENT)
    }

    /// Present and tagged copy-on-write
    pub fn is_cow(&self) -> bool {
        self.flags.contains(PageFlags::PRESENT | PageFlags::COW)
    }
}

/// Page table trait
///
/// One address space. Callers serialize access to it; the `&mut self`
/// methods are never called concurrently on one table.
pub trait PageTable {
    /// Look up the entry for the page containing `va`, present or not
    fn walk(&self, va: VirtAddr) -> Option<PageTableEntry>;

    /// Mutable access to the entry for the page containing `va`
    fn walk_mut(&mut self, va: VirtAddr) -> Option<&mut PageTableEntry>;

    /// Install a mapping for the page at `va`
    ///
    /// Fails with [`MemError::NotAligned`](crate::MemError::NotAligned) for an
    /// unaligned `va` and [`MemError::AlreadyMapped`](crate::MemError::AlreadyMapped)
    /// if a present entry is in the way. A non-present entry is replaced.
    fn map(&mut self, va: VirtAddr, frame: Frame, flags: PageFlags) -> MemResult<()>;

    /// Remove the mapping for the page at `va`, returning the old entry
    fn unmap(&mut self, va: VirtAddr) -> MemResult<PageTableEntry>;

    /// Invalidate any cached translation of `va`
    fn flush(&self, _va: VirtAddr) {}
}

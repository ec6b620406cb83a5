//! # Copy-on-Write
//!
//! Fork shares user frames between parent and child instead of copying
//! them: both entries lose the writable bit, gain the [`PageFlags::COW`]
//! tag, and the frame's reference count goes up. The first write through
//! either mapping faults into [`CowFaultHandler::resolve_cow_fault`], which
//! gives the writer a private copy. The last mapping standing is promoted in
//! place without copying.

use crate::physical::PhysicalMemoryManager;
use crate::virtual_memory::PageTable;
use crate::{Frame, MemError, MemResult, PageFlags};
use kestrel_hal::VirtAddr;

/// Copy-on-write fault handler
#[derive(Debug, Clone, Copy)]
pub struct CowFaultHandler<'m> {
    memory: &'m PhysicalMemoryManager,
}

impl<'m> CowFaultHandler<'m> {
    /// Create a handler drawing frames from `memory`
    pub fn new(memory: &'m PhysicalMemoryManager) -> Self {
        Self { memory }
    }

    /// Share the page at `va` of `parent` with `child`
    ///
    /// Writable pages become read-only copy-on-write in both tables;
    /// read-only pages are shared as they are. Returns the shared frame.
    pub fn share_page(
        &self,
        parent: &mut dyn PageTable,
        child: &mut dyn PageTable,
        va: VirtAddr,
    ) -> MemResult<Frame> {
        if !va.is_page_aligned() {
            return Err(MemError::NotAligned);
        }
        let entry = match parent.walk(va) {
            Some(entry) if entry.is_present() => entry,
            _ => return Err(MemError::NotMapped),
        };

        let flags = if entry.flags.intersects(PageFlags::WRITABLE | PageFlags::COW) {
            entry.flags.shared_cow()
        } else {
            entry.flags
        };

        child.map(va, entry.frame, flags)?;
        if flags != entry.flags {
            if let Some(parent_entry) = parent.walk_mut(va) {
                parent_entry.flags = flags;
            }
            parent.flush(va);
        }
        self.memory.duplicate_mapping(entry.frame);
        Ok(entry.frame)
    }

    /// Check whether a write fault at `va` is a copy-on-write fault
    pub fn is_cow_candidate(&self, table: &dyn PageTable, va: VirtAddr) -> bool {
        table.walk(va).is_some_and(|entry| entry.is_cow())
    }

    /// Give the mapping at `va` a private, writable frame
    ///
    /// Returns the frame `va` maps afterwards. On any error the mapping is
    /// left as it was and no frame is leaked.
    pub fn resolve_cow_fault(&self, table: &mut dyn PageTable, va: VirtAddr) -> MemResult<Frame> {
        if !va.is_page_aligned() {
            return Err(MemError::NotAligned);
        }
        if !self.is_cow_candidate(table, va) {
            return Err(MemError::NotCopyOnWrite);
        }
        let entry = table.walk_mut(va).ok_or(MemError::NotMapped)?;
        let old = entry.frame;

        if self.memory.ref_count(old)?.is_single() {
            entry.flags = entry.flags.private_writable();
            table.flush(va);
            log::trace!("cow: promoted {:#x} in place", va);
            return Ok(old);
        }

        entry.flags.remove(PageFlags::PRESENT);
        let flags = entry.flags.private_writable();
        table.flush(va);

        let Some(new) = self.memory.alloc_frame() else {
            if let Some(entry) = table.walk_mut(va) {
                entry.flags.insert(PageFlags::PRESENT);
            }
            log::warn!("cow: out of memory copying {:#x}", va);
            return Err(MemError::OutOfMemory);
        };

        if let Err(err) = self.install_copy(table, va, old, new, flags) {
            if let Some(entry) = table.walk_mut(va) {
                entry.flags.insert(PageFlags::PRESENT);
            }
            self.memory.put_frame(new);
            log::warn!("cow: mapping copy of {:#x} failed: {}", va, err);
            return Err(err);
        }
        table.flush(va);
        self.memory.put_frame(old);

        log::debug!(
            "cow: copied {:#x} from {:#x} to {:#x}",
            va,
            old.address(),
            new.address()
        );
        Ok(new)
    }

    fn install_copy(
        &self,
        table: &mut dyn PageTable,
        va: VirtAddr,
        old: Frame,
        new: Frame,
        flags: PageFlags,
    ) -> MemResult<()> {
        let pool = self.memory.pool();
        // SAFETY: `new` is ours alone; `old` is read-only in every mapping.
        unsafe {
            pool.copy(pool.frame_number(old)?, pool.frame_number(new)?);
        }
        table.map(va, new, flags)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::physical::testing::manager;
    use crate::physical::AllocatorConfig;
    use crate::virtual_memory::{PageTableEntry, SoftPageTable};

    const VA: VirtAddr = VirtAddr::new(0x1000);

    /// Table that cannot take new mappings, as when an intermediate level
    /// cannot be allocated
    struct FullTable(SoftPageTable);

    impl PageTable for FullTable {
        fn walk(&self, va: VirtAddr) -> Option<PageTableEntry> {
            self.0.walk(va)
        }

        fn walk_mut(&mut self, va: VirtAddr) -> Option<&mut PageTableEntry> {
            self.0.walk_mut(va)
        }

        fn map(&mut self, _va: VirtAddr, _frame: Frame, _flags: PageFlags) -> MemResult<()> {
            Err(MemError::OutOfMemory)
        }

        fn unmap(&mut self, va: VirtAddr) -> MemResult<PageTableEntry> {
            self.0.unmap(va)
        }
    }

    fn write_byte(memory: &PhysicalMemoryManager, frame: Frame, value: u8) {
        unsafe { memory.pool().bytes_mut(frame).unwrap()[0] = value };
    }

    fn read_byte(memory: &PhysicalMemoryManager, frame: Frame) -> u8 {
        unsafe { memory.pool().bytes(frame).unwrap()[0] }
    }

    #[test]
    fn test_share_marks_both_cow() {
        let memory = manager(4, 1, AllocatorConfig::single());
        let cow = CowFaultHandler::new(&memory);
        let (mut parent, mut child) = (SoftPageTable::new(), SoftPageTable::new());

        let frame = memory.alloc_frame().unwrap();
        parent.map(VA, frame, PageFlags::user_data()).unwrap();
        cow.share_page(&mut parent, &mut child, VA).unwrap();

        for table in [&parent, &child] {
            let entry = table.walk(VA).unwrap();
            assert!(entry.is_cow());
            assert!(!entry.flags.contains(PageFlags::WRITABLE));
            assert!(cow.is_cow_candidate(table, VA));
        }
        assert_eq!(memory.ref_count(frame).unwrap().get(), 2);
    }

    #[test]
    fn test_share_read_only_page() {
        let memory = manager(4, 1, AllocatorConfig::single());
        let cow = CowFaultHandler::new(&memory);
        let (mut parent, mut child) = (SoftPageTable::new(), SoftPageTable::new());

        let frame = memory.alloc_frame().unwrap();
        parent.map(VA, frame, PageFlags::user_code()).unwrap();
        cow.share_page(&mut parent, &mut child, VA).unwrap();

        assert_eq!(child.walk(VA).unwrap().flags, parent.walk(VA).unwrap().flags);
        assert!(!cow.is_cow_candidate(&child, VA));
        assert_eq!(
            cow.resolve_cow_fault(&mut child, VA),
            Err(MemError::NotCopyOnWrite)
        );
    }

    #[test]
    fn test_share_unmapped() {
        let memory = manager(2, 1, AllocatorConfig::single());
        let cow = CowFaultHandler::new(&memory);
        let (mut parent, mut child) = (SoftPageTable::new(), SoftPageTable::new());

        assert_eq!(
            cow.share_page(&mut parent, &mut child, VA),
            Err(MemError::NotMapped)
        );
        assert!(child.is_empty());
    }

    #[test]
    fn test_copy_on_shared() {
        let memory = manager(4, 1, AllocatorConfig::single());
        let cow = CowFaultHandler::new(&memory);
        let (mut parent, mut child) = (SoftPageTable::new(), SoftPageTable::new());

        let frame = memory.alloc_frame().unwrap();
        write_byte(&memory, frame, 42);
        parent.map(VA, frame, PageFlags::user_data()).unwrap();
        cow.share_page(&mut parent, &mut child, VA).unwrap();

        let copy = cow.resolve_cow_fault(&mut child, VA).unwrap();
        assert_ne!(copy, frame);
        assert_eq!(read_byte(&memory, copy), 42);
        assert_eq!(child.walk(VA).unwrap().flags, PageFlags::user_data());
        assert_eq!(memory.ref_count(frame).unwrap().get(), 1);
        assert_eq!(memory.ref_count(copy).unwrap().get(), 1);
    }

    #[test]
    fn test_promote_in_place() {
        let memory = manager(4, 1, AllocatorConfig::single());
        let cow = CowFaultHandler::new(&memory);
        let mut table = SoftPageTable::new();

        let frame = memory.alloc_frame().unwrap();
        table
            .map(VA, frame, PageFlags::user_data().shared_cow())
            .unwrap();
        let allocations = memory.stats().allocations;

        assert_eq!(cow.resolve_cow_fault(&mut table, VA), Ok(frame));
        assert_eq!(memory.stats().allocations, allocations);
        assert_eq!(table.walk(VA).unwrap().flags, PageFlags::user_data());
        assert!(table.flushes() > 0);
    }

    #[test]
    fn test_out_of_memory_restores_entry() {
        let memory = manager(1, 1, AllocatorConfig::single());
        let cow = CowFaultHandler::new(&memory);
        let (mut parent, mut child) = (SoftPageTable::new(), SoftPageTable::new());

        let frame = memory.alloc_frame().unwrap();
        parent.map(VA, frame, PageFlags::user_data()).unwrap();
        cow.share_page(&mut parent, &mut child, VA).unwrap();
        let before = child.walk(VA).unwrap();

        assert_eq!(
            cow.resolve_cow_fault(&mut child, VA),
            Err(MemError::OutOfMemory)
        );
        assert_eq!(child.walk(VA), Some(before));
        assert_eq!(memory.ref_count(frame).unwrap().get(), 2);
    }

    #[test]
    fn test_failed_map_restores_entry() {
        let memory = manager(4, 1, AllocatorConfig::single());
        let cow = CowFaultHandler::new(&memory);
        let (mut parent, mut child) = (SoftPageTable::new(), SoftPageTable::new());

        let frame = memory.alloc_frame().unwrap();
        parent.map(VA, frame, PageFlags::user_data()).unwrap();
        cow.share_page(&mut parent, &mut child, VA).unwrap();
        let before = child.walk(VA).unwrap();

        let mut child = FullTable(child);
        assert_eq!(
            cow.resolve_cow_fault(&mut child, VA),
            Err(MemError::OutOfMemory)
        );
        assert_eq!(child.walk(VA), Some(before));
        assert_eq!(memory.ref_count(frame).unwrap().get(), 2);
        assert_eq!(memory.stats().free_frames, 3);
        assert_eq!(memory.allocator().audit(1), Ok(()));
    }

    #[test]
    fn test_unaligned_fault() {
        let memory = manager(1, 1, AllocatorConfig::single());
        let cow = CowFaultHandler::new(&memory);
        let mut table = SoftPageTable::new();

        assert_eq!(
            cow.resolve_cow_fault(&mut table, VirtAddr::new(0x1008)),
            Err(MemError::NotAligned)
        );
        assert_eq!(
            cow.resolve_cow_fault(&mut table, VA),
            Err(MemError::NotCopyOnWrite)
        );
    }
}

//! # Software Page Table
//!
//! A page table kept in an ordered map keyed by virtual page number.

use super::{PageTable, PageTableEntry};
use crate::{Frame, MemError, MemResult, PageFlags};
use alloc::collections::BTreeMap;
use core::sync::atomic::{AtomicU64, Ordering};
use kestrel_hal::VirtAddr;

/// Page table backed by a map
#[derive(Debug, Default)]
pub struct SoftPageTable {
    /// Entries by virtual page number
    entries: BTreeMap<u64, PageTableEntry>,
    /// Translation invalidations requested
    flushes: AtomicU64,
}

impl SoftPageTable {
    /// Create an empty table
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of entries, present or not
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check if the table has no entries
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Translation invalidations requested so far
    pub fn flushes(&self) -> u64 {
        self.flushes.load(Ordering::Relaxed)
    }

    /// Iterate over present mappings in address order
    pub fn mappings(&self) -> impl Iterator<Item = (VirtAddr, PageTableEntry)> + '_ {
        self.entries
            .iter()
            .filter(|(_, entry)| entry.is_present())
            .map(|(&page, &entry)| (VirtAddr::new(page << kestrel_hal::PAGE_SHIFT), entry))
    }
}

impl PageTable for SoftPageTable {
    fn walk(&self, va: VirtAddr) -> Option<PageTableEntry> {
        self.entries.get(&va.page_number()).copied()
    }

    fn walk_mut(&mut self, va: VirtAddr) -> Option<&mut PageTableEntry> {
        self.entries.get_mut(&va.page_number())
    }

    fn map(&mut self, va: VirtAddr, frame: Frame, flags: PageFlags) -> MemResult<()> {
        if !va.is_page_aligned() {
            return Err(MemError::NotAligned);
        }
        let slot = self.entries.entry(va.page_number()).or_insert(PageTableEntry {
            frame,
            flags: PageFlags::empty(),
        });
        if slot.is_present() {
            return Err(MemError::AlreadyMapped);
        }

        log::trace!("map {:#x} -> {:#x} {:?}", va, frame.address(), flags);
        *slot = PageTableEntry::new(frame, flags | PageFlags::PRESENT);
        Ok(())
    }

    fn unmap(&mut self, va: VirtAddr) -> MemResult<PageTableEntry> {
        match self.entries.remove(&va.page_number()) {
            Some(entry) if entry.is_present() => Ok(entry),
            Some(_) | None => Err(MemError::NotMapped),
        }
    }

    fn flush(&self, _va: VirtAddr) {
        self.flushes.fetch_add(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kestrel_hal::PhysAddr;

    fn frame(addr: u64) -> Frame {
        Frame::from_start(PhysAddr::new(addr)).unwrap()
    }

    #[test]
    fn test_map_and_walk() {
        let mut table = SoftPageTable::new();
        let va = VirtAddr::new(0x4000);
        table.map(va, frame(0x8000_0000), PageFlags::user_data()).unwrap();

        let entry = table.walk(VirtAddr::new(0x4abc)).unwrap();
        assert_eq!(entry.frame, frame(0x8000_0000));
        assert!(entry.is_present());
        assert!(!entry.is_cow());
        assert_eq!(table.mappings().count(), 1);
    }

    #[test]
    fn test_map_errors() {
        let mut table = SoftPageTable::new();
        assert_eq!(
            table.map(VirtAddr::new(0x4010), frame(0x8000_0000), PageFlags::user_data()),
            Err(MemError::NotAligned)
        );

        table.map(VirtAddr::new(0x4000), frame(0x8000_0000), PageFlags::user_data()).unwrap();
        assert_eq!(
            table.map(VirtAddr::new(0x4000), frame(0x8000_1000), PageFlags::user_data()),
            Err(MemError::AlreadyMapped)
        );
    }

    #[test]
    fn test_remap_non_present() {
        let mut table = SoftPageTable::new();
        let va = VirtAddr::new(0x4000);
        table.map(va, frame(0x8000_0000), PageFlags::user_data()).unwrap();
        table.walk_mut(va).unwrap().flags.remove(PageFlags::PRESENT);

        assert_eq!(table.mappings().count(), 0);
        table.map(va, frame(0x8000_1000), PageFlags::user_data()).unwrap();
        assert_eq!(table.walk(va).unwrap().frame, frame(0x8000_1000));
    }

    #[test]
    fn test_unmap() {
        let mut table = SoftPageTable::new();
        let va = VirtAddr::new(0x4000);
        assert_eq!(table.unmap(va), Err(MemError::NotMapped));

        table.map(va, frame(0x8000_0000), PageFlags::user_data()).unwrap();
        assert_eq!(table.unmap(va).unwrap().frame, frame(0x8000_0000));
        assert!(table.is_empty());
    }
}

//! # Frame Reference Counts
//!
//! How many page-table entries map each frame. A frame with count zero is
//! either free or owned outside any page table.

use crate::FrameNumber;
use alloc::boxed::Box;
use alloc::vec;
use spin::Mutex;

/// Snapshot of one frame's reference count
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct RefCount(u32);

impl RefCount {
    /// Raw count
    pub fn get(self) -> u32 {
        self.0
    }

    /// Exactly one mapping
    pub fn is_single(self) -> bool {
        self.0 == 1
    }

    /// More than one mapping
    pub fn is_shared(self) -> bool {
        self.0 > 1
    }
}

/// One counter per frame, behind a single lock
#[derive(Debug)]
pub struct RefCountTable {
    counts: Mutex<Box<[u32]>>,
}

impl RefCountTable {
    /// Create a table of `frames` zero counts
    pub fn new(frames: usize) -> Self {
        Self {
            counts: Mutex::new(vec![0; frames].into_boxed_slice()),
        }
    }

    /// Read a count
    pub fn get(&self, frame: FrameNumber) -> RefCount {
        RefCount(self.counts.lock()[frame.index()])
    }

    /// Set a freshly allocated frame's count to one
    pub fn init_one(&self, frame: FrameNumber) {
        self.counts.lock()[frame.index()] = 1;
    }

    /// Add a mapping; returns the new count
    ///
    /// # Panics
    /// If the frame has no mapping yet.
    pub fn increment(&self, frame: FrameNumber) -> u32 {
        let mut counts = self.counts.lock();
        let count = &mut counts[frame.index()];
        assert!(*count > 0, "duplicate_mapping: frame {} is not mapped", frame.index());
        *count = count
            .checked_add(1)
            .unwrap_or_else(|| panic!("duplicate_mapping: frame {} count overflow", frame.index()));
        *count
    }

    /// Drop a mapping; returns the new count
    ///
    /// # Panics
    /// If the count is already zero.
    pub fn decrement(&self, frame: FrameNumber) -> u32 {
        let mut counts = self.counts.lock();
        let count = &mut counts[frame.index()];
        assert!(*count > 0, "put_frame: frame {} refcount underflow", frame.index());
        *count -= 1;
        *count
    }
}

//! # Kestrel Memory Subsystem
//!
//! The memory subsystem provides:
//! - Physical frame allocation with interchangeable free-list strategies
//! - Per-frame reference counts
//! - Copy-on-write fault resolution on top of those counts
//! - The page-table interface the fault handler consumes
//!
//! ## Ownership
//!
//! Everything hangs off one [`physical::PhysicalMemoryManager`], built once
//! at boot from a contiguous physical range and passed by reference to its
//! users. There is no global instance.

#![cfg_attr(not(test), no_std)]
#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs)]

extern crate alloc;

pub mod cow;
pub mod param;
pub mod physical;
pub mod virtual_memory;

use core::fmt;
use kestrel_hal::{PhysAddr, PAGE_SIZE};

pub use kestrel_hal::mmu::PageFlags;

/// Memory subsystem result type
pub type MemResult<T> = Result<T, MemError>;

/// Memory subsystem errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemError {
    /// Out of memory
    OutOfMemory,
    /// Address outside the managed range
    InvalidAddress,
    /// Address not aligned
    NotAligned,
    /// Page already mapped
    AlreadyMapped,
    /// Page not mapped
    NotMapped,
    /// Mapping is not tagged copy-on-write
    NotCopyOnWrite,
    /// Physical range holds no whole frame
    InvalidRegion,
}

impl fmt::Display for MemError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            MemError::OutOfMemory => "out of memory",
            MemError::InvalidAddress => "address outside managed range",
            MemError::NotAligned => "address not page aligned",
            MemError::AlreadyMapped => "page already mapped",
            MemError::NotMapped => "page not mapped",
            MemError::NotCopyOnWrite => "mapping is not copy-on-write",
            MemError::InvalidRegion => "region holds no whole frame",
        };
        f.write_str(msg)
    }
}

/// Frame - a page-aligned physical page
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Frame {
    /// Physical address of the frame
    address: PhysAddr,
}

impl Frame {
    /// Create a frame from a page-aligned address
    pub fn from_start(address: PhysAddr) -> MemResult<Self> {
        if !address.is_page_aligned() {
            return Err(MemError::NotAligned);
        }
        Ok(Self { address })
    }

    /// The frame containing `address`
    pub const fn containing(address: PhysAddr) -> Self {
        Self {
            address: address.align_down(PAGE_SIZE),
        }
    }

    /// Get the physical address
    pub fn address(&self) -> PhysAddr {
        self.address
    }

    /// Get the end address
    pub fn end(&self) -> PhysAddr {
        self.address.add(PAGE_SIZE)
    }

    /// Check if address is within this frame
    pub fn contains(&self, addr: PhysAddr) -> bool {
        addr >= self.address && addr < self.end()
    }
}

/// Index of a frame within the managed pool
///
/// Only a [`physical::FramePool`] hands these out, after checking the
/// address, so tables indexed by `FrameNumber` never see a stray address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FrameNumber(u32);

impl FrameNumber {
    pub(crate) const fn new(index: u32) -> Self {
        Self(index)
    }

    /// Index into per-frame tables
    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

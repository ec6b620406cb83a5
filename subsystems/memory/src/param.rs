//! Memory subsystem parameters.

use static_assertions::const_assert;

pub use kestrel_hal::PAGE_SIZE;

/// Maximum number of cores with their own free list
pub const MAX_CPUS: usize = 8;

/// Byte pattern written over a frame when it is handed out
pub const ALLOC_JUNK: u8 = 0x05;

/// Byte pattern written over a frame when it is freed
pub const FREE_JUNK: u8 = 0x01;

/// Largest frame count a pool may manage (frame numbers are `u32`)
pub const MAX_FRAMES: usize = u32::MAX as usize;

const_assert!(ALLOC_JUNK != FREE_JUNK);
const_assert!(ALLOC_JUNK != 0 && FREE_JUNK != 0);
const_assert!(PAGE_SIZE as usize >= core::mem::size_of::<u64>());

//! Block layer parameters.

use static_assertions::const_assert;

/// Size of a disk block in bytes
pub const BLOCK_SIZE: usize = 1024;

/// Default number of buffers in the cache
pub const NBUF: usize = 30;

/// Default number of buckets for the sharded cache (prime)
pub const NBUCKET: usize = 13;

const_assert!(BLOCK_SIZE.is_power_of_two());
const_assert!(BLOCK_SIZE as u64 <= kestrel_hal::PAGE_SIZE);
const_assert!(NBUF > 0 && NBUCKET > 0);
const_assert!(NBUF < u32::MAX as usize);

//! # Kestrel Block Layer
//!
//! The buffer cache between file-system code and the block device.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────┐
//! │        file system / log (callers)            │
//! ├───────────────────────────────────────────────┤
//! │  BufferCache  read · write · release · pin    │
//! │  ┌─────────────────┐  ┌─────────────────────┐ │
//! │  │  GlobalLru      │  │  ShardedLru         │ │
//! │  │  one list/lock  │  │  bucket per hash    │ │
//! │  └─────────────────┘  └─────────────────────┘ │
//! ├───────────────────────────────────────────────┤
//! │  BlockDevice  (driver, or RamDisk)            │
//! └───────────────────────────────────────────────┘
//! ```
//!
//! A cache is built once at boot and shared by reference; each buffer's
//! payload sits behind a sleep lock, while recency lists sit behind short
//! spin locks.

#![cfg_attr(not(test), no_std)]
#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs)]

extern crate alloc;

pub mod cache;
pub mod disk;
pub mod param;

pub use cache::{
    BufferCache, BufferGuard, CacheConfig, CacheStats, CacheStrategy, PinnedBuf,
};
pub use disk::ramdisk::RamDisk;
pub use disk::BlockDevice;

/// Device identifier
pub type DeviceId = u32;

/// Block number on a device
pub type BlockNum = u32;

/// One block's payload
pub type BlockData = [u8; param::BLOCK_SIZE];

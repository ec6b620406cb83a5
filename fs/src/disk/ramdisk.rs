//! RAM-backed block device.

use super::BlockDevice;
use crate::param::BLOCK_SIZE;
use crate::{BlockData, BlockNum, DeviceId};
use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use core::sync::atomic::{AtomicU64, Ordering};
use spin::Mutex;

/// Block device kept in memory
///
/// Blocks never written read back as zeroes. Every transfer is counted.
#[derive(Debug, Default)]
pub struct RamDisk {
    /// Written blocks by (device, block)
    blocks: Mutex<BTreeMap<(DeviceId, BlockNum), Box<BlockData>>>,
    /// Blocks read
    reads: AtomicU64,
    /// Blocks written
    writes: AtomicU64,
}

impl RamDisk {
    /// Create an empty disk
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `data` at a block without counting a write
    pub fn load(&self, dev: DeviceId, block: BlockNum, data: &BlockData) {
        self.blocks.lock().insert((dev, block), Box::new(*data));
    }

    /// Copy of a block's current contents, without counting a read
    pub fn peek(&self, dev: DeviceId, block: BlockNum) -> BlockData {
        self.blocks
            .lock()
            .get(&(dev, block))
            .map_or([0; BLOCK_SIZE], |data| **data)
    }

    /// Blocks read so far
    pub fn reads(&self) -> u64 {
        self.reads.load(Ordering::Relaxed)
    }

    /// Blocks written so far
    pub fn writes(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }
}

impl BlockDevice for RamDisk {
    fn read_block(&self, dev: DeviceId, block: BlockNum, buf: &mut BlockData) {
        *buf = self.peek(dev, block);
        self.reads.fetch_add(1, Ordering::Relaxed);
    }

    fn write_block(&self, dev: DeviceId, block: BlockNum, buf: &BlockData) {
        self.load(dev, block, buf);
        self.writes.fetch_add(1, Ordering::Relaxed);
    }
}

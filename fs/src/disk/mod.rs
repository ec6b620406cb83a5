//! Block device abstraction.
//!
//! The cache moves whole blocks through [`BlockDevice`] and never holds a
//! spin lock while doing so.

pub mod ramdisk;

use crate::{BlockData, BlockNum, DeviceId};

/// Synchronous, infallible block I/O
///
/// One implementation may serve several devices, told apart by `dev`.
/// Calls may block the calling context until the transfer completes.
pub trait BlockDevice: Send + Sync {
    /// Read block `block` of `dev` into `buf`
    fn read_block(&self, dev: DeviceId, block: BlockNum, buf: &mut BlockData);

    /// Write `buf` to block `block` of `dev`
    fn write_block(&self, dev: DeviceId, block: BlockNum, buf: &BlockData);
}

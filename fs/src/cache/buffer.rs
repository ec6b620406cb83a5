//! Buffer headers.
//!
//! Per-slot bookkeeping for the buffer cache: block identity, the valid
//! flag, the reference count, and the links of the recency list the slot
//! sits on. The payload lives beside the header in its own sleep lock.
//!
//! Identity, count and links are only written under the lock of the list
//! that owns the slot; atomics let readers outside that lock (the holder of
//! the slot's sleep lock, audits) load them without tearing.

use crate::{BlockNum, DeviceId};
use core::fmt;
use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use static_assertions::const_assert_eq;

/// Link value meaning "no slot"
pub const NIL: u32 = u32::MAX;

/// Buffer header (metadata).
#[repr(C)]
pub struct BufferHeader {
    /// Device of the cached block
    dev: AtomicU32,
    /// Block number of the cached block
    blockno: AtomicU32,
    /// Holders plus pins
    refcnt: AtomicU32,
    /// Recency list: towards most recently used
    prev: AtomicU32,
    /// Recency list: towards least recently used
    next: AtomicU32,
    /// Payload holds the block's contents
    valid: AtomicBool,
    /// `dev` and `blockno` name a block
    assigned: AtomicBool,
}

const_assert_eq!(core::mem::size_of::<BufferHeader>(), 24);

impl BufferHeader {
    /// Create an unlinked header holding no block
    pub const fn new() -> Self {
        Self {
            dev: AtomicU32::new(0),
            blockno: AtomicU32::new(0),
            refcnt: AtomicU32::new(0),
            prev: AtomicU32::new(NIL),
            next: AtomicU32::new(NIL),
            valid: AtomicBool::new(false),
            assigned: AtomicBool::new(false),
        }
    }

    /// Get device
    #[inline]
    pub fn dev(&self) -> DeviceId {
        self.dev.load(Ordering::Relaxed)
    }

    /// Get block number
    #[inline]
    pub fn blockno(&self) -> BlockNum {
        self.blockno.load(Ordering::Relaxed)
    }

    /// Does this slot hold `(dev, blockno)`
    #[inline]
    pub fn holds(&self, dev: DeviceId, blockno: BlockNum) -> bool {
        self.has_identity() && self.dev() == dev && self.blockno() == blockno
    }

    /// Does this slot hold any block
    #[inline]
    pub fn has_identity(&self) -> bool {
        self.assigned.load(Ordering::Relaxed)
    }

    /// Get refcount
    #[inline]
    pub fn refcnt(&self) -> u32 {
        self.refcnt.load(Ordering::Relaxed)
    }

    /// Is the payload current
    #[inline]
    pub fn is_valid(&self) -> bool {
        self.valid.load(Ordering::Acquire)
    }

    /// Mark the payload current (caller holds the slot's sleep lock)
    #[inline]
    pub fn set_valid(&self) {
        self.valid.store(true, Ordering::Release);
    }

    /// Take the slot over for `(dev, blockno)` with one reference
    pub(crate) fn recycle(&self, dev: DeviceId, blockno: BlockNum) {
        debug_assert_eq!(self.refcnt(), 0);
        self.dev.store(dev, Ordering::Relaxed);
        self.blockno.store(blockno, Ordering::Relaxed);
        self.assigned.store(true, Ordering::Relaxed);
        self.valid.store(false, Ordering::Release);
        self.refcnt.store(1, Ordering::Relaxed);
    }

    /// Drop the slot's identity; it holds no block afterwards
    pub(crate) fn forget(&self) {
        self.assigned.store(false, Ordering::Relaxed);
        self.valid.store(false, Ordering::Release);
        self.refcnt.store(0, Ordering::Relaxed);
    }

    /// Increment refcount
    #[inline]
    pub(crate) fn acquire(&self) -> u32 {
        self.refcnt.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Decrement refcount; `op` names the caller in the panic message
    pub(crate) fn release(&self, op: &str) -> u32 {
        let count = self.refcnt();
        assert!(
            count > 0,
            "{}: buffer {}/{} not referenced",
            op,
            self.dev(),
            self.blockno()
        );
        self.refcnt.store(count - 1, Ordering::Relaxed);
        count - 1
    }

    #[inline]
    pub(crate) fn prev(&self) -> u32 {
        self.prev.load(Ordering::Relaxed)
    }

    #[inline]
    pub(crate) fn next(&self) -> u32 {
        self.next.load(Ordering::Relaxed)
    }

    #[inline]
    pub(crate) fn set_prev(&self, slot: u32) {
        self.prev.store(slot, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn set_next(&self, slot: u32) {
        self.next.store(slot, Ordering::Relaxed);
    }
}

impl Default for BufferHeader {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for BufferHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferHeader")
            .field("dev", &self.dev())
            .field("blockno", &self.blockno())
            .field("refcnt", &self.refcnt())
            .field("valid", &self.is_valid())
            .finish()
    }
}

//! Kestrel Buffer Cache
//!
//! A bounded pool of block buffers keyed by (device, block number).
//!
//! # Locking
//! - Recency lists (one global list, or one per bucket) sit behind
//!   `spin::Mutex`es and guard every slot's identity and reference count.
//! - Each slot's payload sits behind a [`SleepLock`]. Device I/O happens only
//!   while holding it, never while holding a list lock.
//!
//! A caller gets a locked buffer from [`BufferCache::read`] and gives it
//! back by dropping the [`BufferGuard`] (or passing it to
//! [`BufferCache::release`]). While at least one reference exists the slot
//! keeps its block; at zero it becomes the most recently used entry of its
//! list and may later be recycled for another block.

pub mod buffer;
pub mod global;
pub mod lru;
pub mod sharded;

use crate::disk::BlockDevice;
use crate::param::{BLOCK_SIZE, NBUCKET, NBUF};
use crate::{BlockData, BlockNum, DeviceId};
use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec;
use buffer::{BufferHeader, NIL};
use core::fmt;
use core::mem::ManuallyDrop;
use core::ops::{Deref, DerefMut};
use core::ptr;
use core::sync::atomic::{AtomicU64, Ordering};
use global::GlobalLru;
use kestrel_hal::cpu::CpuTopology;
use kestrel_hal::sync::{SleepLock, SleepLockGuard};
use sharded::ShardedLru;

// ============================================================================
// Backend Interface
// ============================================================================

/// How a lookup found its slot
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LookupKind {
    /// The block was cached
    Hit,
    /// A free slot of the block's own list was reused
    Recycled,
    /// A free slot was taken from another bucket
    Migrated {
        /// Bucket the slot came from
        from: usize,
    },
}

/// Result of [`CacheBackend::get`]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Lookup {
    /// Slot now referenced for the block
    pub slot: u32,
    /// How it was found
    pub kind: LookupKind,
}

impl Lookup {
    /// Create new lookup result
    pub const fn new(slot: u32, kind: LookupKind) -> Self {
        Self { slot, kind }
    }

    /// Did the lookup find the block already cached
    pub fn is_hit(&self) -> bool {
        self.kind == LookupKind::Hit
    }
}

/// Recency bookkeeping strategy
///
/// Owns the slot headers and every list lock. Payloads, device I/O and
/// sleep locks stay in [`BufferCache`].
pub trait CacheBackend: Send + Sync {
    /// Get backend name
    fn name(&self) -> &'static str;

    /// Slot headers, indexed by slot
    fn headers(&self) -> &[BufferHeader];

    /// Reference the slot caching `(dev, blockno)`, recycling one if needed
    ///
    /// A recycled slot comes back invalid with a count of one.
    ///
    /// # Panics
    /// `"bget: no buffers"` when every slot is referenced.
    fn get(&self, dev: DeviceId, blockno: BlockNum) -> Lookup;

    /// Drop a reference; at zero the slot becomes most recently used
    fn release(&self, slot: u32);

    /// Add a reference without touching recency
    fn pin(&self, slot: u32);

    /// Drop a reference taken by [`pin`](Self::pin)
    fn unpin(&self, slot: u32);

    /// Check list structure and slot placement; needs a quiescent cache
    fn audit(&self) -> Result<(), AuditError>;
}

/// Inconsistency found by an audit
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AuditError {
    /// Links of a list disagree at `slot`
    BrokenList {
        /// List (bucket) index
        list: usize,
        /// Slot where the walk failed
        slot: u32,
    },
    /// Slots on lists do not add up to the pool size
    Lost {
        /// Slots found on lists
        listed: usize,
        /// Slots in the pool
        buffers: usize,
    },
    /// A slot is on a list twice
    ListedTwice {
        /// The slot
        slot: u32,
    },
    /// A slot sits in a bucket its block does not hash to
    Misplaced {
        /// The slot
        slot: u32,
        /// Bucket it was found in
        bucket: usize,
    },
    /// Two slots hold the same block
    Duplicate {
        /// Device
        dev: DeviceId,
        /// Block number
        blockno: BlockNum,
    },
}

impl fmt::Display for AuditError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuditError::BrokenList { list, slot } => {
                write!(f, "list {} broken at slot {}", list, slot)
            }
            AuditError::Lost { listed, buffers } => {
                write!(f, "{} of {} buffers on lists", listed, buffers)
            }
            AuditError::ListedTwice { slot } => write!(f, "slot {} listed twice", slot),
            AuditError::Misplaced { slot, bucket } => {
                write!(f, "slot {} misplaced in bucket {}", slot, bucket)
            }
            AuditError::Duplicate { dev, blockno } => {
                write!(f, "block {}/{} cached twice", dev, blockno)
            }
        }
    }
}

/// Check that every listed slot appears once and no block is cached twice
pub(crate) fn audit_identities(
    headers: &[BufferHeader],
    listed: impl Iterator<Item = u32>,
) -> Result<(), AuditError> {
    let mut seen = vec![false; headers.len()];
    let mut blocks = BTreeMap::new();
    for slot in listed {
        if core::mem::replace(&mut seen[slot as usize], true) {
            return Err(AuditError::ListedTwice { slot });
        }
        let header = &headers[slot as usize];
        if !header.has_identity() {
            continue;
        }
        let (dev, blockno) = (header.dev(), header.blockno());
        if blocks.insert((dev, blockno), slot).is_some() {
            return Err(AuditError::Duplicate { dev, blockno });
        }
    }
    Ok(())
}

// ============================================================================
// Configuration
// ============================================================================

/// Recency strategy selection
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CacheStrategy {
    /// One list, one lock
    Global,
    /// `buckets` lists, each with its own lock
    Sharded {
        /// Number of buckets
        buckets: usize,
    },
}

impl Default for CacheStrategy {
    fn default() -> Self {
        Self::Sharded { buckets: NBUCKET }
    }
}

/// Buffer cache configuration
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CacheConfig {
    /// Number of buffers
    pub buffers: usize,
    /// Recency strategy
    pub strategy: CacheStrategy,
}

impl CacheConfig {
    /// Set the number of buffers
    pub const fn buffers(mut self, buffers: usize) -> Self {
        self.buffers = buffers;
        self
    }

    /// Set the strategy
    pub const fn strategy(mut self, strategy: CacheStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    /// One global list
    pub const fn global() -> Self {
        Self {
            buffers: NBUF,
            strategy: CacheStrategy::Global,
        }
    }

    /// `buckets` sharded lists
    pub const fn sharded(buckets: usize) -> Self {
        Self {
            buffers: NBUF,
            strategy: CacheStrategy::Sharded { buckets },
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            buffers: NBUF,
            strategy: CacheStrategy::default(),
        }
    }
}

// ============================================================================
// Statistics
// ============================================================================

/// Cache statistics
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Reads that found the block cached
    pub hits: u64,
    /// Reads that had to recycle a slot
    pub misses: u64,
    /// Blocks read from the device
    pub disk_reads: u64,
    /// Blocks written to the device
    pub disk_writes: u64,
    /// Slots migrated from another bucket
    pub remote_evictions: u64,
}

impl CacheStats {
    /// Hit rate in percent
    pub fn hit_rate(&self) -> f32 {
        let lookups = self.hits + self.misses;
        if lookups == 0 {
            return 0.0;
        }
        (self.hits as f32 / lookups as f32) * 100.0
    }
}

#[derive(Debug, Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    disk_reads: AtomicU64,
    disk_writes: AtomicU64,
    remote_evictions: AtomicU64,
}

impl Counters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            disk_reads: self.disk_reads.load(Ordering::Relaxed),
            disk_writes: self.disk_writes.load(Ordering::Relaxed),
            remote_evictions: self.remote_evictions.load(Ordering::Relaxed),
        }
    }
}

// ============================================================================
// Buffer Cache
// ============================================================================

/// Buffer cache manager.
pub struct BufferCache {
    /// Payloads, indexed by slot
    slots: Box<[SleepLock<BlockData>]>,
    /// Identity, counts and recency
    backend: Box<dyn CacheBackend>,
    /// Where blocks come from
    device: Arc<dyn BlockDevice>,
    /// Used to yield while a buffer is locked elsewhere
    cpu: Arc<dyn CpuTopology>,
    /// Statistics
    stats: Counters,
}

impl BufferCache {
    /// Build the cache described by `config`
    ///
    /// # Panics
    /// On zero buffers or zero buckets.
    pub fn new(
        config: &CacheConfig,
        device: Arc<dyn BlockDevice>,
        cpu: Arc<dyn CpuTopology>,
    ) -> Self {
        assert!(
            config.buffers > 0 && config.buffers < NIL as usize,
            "binit: invalid buffer count {}",
            config.buffers
        );
        let backend: Box<dyn CacheBackend> = match config.strategy {
            CacheStrategy::Global => Box::new(GlobalLru::new(config.buffers)),
            CacheStrategy::Sharded { buckets } => {
                Box::new(ShardedLru::new(config.buffers, buckets))
            }
        };
        Self::with_backend(backend, device, cpu)
    }

    /// Build a cache over a caller-supplied backend
    pub fn with_backend(
        backend: Box<dyn CacheBackend>,
        device: Arc<dyn BlockDevice>,
        cpu: Arc<dyn CpuTopology>,
    ) -> Self {
        let slots = (0..backend.headers().len())
            .map(|_| SleepLock::new([0; BLOCK_SIZE], "buffer"))
            .collect();

        log::info!(
            "binit: {} buffers of {} bytes ({})",
            backend.headers().len(),
            BLOCK_SIZE,
            backend.name()
        );

        Self {
            slots,
            backend,
            device,
            cpu,
            stats: Counters::default(),
        }
    }

    /// Number of buffers
    pub fn buffers(&self) -> usize {
        self.slots.len()
    }

    /// Get backend
    pub fn backend(&self) -> &dyn CacheBackend {
        &*self.backend
    }

    /// Get statistics
    pub fn stats(&self) -> CacheStats {
        self.stats.snapshot()
    }

    /// Check the backend's lists; needs a quiescent cache
    pub fn audit(&self) -> Result<(), AuditError> {
        self.backend.audit()
    }

    /// Return a locked buffer holding the contents of `(dev, blockno)`
    ///
    /// Reads the block from the device if it is not cached. Waits, yielding
    /// the processor, while another context holds the buffer.
    pub fn read(&self, dev: DeviceId, blockno: BlockNum) -> BufferGuard<'_> {
        let lookup = self.backend.get(dev, blockno);
        match lookup.kind {
            LookupKind::Hit => {
                Counters::bump(&self.stats.hits);
                log::trace!("bread: hit {}/{} in slot {}", dev, blockno, lookup.slot);
            }
            LookupKind::Recycled => Counters::bump(&self.stats.misses),
            LookupKind::Migrated { from } => {
                Counters::bump(&self.stats.misses);
                Counters::bump(&self.stats.remote_evictions);
                log::debug!(
                    "bread: {}/{} took slot {} from bucket {}",
                    dev,
                    blockno,
                    lookup.slot,
                    from
                );
            }
        }

        let data = self.slots[lookup.slot as usize].lock(&*self.cpu);
        let mut guard = BufferGuard {
            cache: self,
            slot: lookup.slot,
            data: ManuallyDrop::new(data),
        };

        let header = guard.header();
        if !header.is_valid() {
            self.device.read_block(dev, blockno, &mut guard);
            guard.header().set_valid();
            Counters::bump(&self.stats.disk_reads);
        }
        guard
    }

    /// Write a buffer's contents to the device
    ///
    /// # Panics
    /// `"bwrite: buffer not locked"` if `guard` does not hold a buffer of
    /// this cache.
    pub fn write(&self, guard: &BufferGuard<'_>) {
        if !self.owns(guard) {
            panic!("bwrite: buffer not locked");
        }
        self.device
            .write_block(guard.dev(), guard.blockno(), &guard.data);
        Counters::bump(&self.stats.disk_writes);
    }

    /// Unlock a buffer and drop its reference
    ///
    /// Same as dropping the guard.
    pub fn release(&self, guard: BufferGuard<'_>) {
        if !ptr::eq(guard.cache, self) {
            panic!("brelse: buffer belongs to another cache");
        }
        drop(guard);
    }

    /// Keep a buffer's block cached after its guard is gone
    ///
    /// The pin holds a reference of its own, so the slot is not recycled
    /// until [`unpin`](Self::unpin).
    pub fn pin(&self, guard: &BufferGuard<'_>) -> PinnedBuf {
        if !self.owns(guard) {
            panic!("bpin: buffer not locked");
        }
        self.backend.pin(guard.slot);
        PinnedBuf {
            slot: guard.slot,
            dev: guard.dev(),
            blockno: guard.blockno(),
        }
    }

    /// Drop the reference held by `pin`
    pub fn unpin(&self, pin: PinnedBuf) {
        let header = self.backend.headers().get(pin.slot as usize);
        if !header.is_some_and(|h| h.holds(pin.dev, pin.blockno) && h.refcnt() > 0) {
            panic!("bunpin: {}/{} not pinned", pin.dev, pin.blockno);
        }
        self.backend.unpin(pin.slot);
    }

    fn owns(&self, guard: &BufferGuard<'_>) -> bool {
        ptr::eq(guard.cache, self) && self.slots[guard.slot as usize].holding(&guard.data)
    }
}

impl fmt::Debug for BufferCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferCache")
            .field("buffers", &self.slots.len())
            .field("backend", &self.backend.name())
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

/// A locked buffer
///
/// Derefs to the block's bytes. Dropping it unlocks the buffer and drops
/// its reference.
pub struct BufferGuard<'a> {
    cache: &'a BufferCache,
    slot: u32,
    data: ManuallyDrop<SleepLockGuard<'a, BlockData>>,
}

impl BufferGuard<'_> {
    /// Device of the cached block
    pub fn dev(&self) -> DeviceId {
        self.header().dev()
    }

    /// Block number of the cached block
    pub fn blockno(&self) -> BlockNum {
        self.header().blockno()
    }

    /// Slot index within the cache
    pub fn slot(&self) -> u32 {
        self.slot
    }

    fn header(&self) -> &BufferHeader {
        &self.cache.backend.headers()[self.slot as usize]
    }
}

impl Deref for BufferGuard<'_> {
    type Target = BlockData;

    fn deref(&self) -> &BlockData {
        &self.data
    }
}

impl DerefMut for BufferGuard<'_> {
    fn deref_mut(&mut self) -> &mut BlockData {
        &mut self.data
    }
}

impl Drop for BufferGuard<'_> {
    fn drop(&mut self) {
        // SAFETY: `data` is not touched again after this.
        unsafe { ManuallyDrop::drop(&mut self.data) };
        self.cache.backend.release(self.slot);
    }
}

impl fmt::Debug for BufferGuard<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferGuard")
            .field("slot", &self.slot)
            .field("dev", &self.dev())
            .field("blockno", &self.blockno())
            .finish()
    }
}

/// An unlocked reference keeping a block cached
#[derive(Debug, PartialEq, Eq)]
#[must_use = "a dropped pin keeps its buffer referenced forever; pass it to `unpin`"]
pub struct PinnedBuf {
    slot: u32,
    dev: DeviceId,
    blockno: BlockNum,
}

impl PinnedBuf {
    /// Device of the pinned block
    pub fn dev(&self) -> DeviceId {
        self.dev
    }

    /// Block number of the pinned block
    pub fn blockno(&self) -> BlockNum {
        self.blockno
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::RamDisk;
    use kestrel_hal::hosted::ThreadCpus;

    pub fn cache(config: CacheConfig) -> (BufferCache, Arc<RamDisk>) {
        let disk = Arc::new(RamDisk::new());
        let cache = BufferCache::new(&config, disk.clone(), Arc::new(ThreadCpus::new(4)));
        (cache, disk)
    }
}

#[cfg(test)]
mod tests {
    use super::testing::cache;
    use super::*;

    fn configs() -> [CacheConfig; 2] {
        [CacheConfig::global().buffers(4), CacheConfig::sharded(3).buffers(4)]
    }

    #[test]
    fn test_read_loads_once() {
        for config in configs() {
            let (cache, disk) = cache(config);
            disk.load(1, 5, &[7; BLOCK_SIZE]);

            let buf = cache.read(1, 5);
            assert_eq!(buf[0], 7);
            assert_eq!((buf.dev(), buf.blockno()), (1, 5));
            cache.release(buf);

            let buf = cache.read(1, 5);
            assert_eq!(buf[BLOCK_SIZE - 1], 7);
            drop(buf);

            assert_eq!(disk.reads(), 1);
            let stats = cache.stats();
            assert_eq!((stats.hits, stats.misses, stats.disk_reads), (1, 1, 1));
        }
    }

    #[test]
    fn test_highest_device_id() {
        for config in configs() {
            let (cache, disk) = cache(config);
            disk.load(DeviceId::MAX, 0, &[9; BLOCK_SIZE]);

            // Fresh slots must not alias (MAX, 0) or (0, 0).
            assert_eq!(cache.read(DeviceId::MAX, 0)[0], 9);
            assert_eq!(cache.read(0, 0)[0], 0);
            assert_eq!(cache.read(DeviceId::MAX, 0)[0], 9);

            assert_eq!(disk.reads(), 2);
            assert_eq!(cache.audit(), Ok(()));
        }
    }

    #[test]
    fn test_write_through() {
        let (cache, disk) = cache(CacheConfig::default());
        let mut buf = cache.read(2, 9);
        buf[0] = 0x42;
        cache.write(&buf);
        drop(buf);

        assert_eq!(disk.peek(2, 9)[0], 0x42);
        assert_eq!(cache.stats().disk_writes, 1);
    }

    #[test]
    fn test_modification_survives_release() {
        let (cache, disk) = cache(CacheConfig::global().buffers(2));
        let mut buf = cache.read(1, 1);
        buf[10] = 3;
        drop(buf);

        assert_eq!(cache.read(1, 1)[10], 3);
        assert_eq!(disk.writes(), 0);
    }

    #[test]
    #[should_panic(expected = "bwrite: buffer not locked")]
    fn test_write_foreign_guard() {
        let (a, _) = cache(CacheConfig::global().buffers(1));
        let (b, _) = cache(CacheConfig::global().buffers(1));
        let buf = a.read(1, 1);
        b.write(&buf);
    }

    #[test]
    fn test_pin_survives_pressure() {
        for config in configs() {
            let (cache, disk) = cache(config);
            let buf = cache.read(1, 0);
            let pin = cache.pin(&buf);
            drop(buf);

            for blockno in 1..20 {
                drop(cache.read(1, blockno));
            }
            let reads = disk.reads();
            drop(cache.read(1, 0));
            assert_eq!(disk.reads(), reads);

            cache.unpin(pin);
            assert_eq!(cache.audit(), Ok(()));
        }
    }

    #[test]
    #[should_panic(expected = "bunpin")]
    fn test_unpin_recycled() {
        let (cache, _) = cache(CacheConfig::global().buffers(1));
        let buf = cache.read(1, 0);
        let pin = cache.pin(&buf);
        let stale = PinnedBuf { ..pin };
        drop(buf);
        cache.unpin(pin);

        // The only slot now caches block 1, so the stale pin matches nothing.
        drop(cache.read(1, 1));
        cache.unpin(stale);
    }

    #[test]
    #[should_panic(expected = "binit")]
    fn test_zero_buffers() {
        let _ = cache(CacheConfig::default().buffers(0));
    }

    #[test]
    fn test_config_defaults() {
        let config = CacheConfig::default();
        assert_eq!(config.buffers, NBUF);
        assert_eq!(config.strategy, CacheStrategy::Sharded { buckets: NBUCKET });
        assert_eq!(
            CacheConfig::global().strategy(CacheStrategy::Sharded { buckets: 5 }),
            CacheConfig::sharded(5)
        );
    }

    #[test]
    fn test_hit_rate() {
        let stats = CacheStats {
            hits: 3,
            misses: 1,
            ..CacheStats::default()
        };
        assert_eq!(stats.hit_rate(), 75.0);
        assert_eq!(CacheStats::default().hit_rate(), 0.0);
    }
}

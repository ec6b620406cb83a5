//! Hash-sharded recency lists.
//!
//! Block `b` lives in bucket `b % buckets`. A miss first recycles within
//! that home bucket and otherwise takes the least recently used free slot
//! of the other buckets, in rotation from `home + 1`, moving it home.
//!
//! At most one bucket lock is held at any time. While a slot migrates it
//! is on no list at all, so another context may miss on the same block and
//! migrate a second slot. The home bucket is searched again before the
//! migrated slot is linked in: if the block arrived meanwhile, that buffer
//! is used and the migrated slot is parked, identity cleared, at the cold
//! end of the home bucket.

use super::buffer::BufferHeader;
use super::lru::LruList;
use super::{audit_identities, AuditError, CacheBackend, Lookup, LookupKind};
use crate::{BlockNum, DeviceId};
use alloc::boxed::Box;
use spin::Mutex;

/// Sharded LRU backend
#[derive(Debug)]
pub struct ShardedLru {
    headers: Box<[BufferHeader]>,
    buckets: Box<[Mutex<LruList>]>,
}

impl ShardedLru {
    /// Create `buffers` empty slots spread round-robin over `buckets` lists
    pub fn new(buffers: usize, buckets: usize) -> Self {
        assert!(buckets > 0, "binit: sharded cache needs at least one bucket");

        let headers: Box<[BufferHeader]> = (0..buffers).map(|_| BufferHeader::new()).collect();
        let mut lists: Box<[LruList]> = (0..buckets).map(|_| LruList::new()).collect();
        for slot in 0..buffers as u32 {
            lists[slot as usize % buckets].push_back(&headers, slot);
        }

        Self {
            headers,
            buckets: lists.into_vec().into_iter().map(Mutex::new).collect(),
        }
    }

    /// Number of buckets
    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    /// Home bucket of `blockno`
    #[inline]
    pub fn bucket_of(&self, blockno: BlockNum) -> usize {
        blockno as usize % self.buckets.len()
    }

    /// Slots on each bucket's list
    pub fn bucket_lengths(&self) -> alloc::vec::Vec<usize> {
        self.buckets.iter().map(|bucket| bucket.lock().len()).collect()
    }

    /// Bucket whose list holds `slot`, which must be referenced
    fn bucket_of_slot(&self, slot: u32) -> &Mutex<LruList> {
        let header = &self.headers[slot as usize];
        &self.buckets[self.bucket_of(header.blockno())]
    }

    /// Unlink the coldest free slot of another bucket and claim it
    fn take_remote(&self, home: usize, dev: DeviceId, blockno: BlockNum) -> Option<(u32, usize)> {
        let count = self.buckets.len();
        for step in 1..count {
            let from = (home + step) % count;
            let mut bucket = self.buckets[from].lock();
            if let Some(slot) = bucket.find_victim(&self.headers) {
                bucket.unlink(&self.headers, slot);
                self.headers[slot as usize].recycle(dev, blockno);
                return Some((slot, from));
            }
        }
        None
    }
}

impl CacheBackend for ShardedLru {
    fn name(&self) -> &'static str {
        "sharded lru"
    }

    fn headers(&self) -> &[BufferHeader] {
        &self.headers
    }

    fn get(&self, dev: DeviceId, blockno: BlockNum) -> Lookup {
        let home = self.bucket_of(blockno);
        {
            let bucket = self.buckets[home].lock();
            if let Some(slot) = bucket.find(&self.headers, dev, blockno) {
                self.headers[slot as usize].acquire();
                return Lookup::new(slot, LookupKind::Hit);
            }
            if let Some(slot) = bucket.find_victim(&self.headers) {
                self.headers[slot as usize].recycle(dev, blockno);
                return Lookup::new(slot, LookupKind::Recycled);
            }
        }

        let Some((slot, from)) = self.take_remote(home, dev, blockno) else {
            panic!("bget: no buffers");
        };

        let mut bucket = self.buckets[home].lock();
        if let Some(existing) = bucket.find(&self.headers, dev, blockno) {
            self.headers[existing as usize].acquire();
            self.headers[slot as usize].forget();
            bucket.push_back(&self.headers, slot);
            return Lookup::new(existing, LookupKind::Hit);
        }
        bucket.push_front(&self.headers, slot);
        Lookup::new(slot, LookupKind::Migrated { from })
    }

    fn release(&self, slot: u32) {
        let mut bucket = self.bucket_of_slot(slot).lock();
        if self.headers[slot as usize].release("brelse") == 0 {
            bucket.touch(&self.headers, slot);
        }
    }

    fn pin(&self, slot: u32) {
        let _bucket = self.bucket_of_slot(slot).lock();
        self.headers[slot as usize].acquire();
    }

    fn unpin(&self, slot: u32) {
        let _bucket = self.bucket_of_slot(slot).lock();
        self.headers[slot as usize].release("bunpin");
    }

    fn audit(&self) -> Result<(), AuditError> {
        let mut listed = 0;
        for (index, bucket) in self.buckets.iter().enumerate() {
            let bucket = bucket.lock();
            listed += bucket
                .check(&self.headers)
                .map_err(|slot| AuditError::BrokenList { list: index, slot })?;

            for slot in bucket.iter(&self.headers) {
                let header = &self.headers[slot as usize];
                if header.has_identity() && self.bucket_of(header.blockno()) != index {
                    return Err(AuditError::Misplaced {
                        slot,
                        bucket: index,
                    });
                }
            }
        }
        if listed != self.headers.len() {
            return Err(AuditError::Lost {
                listed,
                buffers: self.headers.len(),
            });
        }

        let guards: alloc::vec::Vec<_> = self.buckets.iter().map(|bucket| bucket.lock()).collect();
        audit_identities(
            &self.headers,
            guards.iter().flat_map(|bucket| bucket.iter(&self.headers)),
        )
    }
}

//! One recency list for every buffer, behind one lock.

use super::buffer::BufferHeader;
use super::lru::LruList;
use super::{audit_identities, AuditError, CacheBackend, Lookup, LookupKind};
use crate::{BlockNum, DeviceId};
use alloc::boxed::Box;
use spin::Mutex;

/// Global LRU backend
#[derive(Debug)]
pub struct GlobalLru {
    headers: Box<[BufferHeader]>,
    list: Mutex<LruList>,
}

impl GlobalLru {
    /// Create `buffers` empty slots, all on the list
    pub fn new(buffers: usize) -> Self {
        let headers: Box<[BufferHeader]> = (0..buffers).map(|_| BufferHeader::new()).collect();
        let mut list = LruList::new();
        for slot in 0..buffers as u32 {
            list.push_back(&headers, slot);
        }
        Self {
            headers,
            list: Mutex::new(list),
        }
    }
}

impl CacheBackend for GlobalLru {
    fn name(&self) -> &'static str {
        "global lru"
    }

    fn headers(&self) -> &[BufferHeader] {
        &self.headers
    }

    fn get(&self, dev: DeviceId, blockno: BlockNum) -> Lookup {
        let list = self.list.lock();

        if let Some(slot) = list.find(&self.headers, dev, blockno) {
            self.headers[slot as usize].acquire();
            return Lookup::new(slot, LookupKind::Hit);
        }

        if let Some(slot) = list.find_victim(&self.headers) {
            self.headers[slot as usize].recycle(dev, blockno);
            return Lookup::new(slot, LookupKind::Recycled);
        }

        drop(list);
        panic!("bget: no buffers");
    }

    fn release(&self, slot: u32) {
        let mut list = self.list.lock();
        if self.headers[slot as usize].release("brelse") == 0 {
            list.touch(&self.headers, slot);
        }
    }

    fn pin(&self, slot: u32) {
        let _list = self.list.lock();
        self.headers[slot as usize].acquire();
    }

    fn unpin(&self, slot: u32) {
        let _list = self.list.lock();
        self.headers[slot as usize].release("bunpin");
    }

    fn audit(&self) -> Result<(), AuditError> {
        let list = self.list.lock();
        let seen = list
            .check(&self.headers)
            .map_err(|slot| AuditError::BrokenList { list: 0, slot })?;
        if seen != self.headers.len() {
            return Err(AuditError::Lost {
                listed: seen,
                buffers: self.headers.len(),
            });
        }
        audit_identities(&self.headers, list.iter(&self.headers))
    }
}

//! Index-linked recency lists.
//!
//! The links live in the [`BufferHeader`]s of a fixed arena; a list only
//! keeps its two ends. The head is the most recently used slot and the
//! tail the least recently used one. Every method must be called with the
//! lock guarding the list held, and a slot is on at most one list.

use super::buffer::{BufferHeader, NIL};
use crate::{BlockNum, DeviceId};

/// One recency list
#[derive(Debug)]
pub struct LruList {
    head: u32,
    tail: u32,
    len: usize,
}

impl LruList {
    /// Create an empty list
    pub const fn new() -> Self {
        Self {
            head: NIL,
            tail: NIL,
            len: 0,
        }
    }

    /// Number of slots on the list
    pub fn len(&self) -> usize {
        self.len
    }

    /// Check if empty
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Insert `slot` as most recently used
    pub fn push_front(&mut self, headers: &[BufferHeader], slot: u32) {
        let header = &headers[slot as usize];
        header.set_prev(NIL);
        header.set_next(self.head);
        match self.head {
            NIL => self.tail = slot,
            head => headers[head as usize].set_prev(slot),
        }
        self.head = slot;
        self.len += 1;
    }

    /// Insert `slot` as least recently used
    pub fn push_back(&mut self, headers: &[BufferHeader], slot: u32) {
        let header = &headers[slot as usize];
        header.set_next(NIL);
        header.set_prev(self.tail);
        match self.tail {
            NIL => self.head = slot,
            tail => headers[tail as usize].set_next(slot),
        }
        self.tail = slot;
        self.len += 1;
    }

    /// Take `slot` off the list
    pub fn unlink(&mut self, headers: &[BufferHeader], slot: u32) {
        let header = &headers[slot as usize];
        let (prev, next) = (header.prev(), header.next());
        match prev {
            NIL => self.head = next,
            prev => headers[prev as usize].set_next(next),
        }
        match next {
            NIL => self.tail = prev,
            next => headers[next as usize].set_prev(prev),
        }
        header.set_prev(NIL);
        header.set_next(NIL);
        self.len -= 1;
    }

    /// Move `slot`, already on this list, to the front
    pub fn touch(&mut self, headers: &[BufferHeader], slot: u32) {
        if self.head != slot {
            self.unlink(headers, slot);
            self.push_front(headers, slot);
        }
    }

    /// Slots from most to least recently used
    pub fn iter<'a>(&self, headers: &'a [BufferHeader]) -> Iter<'a> {
        Iter {
            headers,
            cursor: self.head,
            backwards: false,
        }
    }

    /// Slots from least to most recently used
    pub fn iter_rev<'a>(&self, headers: &'a [BufferHeader]) -> Iter<'a> {
        Iter {
            headers,
            cursor: self.tail,
            backwards: true,
        }
    }

    /// First slot holding `(dev, blockno)`, most recent first
    pub fn find(
        &self,
        headers: &[BufferHeader],
        dev: DeviceId,
        blockno: BlockNum,
    ) -> Option<u32> {
        self.iter(headers)
            .find(|&slot| headers[slot as usize].holds(dev, blockno))
    }

    /// Least recently used slot nobody references
    pub fn find_victim(&self, headers: &[BufferHeader]) -> Option<u32> {
        self.iter_rev(headers)
            .find(|&slot| headers[slot as usize].refcnt() == 0)
    }

    /// Walk the list checking both link directions; returns the length seen
    pub fn check(&self, headers: &[BufferHeader]) -> Result<usize, u32> {
        let mut prev = NIL;
        let mut seen = 0;
        let mut cursor = self.head;
        while cursor != NIL {
            let header = headers.get(cursor as usize).ok_or(prev)?;
            if header.prev() != prev || seen >= headers.len() {
                return Err(cursor);
            }
            seen += 1;
            prev = cursor;
            cursor = header.next();
        }
        if prev != self.tail || seen != self.len {
            return Err(self.tail);
        }
        Ok(seen)
    }
}

impl Default for LruList {
    fn default() -> Self {
        Self::new()
    }
}

/// Iterator over the slots of an [`LruList`]
#[derive(Debug)]
pub struct Iter<'a> {
    headers: &'a [BufferHeader],
    cursor: u32,
    backwards: bool,
}

impl Iterator for Iter<'_> {
    type Item = u32;

    fn next(&mut self) -> Option<u32> {
        if self.cursor == NIL {
            return None;
        }
        let slot = self.cursor;
        let header = &self.headers[slot as usize];
        self.cursor = if self.backwards {
            header.prev()
        } else {
            header.next()
        };
        Some(slot)
    }
}

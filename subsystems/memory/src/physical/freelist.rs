//! # Single Free List
//!
//! Every free frame on one stack behind one spin lock.
//!
//! The stack is intrusive. [`FreeList`] only knows the top frame and the
//! depth; each free frame names the frame below it in its own first bytes.

use super::{AllocatorBackend, FramePool};
use crate::FrameNumber;
use alloc::vec;
use alloc::vec::Vec;
use spin::Mutex;

/// Intrusive stack of free frames
#[derive(Debug, Default)]
pub struct FreeList {
    /// Frame handed out next
    head: Option<FrameNumber>,
    /// Frames on the stack
    len: usize,
}

impl FreeList {
    /// Create an empty list
    pub const fn new() -> Self {
        Self { head: None, len: 0 }
    }

    /// Frames on the list
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the list is empty
    pub fn is_empty(&self) -> bool {
        self.head.is_none()
    }

    /// Put `frame` on top
    ///
    /// # Safety
    /// The caller gives up `frame`, which belongs to `pool`, and holds the
    /// lock guarding this list.
    pub unsafe fn push(&mut self, pool: &FramePool, frame: FrameNumber) {
        // SAFETY: the frame is ours now.
        unsafe { pool.set_link(frame, self.head) };
        self.head = Some(frame);
        self.len += 1;
    }

    /// Take the top frame
    pub fn pop(&mut self, pool: &FramePool) -> Option<FrameNumber> {
        let frame = self.head?;
        // SAFETY: `frame` is on this list and `&mut self` means we hold its lock.
        self.head = unsafe { pool.link(frame) };
        self.len -= 1;
        Some(frame)
    }

    /// Walk the list from the top
    ///
    /// At most `len` frames are visited, so a frame pushed twice shows up
    /// repeatedly instead of looping forever.
    pub fn for_each(&self, pool: &FramePool, visit: &mut dyn FnMut(FrameNumber)) {
        let mut next = self.head;
        for _ in 0..self.len {
            let Some(frame) = next else { break };
            visit(frame);
            // SAFETY: as in `pop`; the shared borrow comes from a held lock.
            next = unsafe { pool.link(frame) };
        }
    }
}

/// One shared free list
#[derive(Debug, Default)]
pub struct SingleFreeList {
    list: Mutex<FreeList>,
}

impl SingleFreeList {
    /// Create an empty list
    pub const fn new() -> Self {
        Self {
            list: Mutex::new(FreeList::new()),
        }
    }
}

impl AllocatorBackend for SingleFreeList {
    fn name(&self) -> &'static str {
        "single free list"
    }

    unsafe fn seed(&self, pool: &FramePool, frames: &mut dyn Iterator<Item = FrameNumber>) {
        let mut list = self.list.lock();
        for frame in frames {
            // SAFETY: seeded frames are unused and handed over once.
            unsafe { list.push(pool, frame) };
        }
    }

    fn pop(&self, pool: &FramePool) -> Option<FrameNumber> {
        self.list.lock().pop(pool)
    }

    unsafe fn push(&self, pool: &FramePool, frame: FrameNumber) {
        // SAFETY: forwarded from the caller.
        unsafe { self.list.lock().push(pool, frame) };
    }

    fn list_lengths(&self) -> Vec<usize> {
        vec![self.list.lock().len()]
    }

    fn for_each_free(&self, pool: &FramePool, visit: &mut dyn FnMut(FrameNumber)) {
        self.list.lock().for_each(pool, visit);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::physical::testing::pool;

    #[test]
    fn test_lifo_order() {
        let pool = pool(3);
        let list = SingleFreeList::new();
        unsafe {
            list.seed(&pool, &mut (0..3).map(FrameNumber::new));
        }

        assert_eq!(list.free_frames(), 3);
        assert_eq!(list.pop(&pool), Some(FrameNumber::new(2)));

        unsafe { list.push(&pool, FrameNumber::new(0)) };
        assert_eq!(list.pop(&pool), Some(FrameNumber::new(0)));
        assert_eq!(list.pop(&pool), Some(FrameNumber::new(1)));
        assert_eq!(list.pop(&pool), Some(FrameNumber::new(0)));
        assert_eq!(list.pop(&pool), None);
        assert_eq!(list.list_lengths(), vec![0]);
        assert_eq!(list.steals(), 0);
    }

    #[test]
    fn test_links_stored_in_frames() {
        let pool = pool(4);
        let mut list = FreeList::new();
        for frame in [0, 3, 1].map(FrameNumber::new) {
            unsafe { list.push(&pool, frame) };
        }

        unsafe {
            assert_eq!(pool.link(FrameNumber::new(1)), Some(FrameNumber::new(3)));
            assert_eq!(pool.link(FrameNumber::new(3)), Some(FrameNumber::new(0)));
            assert_eq!(pool.link(FrameNumber::new(0)), None);
        }

        let mut order = Vec::new();
        list.for_each(&pool, &mut |frame| order.push(frame.index()));
        assert_eq!(order, vec![1, 3, 0]);
    }

    #[test]
    fn test_walk_bounded_after_double_push() {
        let pool = pool(2);
        let mut list = FreeList::new();
        let frame = FrameNumber::new(1);
        unsafe {
            list.push(&pool, frame);
            list.push(&pool, frame);
        }

        let mut visits = 0;
        list.for_each(&pool, &mut |seen| {
            assert_eq!(seen, frame);
            visits += 1;
        });
        assert_eq!(visits, 2);
    }
}

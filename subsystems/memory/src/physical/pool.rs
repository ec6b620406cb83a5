//! # Frame Pool
//!
//! The managed physical range and the kernel's window onto it. Frame
//! contents are only reachable through here, and frame numbers are only
//! minted here.

use super::PhysicalRegion;
use crate::param::{MAX_FRAMES, PAGE_SIZE};
use crate::{Frame, FrameNumber, MemError, MemResult};
use core::ptr::{self, NonNull};
use core::slice;
use kestrel_hal::PhysAddr;

/// Bytes at the start of a free frame that hold the next free frame's number
pub const LINK_BYTES: usize = core::mem::size_of::<u32>();

/// Link value ending a free list
const END_OF_LIST: u32 = u32::MAX;

/// Managed range of page frames
pub struct FramePool {
    /// First managed frame (page aligned)
    base: PhysAddr,
    /// Number of whole frames
    frames: usize,
    /// Kernel mapping of `base`
    window: NonNull<u8>,
}

// SAFETY: the pool only hands out raw access to frames through unsafe
// methods whose callers own the frame; the window itself is never aliased
// mutably by the pool.
unsafe impl Send for FramePool {}
unsafe impl Sync for FramePool {}

impl FramePool {
    /// Take over the frames of `region`
    ///
    /// The start is rounded up to a page boundary and a trailing partial
    /// page is ignored.
    ///
    /// # Safety
    /// `window` must be the kernel mapping of `region.start`, valid for
    /// reads and writes of `region.size` bytes for the rest of the program,
    /// and not accessed by anything else afterwards.
    pub unsafe fn new(region: PhysicalRegion, window: NonNull<u8>) -> MemResult<Self> {
        let start = region.start.align_up(PAGE_SIZE);
        let end = region.end().align_down(PAGE_SIZE);
        if start >= end {
            return Err(MemError::InvalidRegion);
        }

        let frames = ((end.as_u64() - start.as_u64()) / PAGE_SIZE) as usize;
        if frames > MAX_FRAMES {
            return Err(MemError::InvalidRegion);
        }

        let skip = (start.as_u64() - region.start.as_u64()) as usize;
        // SAFETY: skip < region.size because start < end <= region.end().
        let window = unsafe { NonNull::new_unchecked(window.as_ptr().add(skip)) };

        Ok(Self {
            base: start,
            frames,
            window,
        })
    }

    /// Take over a static memory block standing at physical address `start`
    pub fn from_static(start: PhysAddr, memory: &'static mut [u8]) -> MemResult<Self> {
        let region = PhysicalRegion::new(start, memory.len() as u64);
        let window = NonNull::from(memory).cast::<u8>();
        // SAFETY: the exclusive 'static borrow moves into the pool.
        unsafe { Self::new(region, window) }
    }

    /// First managed address
    pub fn base(&self) -> PhysAddr {
        self.base
    }

    /// One past the last managed address
    pub fn end(&self) -> PhysAddr {
        self.base.add(self.frames as u64 * PAGE_SIZE)
    }

    /// Number of frames under management
    pub fn total_frames(&self) -> usize {
        self.frames
    }

    /// Validate `frame` and turn it into a table index
    pub fn frame_number(&self, frame: Frame) -> MemResult<FrameNumber> {
        let addr = frame.address();
        if addr < self.base || addr >= self.end() {
            return Err(MemError::InvalidAddress);
        }
        Ok(FrameNumber::new(
            ((addr.as_u64() - self.base.as_u64()) / PAGE_SIZE) as u32,
        ))
    }

    /// Validate a raw address as the start of a managed frame
    pub fn checked_frame(&self, addr: PhysAddr) -> MemResult<Frame> {
        let frame = Frame::from_start(addr)?;
        self.frame_number(frame)?;
        Ok(frame)
    }

    /// The frame with index `number`
    pub fn frame(&self, number: FrameNumber) -> Frame {
        Frame::containing(self.base.add(number.index() as u64 * PAGE_SIZE))
    }

    /// Every frame number, ascending
    pub fn numbers(&self) -> impl Iterator<Item = FrameNumber> {
        (0..self.frames as u32).map(FrameNumber::new)
    }

    /// View a frame's bytes
    ///
    /// # Safety
    /// Nobody may write the frame while the slice is alive.
    pub unsafe fn bytes(&self, frame: Frame) -> MemResult<&[u8]> {
        let number = self.frame_number(frame)?;
        // SAFETY: in range; the caller rules out concurrent writers.
        Ok(unsafe { slice::from_raw_parts(self.ptr(number), PAGE_SIZE as usize) })
    }

    /// Mutably view a frame's bytes
    ///
    /// # Safety
    /// The caller must own the frame and nobody else may access it while
    /// the slice is alive.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn bytes_mut(&self, frame: Frame) -> MemResult<&mut [u8]> {
        let number = self.frame_number(frame)?;
        // SAFETY: in range; the caller guarantees exclusive access.
        Ok(unsafe { slice::from_raw_parts_mut(self.ptr(number), PAGE_SIZE as usize) })
    }

    /// Overwrite a whole frame with `byte`
    ///
    /// # Safety
    /// The caller must own the frame exclusively.
    pub(crate) unsafe fn fill(&self, number: FrameNumber, byte: u8) {
        // SAFETY: in range by construction of FrameNumber; exclusive per caller.
        unsafe { ptr::write_bytes(self.ptr(number), byte, PAGE_SIZE as usize) }
    }

    /// Copy the contents of `src` into `dst`
    ///
    /// # Safety
    /// The caller must own `dst` exclusively and nobody may write `src`
    /// during the copy.
    pub(crate) unsafe fn copy(&self, src: FrameNumber, dst: FrameNumber) {
        // SAFETY: distinct in-range frames never overlap.
        unsafe { ptr::copy_nonoverlapping(self.ptr(src), self.ptr(dst), PAGE_SIZE as usize) }
    }

    /// Read the free-list link stored in a free frame
    ///
    /// # Panics
    /// If `number` or the stored link lies outside the pool.
    ///
    /// # Safety
    /// `number` must be on a free list whose lock the caller holds.
    pub(crate) unsafe fn link(&self, number: FrameNumber) -> Option<FrameNumber> {
        self.check_link(number);
        // SAFETY: in range; free frames are only touched under their list lock.
        let next = unsafe { ptr::read_unaligned(self.ptr(number).cast::<u32>()) };
        match next {
            END_OF_LIST => None,
            next if (next as usize) < self.frames => Some(FrameNumber::new(next)),
            next => panic!("kalloc: free frame {} links to {}", number.index(), next),
        }
    }

    /// Store `next` as the free-list link of `number`
    ///
    /// # Safety
    /// The caller must own `number` exclusively; it is being put on a free
    /// list whose lock the caller holds.
    pub(crate) unsafe fn set_link(&self, number: FrameNumber, next: Option<FrameNumber>) {
        self.check_link(number);
        let next = next.map_or(END_OF_LIST, |next| next.index() as u32);
        // SAFETY: in range; exclusive per caller.
        unsafe { ptr::write_unaligned(self.ptr(number).cast::<u32>(), next) }
    }

    fn check_link(&self, number: FrameNumber) {
        assert!(
            number.index() < self.frames,
            "kalloc: frame {} outside a pool of {}",
            number.index(),
            self.frames
        );
    }

    fn ptr(&self, number: FrameNumber) -> *mut u8 {
        debug_assert!(number.index() < self.frames);
        // SAFETY: the window covers `frames` whole frames.
        unsafe { self.window.as_ptr().add(number.index() * PAGE_SIZE as usize) }
    }
}

impl core::fmt::Debug for FramePool {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("FramePool")
            .field("base", &self.base)
            .field("frames", &self.frames)
            .finish()
    }
}

//! # MMU Abstraction
//!
//! Page table entry flags. Bit layout follows the RISC-V Sv39 leaf entry;
//! the copy-on-write tag lives in the first software-reserved (RSW) bit.

use bitflags::bitflags;

bitflags! {
    /// Page table entry flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct PageFlags: u64 {
        /// Entry is present (valid)
        const PRESENT = 1 << 0;
        /// Page is readable
        const READABLE = 1 << 1;
        /// Page is writable
        const WRITABLE = 1 << 2;
        /// Page is executable
        const EXECUTABLE = 1 << 3;
        /// Page is accessible from user mode
        const USER = 1 << 4;
        /// Page is global (not flushed on address-space switch)
        const GLOBAL = 1 << 5;
        /// Page has been accessed
        const ACCESSED = 1 << 6;
        /// Page has been written to
        const DIRTY = 1 << 7;
        /// Page is shared copy-on-write (software bit)
        const COW = 1 << 8;
    }
}

impl PageFlags {
    /// Create flags for user read-write data
    pub const fn user_data() -> Self {
        Self::PRESENT
            .union(Self::READABLE)
            .union(Self::WRITABLE)
            .union(Self::USER)
    }

    /// Create flags for user code
    pub const fn user_code() -> Self {
        Self::PRESENT
            .union(Self::READABLE)
            .union(Self::EXECUTABLE)
            .union(Self::USER)
    }

    /// The read-only, copy-on-write form of these flags
    pub const fn shared_cow(self) -> Self {
        self.difference(Self::WRITABLE).union(Self::COW)
    }

    /// The private, writable form of copy-on-write flags
    pub const fn private_writable(self) -> Self {
        self.difference(Self::COW).union(Self::WRITABLE)
    }
}

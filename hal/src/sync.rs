//! # Sleep Lock
//!
//! A mutual-exclusion lock for critical sections that may span device I/O.
//! A context that finds the lock taken gives up the processor through
//! [`CpuTopology::relax`] instead of hammering the lock word, because the
//! holder may be waiting on a disk.
//!
//! Short metadata sections use `spin::Mutex` instead; never take a spin lock
//! and then block on a sleep lock.

use crate::cpu::CpuTopology;
use core::cell::UnsafeCell;
use core::fmt;
use core::ops::{Deref, DerefMut};
use core::ptr;
use core::sync::atomic::{AtomicBool, Ordering};

/// Sleeping mutual-exclusion lock
pub struct SleepLock<T: ?Sized> {
    locked: AtomicBool,
    name: &'static str,
    data: UnsafeCell<T>,
}

// SAFETY: access to `data` is serialized by `locked`; the guard is the only
// path to it.
unsafe impl<T: ?Sized + Send> Send for SleepLock<T> {}
unsafe impl<T: ?Sized + Send> Sync for SleepLock<T> {}

impl<T> SleepLock<T> {
    /// Create a new unlocked sleep lock
    pub const fn new(data: T, name: &'static str) -> Self {
        Self {
            locked: AtomicBool::new(false),
            name,
            data: UnsafeCell::new(data),
        }
    }
}

impl<T: ?Sized> SleepLock<T> {
    /// Acquire the lock, yielding the processor while it is held elsewhere
    pub fn lock<'a>(&'a self, cpu: &dyn CpuTopology) -> SleepLockGuard<'a, T> {
        loop {
            if self
                .locked
                .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
            {
                return SleepLockGuard { lock: self };
            }
            while self.locked.load(Ordering::Relaxed) {
                cpu.relax();
            }
        }
    }

    /// Try to acquire the lock without waiting
    pub fn try_lock(&self) -> Option<SleepLockGuard<'_, T>> {
        self.locked
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .ok()
            .map(|_| SleepLockGuard { lock: self })
    }

    /// Is the lock currently held by anyone
    #[inline]
    pub fn is_locked(&self) -> bool {
        self.locked.load(Ordering::Relaxed)
    }

    /// Does `guard` hold this lock
    pub fn holding(&self, guard: &SleepLockGuard<'_, T>) -> bool {
        ptr::eq(self, guard.lock) && self.is_locked()
    }

    /// Lock name, for diagnostics
    pub fn name(&self) -> &'static str {
        self.name
    }
}

impl<T: ?Sized> fmt::Debug for SleepLock<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SleepLock")
            .field("name", &self.name)
            .field("locked", &self.is_locked())
            .finish_non_exhaustive()
    }
}

/// Exclusive access to the data of a [`SleepLock`]
pub struct SleepLockGuard<'a, T: ?Sized> {
    lock: &'a SleepLock<T>,
}

impl<T: ?Sized> SleepLockGuard<'_, T> {
    /// The lock this guard holds
    pub fn lock(&self) -> &SleepLock<T> {
        self.lock
    }
}

impl<T: ?Sized> Deref for SleepLockGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: the guard proves exclusive ownership of the lock.
        unsafe { &*self.lock.data.get() }
    }
}

impl<T: ?Sized> DerefMut for SleepLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: the guard proves exclusive ownership of the lock.
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T: ?Sized> Drop for SleepLockGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.locked.store(false, Ordering::Release);
    }
}

impl<T: ?Sized> fmt::Debug for SleepLockGuard<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SleepLockGuard")
            .field("name", &self.lock.name)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hosted::ThreadCpus;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_lock_unlock() {
        let cpus = ThreadCpus::new(1);
        let lock = SleepLock::new(5u32, "test");

        {
            let mut guard = lock.lock(&cpus);
            assert!(lock.is_locked());
            assert!(lock.holding(&guard));
            assert!(lock.try_lock().is_none());
            *guard += 1;
        }

        assert!(!lock.is_locked());
        assert_eq!(*lock.try_lock().unwrap(), 6);
    }

    #[test]
    fn test_holding_other_lock() {
        let cpus = ThreadCpus::new(1);
        let a = SleepLock::new((), "a");
        let b = SleepLock::new((), "b");

        let guard = a.lock(&cpus);
        assert!(!b.holding(&guard));
        assert_eq!(guard.lock().name(), "a");
    }

    #[test]
    fn test_contended_increments() {
        let cpus = Arc::new(ThreadCpus::new(4));
        let lock = Arc::new(SleepLock::new(0u64, "counter"));

        let handles: Vec<_> = (0..4)
            .map(|id| {
                let cpus = Arc::clone(&cpus);
                let lock = Arc::clone(&lock);
                thread::spawn(move || {
                    ThreadCpus::bind(id);
                    for _ in 0..1000 {
                        *lock.lock(&*cpus) += 1;
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(*lock.lock(&*cpus), 4000);
    }
}

// SPDX-License-Identifier: MPL-2.0

//! Spinlocks.
//!
//! A spinlock is one machine word with acquire/release fences. Acquiring
//! raises IPL to at least the level of any interrupt that may also take the
//! lock (DPC by default, High for the DPC/timer queues); reentrant
//! acquisition is forbidden.

use core::{
    cell::UnsafeCell,
    hint,
    ops::{Deref, DerefMut},
    sync::atomic::{AtomicBool, Ordering},
};

use super::ipl::{self, Ipl};

/// The bare lock word, for protocol code that interleaves lock and IPL
/// manipulation by hand (dispatcher headers, thread locks, CPU queues).
pub struct RawSpinlock {
    locked: AtomicBool,
}

impl RawSpinlock {
    pub const fn new() -> RawSpinlock {
        RawSpinlock {
            locked: AtomicBool::new(false),
        }
    }

    /// Acquires at IPL = DPC, returning the IPL to restore.
    pub fn acquire(&self) -> Ipl {
        self.acquire_at(Ipl::Dpc)
    }

    /// Acquires at the given IPL, returning the IPL to restore.
    pub fn acquire_at(&self, at: Ipl) -> Ipl {
        let old = ipl::raise(at);
        self.acquire_nospl();
        old
    }

    /// Acquires without touching IPL. The caller is already at a level no
    /// interrupt taking this lock can preempt.
    pub fn acquire_nospl(&self) {
        while self
            .locked
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            while self.locked.load(Ordering::Relaxed) {
                hint::spin_loop();
            }
        }
    }

    pub fn try_acquire_nospl(&self) -> bool {
        self.locked
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    /// Releases and restores IPL.
    pub fn release(&self, old: Ipl) {
        self.release_nospl();
        ipl::lower(old);
    }

    pub fn release_nospl(&self) {
        debug_assert!(self.is_held());
        self.locked.store(false, Ordering::Release);
    }

    pub fn is_held(&self) -> bool {
        self.locked.load(Ordering::Relaxed)
    }
}

impl Default for RawSpinlock {
    fn default() -> Self {
        RawSpinlock::new()
    }
}

/// A value guarded by a spinlock, held through an IPL-restoring guard.
pub struct SpinLock<T> {
    lock: RawSpinlock,
    minimum_ipl: Ipl,
    value: UnsafeCell<T>,
}

unsafe impl<T: Send> Send for SpinLock<T> {}
unsafe impl<T: Send> Sync for SpinLock<T> {}

impl<T> SpinLock<T> {
    pub const fn new(value: T) -> SpinLock<T> {
        SpinLock {
            lock: RawSpinlock::new(),
            minimum_ipl: Ipl::Dpc,
            value: UnsafeCell::new(value),
        }
    }

    /// A lock also taken from contexts above DPC (hardclock, IPI paths).
    pub const fn new_at_high(value: T) -> SpinLock<T> {
        SpinLock {
            lock: RawSpinlock::new(),
            minimum_ipl: Ipl::High,
            value: UnsafeCell::new(value),
        }
    }

    pub fn lock(&self) -> SpinLockGuard<'_, T> {
        let old_ipl = self.lock.acquire_at(self.minimum_ipl);
        SpinLockGuard {
            inner: self,
            old_ipl,
        }
    }

    pub fn is_held(&self) -> bool {
        self.lock.is_held()
    }
}

pub struct SpinLockGuard<'a, T> {
    inner: &'a SpinLock<T>,
    old_ipl: Ipl,
}

impl<T> Deref for SpinLockGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { &*self.inner.value.get() }
    }
}

impl<T> DerefMut for SpinLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.inner.value.get() }
    }
}

impl<T> Drop for SpinLockGuard<'_, T> {
    fn drop(&mut self) {
        self.inner.lock.release(self.old_ipl);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn guard_restores_ipl() {
        let lock = SpinLock::new(5);
        let before = ipl::current();
        {
            let mut guard = lock.lock();
            *guard += 1;
            assert!(ipl::current() >= Ipl::Dpc);
        }
        assert_eq!(ipl::current(), before);
        assert_eq!(*lock.lock(), 6);
    }
}

// SPDX-License-Identifier: MPL-2.0

//! Owner-tracked kernel mutexes.
//!
//! A mutex is a dispatcher object, so acquisition is a wait (IPL <= APC) and
//! `try_lock` is legal at DPC. Releasing a mutex one does not own is a fatal
//! assertion, not an error.

use core::{
    cell::UnsafeCell,
    ops::{Deref, DerefMut},
    sync::atomic::{AtomicPtr, Ordering},
};

use smallvec::SmallVec;

use crate::prelude::*;

use super::{
    ipl,
    object::{self, Dispatcher, DispatcherHeader, WakeQueue},
    sched, thread,
    thread::Thread,
    wait,
};

pub struct Mutex<T = ()> {
    hdr: DispatcherHeader,
    owner: AtomicPtr<Thread>,
    value: UnsafeCell<T>,
}

unsafe impl<T: Send> Send for Mutex<T> {}
unsafe impl<T: Send> Sync for Mutex<T> {}

impl<T: Send> Dispatcher for Mutex<T> {
    fn header(&self) -> &DispatcherHeader {
        &self.hdr
    }

    fn acquire(&self, thread: &Arc<Thread>) {
        self.hdr.adjust_signalled(-1);
        self.owner
            .store(Arc::as_ptr(thread) as *mut Thread, Ordering::Release);
    }
}

impl<T: Send> Mutex<T> {
    pub fn new(value: T) -> Mutex<T> {
        Mutex {
            hdr: DispatcherHeader::new(1),
            owner: AtomicPtr::new(core::ptr::null_mut()),
            value: UnsafeCell::new(value),
        }
    }

    /// Acquires the mutex, blocking as needed.
    pub fn lock(&self) -> MutexGuard<'_, T> {
        wait::wait_one(self, "mutex", false, wait::TIMEOUT_INFINITE)
            .expect("infinite mutex wait cannot fail");
        MutexGuard { mutex: self }
    }

    /// Acquires without blocking. Legal at IPL = DPC.
    pub fn try_lock(&self) -> Option<MutexGuard<'_, T>> {
        let old_ipl = self.hdr.lock.acquire();
        let acquired = self.hdr.signalled() > 0;
        if acquired {
            self.acquire(&thread::current());
        }
        self.hdr.lock.release(old_ipl);
        acquired.then_some(MutexGuard { mutex: self })
    }

    pub fn is_owned_by_current(&self) -> bool {
        let current = thread::current();
        self.owner.load(Ordering::Acquire) == Arc::as_ptr(&current) as *mut Thread
    }

    fn release(&self) {
        let mut wake_queue: WakeQueue = SmallVec::new();

        let old_ipl = self.hdr.lock.acquire();
        let current = thread::current();
        assert_eq!(
            self.owner.load(Ordering::Acquire),
            Arc::as_ptr(&current) as *mut Thread,
            "mutex released by non-owner"
        );
        self.owner.store(core::ptr::null_mut(), Ordering::Release);
        self.hdr.adjust_signalled(1);
        assert!(self.hdr.signalled() <= 1, "mutex over-released");

        object::signal(self, &mut wake_queue);
        self.hdr.lock.release_nospl();

        sched::scheduler_lock().acquire_nospl();
        object::wake_waiters(&wake_queue);
        sched::scheduler_lock().release_nospl();
        ipl::lower(old_ipl);
    }

    pub fn owner_is_none(&self) -> bool {
        self.owner.load(Ordering::Acquire).is_null()
    }
}

pub struct MutexGuard<'a, T: Send = ()> {
    mutex: &'a Mutex<T>,
}

impl<T: Send> Deref for MutexGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { &*self.mutex.value.get() }
    }
}

impl<T: Send> DerefMut for MutexGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.mutex.value.get() }
    }
}

impl<T: Send> Drop for MutexGuard<'_, T> {
    fn drop(&mut self) {
        self.mutex.release();
    }
}

// SPDX-License-Identifier: MPL-2.0

//! A read/write mutex built from dispatcher objects, for locks with a
//! shared-read fast path (notably the per-process map lock).
//!
//! Readers pass through the writer mutex only to register; writers hold the
//! mutex and then drain readers by waiting on the no-readers event.

use core::{
    cell::UnsafeCell,
    ops::{Deref, DerefMut},
    sync::atomic::{AtomicU32, Ordering},
};

use super::{event::Event, mutex::Mutex, wait};

pub struct RwMutex<T> {
    writer: Mutex<()>,
    readers: AtomicU32,
    no_readers: Event,
    value: UnsafeCell<T>,
}

unsafe impl<T: Send> Send for RwMutex<T> {}
unsafe impl<T: Send + Sync> Sync for RwMutex<T> {}

impl<T: Send + Sync> RwMutex<T> {
    pub fn new(value: T) -> RwMutex<T> {
        RwMutex {
            writer: Mutex::new(()),
            readers: AtomicU32::new(0),
            no_readers: Event::new(true),
            value: UnsafeCell::new(value),
        }
    }

    pub fn read(&self) -> RwReadGuard<'_, T> {
        let registration = self.writer.lock();
        if self.readers.fetch_add(1, Ordering::AcqRel) == 0 {
            self.no_readers.clear();
        }
        drop(registration);
        RwReadGuard { lock: self }
    }

    pub fn write(&self) -> RwWriteGuard<'_, T> {
        let guard = self.writer.lock();
        while self.readers.load(Ordering::Acquire) != 0 {
            wait::wait_one(
                &self.no_readers,
                "rwmutex drain",
                false,
                wait::TIMEOUT_INFINITE,
            )
            .expect("infinite wait cannot fail");
        }
        RwWriteGuard {
            lock: self,
            _writer: guard,
        }
    }
}

pub struct RwReadGuard<'a, T: Send + Sync> {
    lock: &'a RwMutex<T>,
}

impl<T: Send + Sync> Deref for RwReadGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { &*self.lock.value.get() }
    }
}

impl<T: Send + Sync> Drop for RwReadGuard<'_, T> {
    fn drop(&mut self) {
        if self.lock.readers.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.lock.no_readers.signal();
        }
    }
}

pub struct RwWriteGuard<'a, T: Send + Sync> {
    lock: &'a RwMutex<T>,
    _writer: super::mutex::MutexGuard<'a, ()>,
}

impl<T: Send + Sync> Deref for RwWriteGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { &*self.lock.value.get() }
    }
}

impl<T: Send + Sync> DerefMut for RwWriteGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.lock.value.get() }
    }
}

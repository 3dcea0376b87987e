// SPDX-License-Identifier: MPL-2.0

//! Counting semaphores.

use smallvec::SmallVec;

use crate::prelude::*;

use super::{
    object::{self, Dispatcher, DispatcherHeader, WakeQueue},
    thread::Thread,
};

pub struct Semaphore {
    hdr: DispatcherHeader,
}

impl Dispatcher for Semaphore {
    fn header(&self) -> &DispatcherHeader {
        &self.hdr
    }

    fn acquire(&self, _thread: &Arc<Thread>) {
        self.hdr.adjust_signalled(-1);
    }
}

impl Semaphore {
    pub fn new(count: u32) -> Semaphore {
        Semaphore {
            hdr: DispatcherHeader::new(count as i32),
        }
    }

    /// Adds `adjustment` to the count, releasing waiters.
    pub fn release(&self, adjustment: u32) {
        let mut wake_queue: WakeQueue = SmallVec::new();

        let old_ipl = self.hdr.lock.acquire();
        self.hdr.adjust_signalled(adjustment as i32);
        object::signal(self, &mut wake_queue);
        self.hdr.lock.release_nospl();

        object::wake_waiters(&wake_queue);
        super::ipl::lower(old_ipl);
    }

    /// Bumps the count to one only if it is currently zero.
    pub fn release_maxone(&self) {
        let mut wake_queue: WakeQueue = SmallVec::new();

        let old_ipl = self.hdr.lock.acquire();
        if self.hdr.signalled() == 0 {
            self.hdr.set_signalled(1);
        }
        object::signal(self, &mut wake_queue);
        self.hdr.lock.release_nospl();

        object::wake_waiters(&wake_queue);
        super::ipl::lower(old_ipl);
    }

    /// Forces the count to `count` without waking anyone.
    pub fn reset(&self, count: u32) {
        let old_ipl = self.hdr.lock.acquire();
        self.hdr.set_signalled(count as i32);
        self.hdr.lock.release(old_ipl);
    }

    pub fn count(&self) -> i32 {
        self.hdr.signalled()
    }
}

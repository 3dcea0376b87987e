// SPDX-License-Identifier: MPL-2.0

//! Fixed-size message queues.
//!
//! The ring capacity must be a power of two. Posters wait on an internal
//! semaphore for a free slot; the queue's own signal count is the number of
//! queued messages. Satisfying a wait does not consume a message; a woken
//! reader that loses the race to the ring simply waits again.

use core::cell::UnsafeCell;

use smallvec::SmallVec;

use crate::prelude::*;

use super::{
    ipl,
    object::{self, Dispatcher, DispatcherHeader, WakeQueue},
    semaphore::Semaphore,
    thread::Thread,
    wait,
};

struct Ring<T> {
    slots: Vec<Option<T>>,
    head: usize,
    tail: usize,
    len: usize,
}

pub struct MsgQueue<T: Send> {
    hdr: DispatcherHeader,
    free_slots: Semaphore,
    ring: UnsafeCell<Ring<T>>,
}

unsafe impl<T: Send> Send for MsgQueue<T> {}
unsafe impl<T: Send> Sync for MsgQueue<T> {}

impl<T: Send> Dispatcher for MsgQueue<T> {
    fn header(&self) -> &DispatcherHeader {
        &self.hdr
    }

    fn acquire(&self, _thread: &Arc<Thread>) {
        // The reader pops under the header lock itself.
    }
}

impl<T: Send> MsgQueue<T> {
    pub fn new(capacity: usize) -> MsgQueue<T> {
        assert!(capacity.is_power_of_two(), "msgqueue size must be 2^n");
        let mut slots = Vec::with_capacity(capacity);
        slots.resize_with(capacity, || None);
        MsgQueue {
            hdr: DispatcherHeader::new(0),
            free_slots: Semaphore::new(capacity as u32),
            ring: UnsafeCell::new(Ring {
                slots,
                head: 0,
                tail: 0,
                len: 0,
            }),
        }
    }

    /// Posts a message, waiting up to `timeout` for a free slot.
    pub fn post(&self, msg: T, timeout: i64) -> Result<()> {
        wait::wait_one(&self.free_slots, "msgqueue post", false, timeout)?;

        let mut wake_queue: WakeQueue = SmallVec::new();
        let old_ipl = self.hdr.lock.acquire();
        let ring = unsafe { &mut *self.ring.get() };
        debug_assert!(ring.len < ring.slots.len());
        let mask = ring.slots.len() - 1;
        ring.slots[ring.tail] = Some(msg);
        ring.tail = (ring.tail + 1) & mask;
        ring.len += 1;
        self.hdr.adjust_signalled(1);
        object::signal(self, &mut wake_queue);
        self.hdr.lock.release_nospl();

        object::wake_waiters(&wake_queue);
        ipl::lower(old_ipl);
        Ok(())
    }

    /// Receives a message, waiting up to `timeout` for one to arrive.
    pub fn receive(&self, timeout: i64) -> Result<T> {
        loop {
            wait::wait_one(self, "msgqueue receive", false, timeout)?;

            let old_ipl = self.hdr.lock.acquire();
            let ring = unsafe { &mut *self.ring.get() };
            let msg = if ring.len > 0 {
                let mask = ring.slots.len() - 1;
                let msg = ring.slots[ring.head].take();
                ring.head = (ring.head + 1) & mask;
                ring.len -= 1;
                self.hdr.adjust_signalled(-1);
                msg
            } else {
                // Another satisfied waiter beat us to the message.
                None
            };
            self.hdr.lock.release(old_ipl);

            if let Some(msg) = msg {
                self.free_slots.release(1);
                return Ok(msg);
            }
        }
    }
}

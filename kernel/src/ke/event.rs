// SPDX-License-Identifier: MPL-2.0

//! Manual-reset events.

use smallvec::SmallVec;

use crate::prelude::*;

use super::{
    object::{self, Dispatcher, DispatcherHeader, WakeQueue},
    thread::Thread,
};

pub struct Event {
    hdr: DispatcherHeader,
}

impl Dispatcher for Event {
    fn header(&self) -> &DispatcherHeader {
        &self.hdr
    }

    fn acquire(&self, _thread: &Arc<Thread>) {
        // Events stay signalled until cleared.
    }
}

impl Event {
    pub fn new(signalled: bool) -> Event {
        Event {
            hdr: DispatcherHeader::new(i32::from(signalled)),
        }
    }

    /// Signals the event, waking all waiters. Returns the prior state.
    pub fn signal(&self) -> bool {
        let mut wake_queue: WakeQueue = SmallVec::new();

        let old_ipl = self.hdr.lock.acquire();
        let was_signalled = self.hdr.signalled() > 0;
        self.hdr.set_signalled(1);
        object::signal(self, &mut wake_queue);
        self.hdr.lock.release_nospl();

        object::wake_waiters(&wake_queue);
        super::ipl::lower(old_ipl);

        was_signalled
    }

    /// Resets the event. Returns the prior state.
    pub fn clear(&self) -> bool {
        let old_ipl = self.hdr.lock.acquire();
        let was_signalled = self.hdr.signalled() > 0;
        self.hdr.set_signalled(0);
        self.hdr.lock.release(old_ipl);
        was_signalled
    }

    pub fn is_signalled(&self) -> bool {
        self.hdr.signalled() > 0
    }
}

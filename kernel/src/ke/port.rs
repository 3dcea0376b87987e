// SPDX-License-Identifier: MPL-2.0

//! Ports: message queues with a processing-thread cap.
//!
//! Dequeuing a message binds the message (and the port) to the dequeuing
//! thread, which counts against `max_n_processing` until it comes back for
//! another message. A processor that blocks, or dequeues from a different
//! port, gives this port a chance to release another waiter. Waiters are
//! released newest-first.

use core::{cell::UnsafeCell, ptr::NonNull, sync::atomic::Ordering};

use smallvec::SmallVec;

use crate::prelude::*;

use super::{
    ipl,
    object::{self, BlockStatus, SatisfyResult, WaitBlock, WakeQueue},
    sched,
    thread::{self, Thread, ThreadState, WaitStatus},
};

pub struct PortMsg {
    pub payload: usize,
}

pub struct Port {
    pub(crate) hdr: super::object::DispatcherHeader,
    /// Queued messages; guarded by `hdr.lock`.
    queue: UnsafeCell<VecDeque<NonNull<PortMsg>>>,
    /// Threads currently bound to a message; guarded by `hdr.lock`.
    n_processing: core::sync::atomic::AtomicU32,
    max_n_processing: u32,
    /// For handing the port to a bound thread.
    self_ref: Weak<Port>,
}

unsafe impl Send for Port {}
unsafe impl Sync for Port {}

impl Port {
    pub fn new(max_n_processing: u32) -> Arc<Port> {
        Arc::new_cyclic(|self_ref| Port {
            hdr: super::object::DispatcherHeader::new(0),
            queue: UnsafeCell::new(VecDeque::new()),
            n_processing: core::sync::atomic::AtomicU32::new(0),
            max_n_processing,
            self_ref: self_ref.clone(),
        })
    }

    /// Binds a message to `thread`. Called with the header lock held;
    /// `thread` is either the caller or a waiter it has custody of.
    fn bind_msg(
        &self,
        msg: Option<NonNull<PortMsg>>,
        thread: &Arc<Thread>,
    ) -> NonNull<PortMsg> {
        let msg = msg.unwrap_or_else(|| {
            let queue = unsafe { &mut *self.queue.get() };
            let msg = queue.pop_front().expect("port signalled with no message");
            self.hdr.adjust_signalled(-1);
            msg
        });

        unsafe {
            *thread.port.get() = Some(self.self_ref.upgrade().expect("port vanished"));
            *thread.port_msg.get() = Some(msg);
        }
        self.n_processing.fetch_add(1, Ordering::Relaxed);

        msg
    }

    /// Releases waiters while messages and processing slots allow, handing
    /// `msg` (if any) to the first. Returns whether anything was released
    /// and the message if nobody took it.
    fn release_threads(
        &self,
        mut msg: Option<NonNull<PortMsg>>,
        wake_queue: &mut WakeQueue,
    ) -> (bool, Option<NonNull<PortMsg>>) {
        debug_assert!(self.hdr.lock.is_held());
        let mut did_release = false;

        loop {
            let queue_empty = unsafe { (*self.queue.get()).is_empty() };
            if msg.is_none() && queue_empty {
                break;
            }
            if self.n_processing.load(Ordering::Relaxed) >= self.max_n_processing {
                break;
            }
            let Some(wb_ptr) = self.hdr.pop_back_waiter() else {
                break;
            };
            let wb = unsafe { wb_ptr.as_ref() };

            match object::try_satisfy(wb) {
                SatisfyResult::AlreadySatisfied => continue,
                result => {
                    self.bind_msg(msg.take(), &wb.thread);
                    did_release = true;
                    if matches!(result, SatisfyResult::MidWait) {
                        wake_queue.push(wb_ptr);
                    }
                }
            }
        }

        (did_release, msg)
    }

    /// Gives the port a chance to release another waiter; used when a
    /// processor blocks or moves to a different port.
    pub(crate) fn thread_release(&self, wake_queue: &mut WakeQueue) -> bool {
        self.hdr.lock.acquire_nospl();
        let (did_release, leftover) = self.release_threads(None, wake_queue);
        debug_assert!(leftover.is_none());
        self.hdr.lock.release_nospl();
        did_release
    }

    /// Posts a message to the port.
    pub fn enqueue(&self, msg: Box<PortMsg>) {
        let msg = NonNull::new(Box::into_raw(msg)).unwrap();
        let mut wake_queue: WakeQueue = SmallVec::new();
        let old_ipl = self.hdr.lock.acquire();

        let (did_release, leftover) = self.release_threads(Some(msg), &mut wake_queue);
        if did_release {
            debug_assert!(leftover.is_none());
            self.hdr.lock.release_nospl();
            sched::scheduler_lock().acquire_nospl();
            object::wake_waiters(&wake_queue);
            sched::scheduler_lock().release_nospl();
            ipl::lower(old_ipl);
            return;
        }

        let msg = leftover.expect("message neither queued nor released");
        self.hdr.adjust_signalled(1);
        unsafe { (*self.queue.get()).push_back(msg) };
        self.hdr.lock.release(old_ipl);
    }

    /// Takes the next message, blocking until one is available and a
    /// processing slot is free. The calling thread becomes a processor of
    /// this port until its next dequeue.
    pub fn dequeue(&self) -> Box<PortMsg> {
        let old_ipl = ipl::raise_to_dpc();
        let thread = thread::current();
        let wb = WaitBlock::new(thread.clone());

        thread
            .wait_status
            .store(WaitStatus::Preparing as u8, Ordering::Release);

        let bound_port = thread.current_port();
        let rebinding = bound_port
            .as_ref()
            .is_some_and(|p| core::ptr::eq(Arc::as_ptr(p), self));
        if let Some(old_port) = bound_port.filter(|_| !rebinding) {
            let mut wake_queue: WakeQueue = SmallVec::new();
            old_port.thread_release(&mut wake_queue);
            sched::scheduler_lock().acquire_nospl();
            object::wake_waiters(&wake_queue);
            sched::scheduler_lock().release_nospl();
        }

        let mut msg: Option<NonNull<PortMsg>> = None;

        self.hdr.lock.acquire_nospl();
        if rebinding {
            self.n_processing.fetch_sub(1, Ordering::Relaxed);
        }
        if self.hdr.signalled() > 0
            && self.n_processing.load(Ordering::Relaxed) < self.max_n_processing
        {
            msg = Some(self.bind_msg(None, &thread));
        } else {
            wb.set_status(BlockStatus::Active);
            self.hdr.push_waiter(NonNull::from(&wb));
        }
        self.hdr.lock.release_nospl();

        if let Some(msg) = msg {
            ipl::lower(old_ipl);
            unsafe { *thread.port_msg.get() = None };
            return unsafe { Box::from_raw(msg.as_ptr()) };
        }

        thread.lock.acquire_nospl();
        let committed = thread
            .wait_status
            .compare_exchange(
                WaitStatus::Preparing as u8,
                WaitStatus::Waiting as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok();
        if committed {
            assert!(old_ipl < super::ipl::Ipl::Dpc);
            thread.set_wait_reason(Some("port dequeue"));
            thread.set_state(ThreadState::Waiting);
            sched::reschedule();
        } else {
            thread.lock.release_nospl();
        }

        assert_eq!(
            thread.wait_status.load(Ordering::Acquire),
            WaitStatus::Satisfied as u8
        );
        thread.set_wait_reason(None);

        // No timeout or alert support on ports: satisfaction always carries
        // a message.
        assert_eq!(wb.status(), BlockStatus::Acquired);

        ipl::lower(old_ipl);

        let msg = unsafe { (*thread.port_msg.get()).take() }.expect("woken without a message");
        unsafe { Box::from_raw(msg.as_ptr()) }
    }
}

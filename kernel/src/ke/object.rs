// SPDX-License-Identifier: MPL-2.0

//! Dispatcher object plumbing: the common header, wait blocks, and the
//! signal/satisfy machinery shared by every waitable kind.

use core::{cell::UnsafeCell, ptr::NonNull, sync::atomic::Ordering};

use smallvec::SmallVec;

use crate::prelude::*;

use super::{
    sched,
    spinlock::RawSpinlock,
    thread::{Thread, WaitStatus},
};

/// Status of one wait block.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BlockStatus {
    /// Linked on the object's waiter queue.
    Active = 0,
    /// Off the queue; the wait was satisfied through another block.
    Deactivated = 1,
    /// Off the queue; this block's object satisfied the wait.
    Acquired = 2,
}

/// A waiter's link into one dispatcher object's FIFO.
///
/// Wait blocks live in the waiting frame (four inline, spilling for wider
/// waits); the wait protocol removes every block from every queue before
/// the frame is left.
pub struct WaitBlock {
    pub(crate) thread: Arc<Thread>,
    pub(crate) status: core::sync::atomic::AtomicU8,
}

impl WaitBlock {
    pub(crate) fn new(thread: Arc<Thread>) -> WaitBlock {
        WaitBlock {
            thread,
            status: core::sync::atomic::AtomicU8::new(BlockStatus::Active as u8),
        }
    }

    pub(crate) fn status(&self) -> BlockStatus {
        match self.status.load(Ordering::Acquire) {
            0 => BlockStatus::Active,
            1 => BlockStatus::Deactivated,
            _ => BlockStatus::Acquired,
        }
    }

    pub(crate) fn set_status(&self, status: BlockStatus) {
        self.status.store(status as u8, Ordering::Release);
    }
}

pub(crate) type WakeQueue = SmallVec<[NonNull<WaitBlock>; 4]>;

/// Common head of every dispatcher object.
pub struct DispatcherHeader {
    pub(crate) lock: RawSpinlock,
    /// Signed signal count; >= 1 means signalled. Guarded by `lock`.
    signalled: core::sync::atomic::AtomicI32,
    /// FIFO of waiters. Guarded by `lock`.
    waiters: UnsafeCell<VecDeque<NonNull<WaitBlock>>>,
}

unsafe impl Send for DispatcherHeader {}
unsafe impl Sync for DispatcherHeader {}

impl DispatcherHeader {
    pub fn new(signalled: i32) -> DispatcherHeader {
        DispatcherHeader {
            lock: RawSpinlock::new(),
            signalled: core::sync::atomic::AtomicI32::new(signalled),
            waiters: UnsafeCell::new(VecDeque::new()),
        }
    }

    pub(crate) fn signalled(&self) -> i32 {
        self.signalled.load(Ordering::Relaxed)
    }

    pub(crate) fn set_signalled(&self, value: i32) {
        debug_assert!(self.lock.is_held());
        self.signalled.store(value, Ordering::Relaxed);
    }

    pub(crate) fn adjust_signalled(&self, delta: i32) {
        debug_assert!(self.lock.is_held());
        self.signalled.fetch_add(delta, Ordering::Relaxed);
    }

    pub(crate) fn push_waiter(&self, wb: NonNull<WaitBlock>) {
        debug_assert!(self.lock.is_held());
        unsafe { (*self.waiters.get()).push_back(wb) };
    }

    pub(crate) fn pop_front_waiter(&self) -> Option<NonNull<WaitBlock>> {
        debug_assert!(self.lock.is_held());
        unsafe { (*self.waiters.get()).pop_front() }
    }

    pub(crate) fn pop_back_waiter(&self) -> Option<NonNull<WaitBlock>> {
        debug_assert!(self.lock.is_held());
        unsafe { (*self.waiters.get()).pop_back() }
    }

    pub(crate) fn has_waiters(&self) -> bool {
        debug_assert!(self.lock.is_held());
        unsafe { !(*self.waiters.get()).is_empty() }
    }

    pub(crate) fn remove_waiter(&self, wb: NonNull<WaitBlock>) {
        debug_assert!(self.lock.is_held());
        let queue = unsafe { &mut *self.waiters.get() };
        if let Some(pos) = queue.iter().position(|p| *p == wb) {
            queue.remove(pos);
        }
    }
}

/// A waitable kernel object: a dispatcher header plus the acquire side
/// effect applied when a wait is satisfied by this object.
///
/// The kind set is closed (event, semaphore, mutex, timer, message queue);
/// ports run their own satisfy path.
pub trait Dispatcher: Sync {
    fn header(&self) -> &DispatcherHeader;

    /// Applies the object's acquisition side effect for `thread`.
    ///
    /// Called with the header lock held.
    fn acquire(&self, thread: &Arc<Thread>);
}

pub(crate) enum SatisfyResult {
    /// Satisfied before the waiter committed to sleeping.
    PreWait,
    /// Satisfied a sleeping waiter; it needs waking.
    MidWait,
    /// Another object already satisfied this wait.
    AlreadySatisfied,
}

/// Tries to make `wb` the satisfying block of its thread's wait.
pub(crate) fn try_satisfy(wb: &WaitBlock) -> SatisfyResult {
    let status = &wb.thread.wait_status;
    loop {
        if status
            .compare_exchange(
                WaitStatus::Preparing as u8,
                WaitStatus::Satisfied as u8,
                Ordering::AcqRel,
                Ordering::Relaxed,
            )
            .is_ok()
        {
            wb.set_status(BlockStatus::Acquired);
            return SatisfyResult::PreWait;
        }
        if status
            .compare_exchange(
                WaitStatus::Waiting as u8,
                WaitStatus::Satisfied as u8,
                Ordering::AcqRel,
                Ordering::Relaxed,
            )
            .is_ok()
        {
            wb.set_status(BlockStatus::Acquired);
            return SatisfyResult::MidWait;
        }
        if status.load(Ordering::Acquire) == WaitStatus::Satisfied as u8 {
            wb.set_status(BlockStatus::Deactivated);
            return SatisfyResult::AlreadySatisfied;
        }
    }
}

/// Satisfies waiters of `obj` while it remains signalled.
///
/// Called with the header lock held. Threads that were already asleep are
/// collected on `wake_queue`; the caller wakes them once it is safe to.
pub(crate) fn signal(obj: &dyn Dispatcher, wake_queue: &mut WakeQueue) {
    let hdr = obj.header();
    debug_assert!(hdr.lock.is_held());

    while hdr.signalled() > 0 && hdr.has_waiters() {
        let wb_ptr = hdr.pop_front_waiter().unwrap();
        let wb = unsafe { wb_ptr.as_ref() };

        match try_satisfy(wb) {
            SatisfyResult::MidWait => {
                wake_queue.push(wb_ptr);
                obj.acquire(&wb.thread);
            }
            SatisfyResult::PreWait => {
                obj.acquire(&wb.thread);
            }
            SatisfyResult::AlreadySatisfied => {}
        }
    }
}

/// Makes a satisfied, sleeping waiter runnable again.
pub(crate) fn wake_waiter(thread: &Arc<Thread>) {
    let ipl = thread.lock.acquire();
    assert!(thread.is_waiting());
    assert_eq!(
        thread.wait_status.load(Ordering::Acquire),
        WaitStatus::Satisfied as u8
    );
    thread.set_runnable();
    sched::resume_locked(thread);
    thread.lock.release(ipl);
}

/// Wakes every thread on a wake queue.
pub(crate) fn wake_waiters(wake_queue: &WakeQueue) {
    for wb_ptr in wake_queue.iter() {
        let wb = unsafe { wb_ptr.as_ref() };
        wake_waiter(&wb.thread);
    }
}

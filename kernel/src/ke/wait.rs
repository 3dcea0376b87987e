// SPDX-License-Identifier: MPL-2.0

//! Wait-one / wait-multi.
//!
//! A wait publishes `Preparing` in the thread's wait-status cell, then scans
//! the objects: a signalled object tries to win the cell immediately, an
//! unsignalled one receives a wait block. Committing to sleep is a
//! `Preparing -> Waiting` CAS under the thread lock; signallers race it with
//! `-> Satisfied` from either side, so a wait either observes the signalled
//! state or blocks, never neither. On resume the block sweep finds exactly
//! one `Acquired` block (or the timeout/alert cause).

use core::{ptr::NonNull, sync::atomic::Ordering};

use smallvec::SmallVec;

use crate::prelude::*;

use super::{
    ipl::{self, Ipl},
    object::{self, BlockStatus, Dispatcher, WaitBlock},
    sched,
    thread::{self, WaitStatus},
    timer::Timer,
};

/// Wait forever.
pub const TIMEOUT_INFINITE: i64 = -1;

/// Waits on a single object. See [`wait_multi`].
pub fn wait_one(
    object: &dyn Dispatcher,
    reason: &'static str,
    alertable: bool,
    timeout: i64,
) -> Result<usize> {
    wait_multi(&[object], reason, false, alertable, timeout)
}

/// Waits until one of `objects` is acquired, returning its index.
///
/// `timeout` is relative nanoseconds; `0` polls, [`TIMEOUT_INFINITE`] waits
/// forever. An elapsed timeout returns `Timeout`; an alert during an
/// alertable wait returns `Signalled`. Wait-all is not implemented.
pub fn wait_multi(
    objects: &[&dyn Dispatcher],
    reason: &'static str,
    wait_all: bool,
    alertable: bool,
    timeout: i64,
) -> Result<usize> {
    assert!(!wait_all, "wait-all is not implemented");

    let old_ipl = ipl::raise_to_dpc();
    let thread = thread::current();
    let norig = objects.len();
    let timed = timeout > 0;
    let total = norig + usize::from(timed);

    let timer = Timer::new();
    let mut blocks: SmallVec<[WaitBlock; 4]> = SmallVec::with_capacity(total);
    for _ in 0..total {
        blocks.push(WaitBlock::new(thread.clone()));
    }
    // Block addresses must stay put once enqueued on an object.
    let obj_at = |i: usize| -> &dyn Dispatcher {
        if i == norig {
            &timer
        } else {
            objects[i]
        }
    };

    thread.alertable.store(alertable, Ordering::Release);
    thread
        .wait_status
        .store(WaitStatus::Preparing as u8, Ordering::Release);

    let mut satisfier: Option<usize> = None;
    for i in 0..total {
        let obj = obj_at(i);
        let wb = &blocks[i];
        let hdr = obj.header();

        hdr.lock.acquire_nospl();
        if hdr.signalled() > 0 {
            let won = thread
                .wait_status
                .compare_exchange(
                    WaitStatus::Preparing as u8,
                    WaitStatus::Satisfied as u8,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_ok();
            if won {
                satisfier = Some(i);
                obj.acquire(&thread);
            } else {
                // An alert got the cell first.
                assert_eq!(
                    thread.wait_status.load(Ordering::Acquire),
                    WaitStatus::Satisfied as u8
                );
            }
            hdr.lock.release_nospl();
            break;
        }

        wb.set_status(BlockStatus::Active);
        hdr.push_waiter(NonNull::from(wb));
        hdr.lock.release_nospl();
    }

    if satisfier.is_some() || timeout == 0 {
        // Nothing to sleep for: pull back any blocks already enqueued.
        let limit = satisfier.unwrap_or(total);
        for i in 0..limit {
            let hdr = obj_at(i).header();
            let wb = &blocks[i];
            hdr.lock.acquire_nospl();
            wb.set_status(BlockStatus::Deactivated);
            hdr.remove_waiter(NonNull::from(wb));
            hdr.lock.release_nospl();
        }
        thread.alertable.store(false, Ordering::Release);
        ipl::lower(old_ipl);
        return match satisfier {
            Some(i) => Ok(i),
            None => Err(Error::new(ErrorKind::Timeout)),
        };
    }

    if timed {
        timer.set(timeout as u64);
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
        assert!(old_ipl < Ipl::Dpc, "blocking wait entered at IPL >= DPC");
        thread.set_wait_reason(Some(reason));
        thread.set_state(super::thread::ThreadState::Waiting);

        // A port processor that goes to sleep hands its port the chance to
        // release another waiter.
        if let Some(port) = thread.current_port() {
            let mut wake_queue = SmallVec::new();
            port.thread_release(&mut wake_queue);
            object::wake_waiters(&wake_queue);
        }

        sched::reschedule();
    } else {
        // The wait was satisfied before we could commit.
        thread.lock.release_nospl();
    }

    thread.set_wait_reason(None);

    if timed {
        timer.cancel();
    }

    assert_eq!(
        thread.wait_status.load(Ordering::Acquire),
        WaitStatus::Satisfied as u8
    );

    let mut satisfier: Option<usize> = None;
    for i in 0..total {
        let hdr = obj_at(i).header();
        let wb = &blocks[i];
        hdr.lock.acquire_nospl();
        match wb.status() {
            BlockStatus::Active => hdr.remove_waiter(NonNull::from(wb)),
            BlockStatus::Acquired => {
                assert!(satisfier.is_none(), "wait satisfied twice");
                satisfier = Some(i);
            }
            BlockStatus::Deactivated => {}
        }
        hdr.lock.release_nospl();
    }

    thread.alertable.store(false, Ordering::Release);
    ipl::lower(old_ipl);

    match satisfier {
        Some(i) if timed && i == norig => Err(Error::new(ErrorKind::Timeout)),
        Some(i) => Ok(i),
        None => {
            if thread.alerted.swap(false, Ordering::AcqRel) {
                Err(Error::new(ErrorKind::Signalled))
            } else {
                panic!("wait satisfied with no acquired block");
            }
        }
    }
}

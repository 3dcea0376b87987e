// SPDX-License-Identifier: MPL-2.0

//! Timers and the hardclock.
//!
//! Each CPU keeps a deadline-sorted timer queue behind the same High-level
//! lock as its DPC queue. The platform's periodic tick lands in
//! [`hardclock`], which advances the CPU clock, charges the running thread's
//! timeslice, and posts the expiry DPC when the head deadline has passed.
//!
//! A timer is also a dispatcher object: expiry signals it stickily, so a
//! wait that arrives after the deadline completes immediately until the
//! timer is set again.

use core::{
    ptr::NonNull,
    sync::atomic::{AtomicU64, AtomicU8, AtomicUsize, Ordering},
};

use smallvec::SmallVec;

use crate::prelude::*;

use super::{
    cpu::{self, Cpu, RescheduleReason},
    dpc::{self, Dpc},
    ipl::{self, Ipl},
    object::{self, DispatcherHeader, Dispatcher, WakeQueue},
    thread::Thread,
};
use crate::{arch, config};

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TimerState {
    Disabled = 0,
    InQueue = 1,
    Executing = 2,
}

const TIMER_NO_CPU: usize = usize::MAX;

pub struct Timer {
    hdr: DispatcherHeader,
    state: AtomicU8,
    deadline: AtomicU64,
    cpu: AtomicUsize,
    dpc: spin::Mutex<Option<&'static Dpc>>,
}

unsafe impl Send for Timer {}

impl Dispatcher for Timer {
    fn header(&self) -> &DispatcherHeader {
        &self.hdr
    }

    fn acquire(&self, _thread: &Arc<Thread>) {
        // Timers stay signalled until reset.
    }
}

impl Timer {
    pub fn new() -> Timer {
        Timer {
            hdr: DispatcherHeader::new(0),
            state: AtomicU8::new(TimerState::Disabled as u8),
            deadline: AtomicU64::new(0),
            cpu: AtomicUsize::new(TIMER_NO_CPU),
            dpc: spin::Mutex::new(None),
        }
    }

    /// Attaches a DPC to enqueue on expiry.
    pub fn attach_dpc(&self, dpc: &'static Dpc) {
        *self.dpc.lock() = Some(dpc);
    }

    fn state(&self) -> TimerState {
        match self.state.load(Ordering::Acquire) {
            0 => TimerState::Disabled,
            1 => TimerState::InQueue,
            _ => TimerState::Executing,
        }
    }

    /// Arms the timer `nanosecs` from now on the executing CPU, resetting
    /// the signalled state. Re-arming an armed timer requeues it.
    pub fn set(&self, nanosecs: u64) {
        let old_ipl = ipl::raise_to_dpc();
        self.hdr.lock.acquire_nospl();

        loop {
            match self.state() {
                TimerState::Executing => {
                    // Expiry owns it; let the DPC finish and retry.
                    self.hdr.lock.release_nospl();
                    core::hint::spin_loop();
                    self.hdr.lock.acquire_nospl();
                }
                TimerState::InQueue => {
                    if dequeue(self) {
                        break;
                    }
                }
                TimerState::Disabled => break,
            }
        }
        assert_eq!(self.state(), TimerState::Disabled);

        let cpu = cpu::current();
        self.hdr.set_signalled(0);
        self.cpu.store(cpu.index(), Ordering::Release);
        self.deadline
            .store(cpu.local_nanos() + nanosecs, Ordering::Release);
        enqueue(self, cpu);

        self.hdr.lock.release(old_ipl);
    }

    /// Disarms the timer, spinning out an in-flight expiry.
    pub fn cancel(&self) {
        let old_ipl = self.hdr.lock.acquire();
        loop {
            match self.state() {
                TimerState::Executing => {
                    core::hint::spin_loop();
                }
                TimerState::InQueue => {
                    if dequeue(self) {
                        break;
                    }
                }
                TimerState::Disabled => break,
            }
        }
        assert_eq!(self.state(), TimerState::Disabled);
        self.hdr.lock.release(old_ipl);
    }
}

impl Default for Timer {
    fn default() -> Self {
        Timer::new()
    }
}

/// Inserts an armed timer into its CPU's queue, soonest deadline first.
fn enqueue(timer: &Timer, cpu: &'static Cpu) {
    let mut deferred = cpu.deferred.lock();
    timer
        .state
        .store(TimerState::InQueue as u8, Ordering::Release);

    let deadline = timer.deadline.load(Ordering::Acquire);
    let timers = &mut deferred.timers;
    let pos = timers
        .iter()
        .position(|t| unsafe { t.as_ref() }.deadline.load(Ordering::Acquire) > deadline)
        .unwrap_or(timers.len());
    timers.insert(pos, NonNull::from(timer));
}

/// Removes a queued timer. Returns false if expiry owns it right now.
fn dequeue(timer: &Timer) -> bool {
    if timer.state() == TimerState::Disabled {
        return true;
    }

    let cpu = cpu::cpu_by_index(timer.cpu.load(Ordering::Acquire));
    let mut deferred = cpu.deferred.lock();

    match timer.state() {
        TimerState::Executing => false,
        TimerState::Disabled => true,
        TimerState::InQueue => {
            let timers = &mut deferred.timers;
            let pos = timers
                .iter()
                .position(|t| core::ptr::eq(t.as_ptr(), timer))
                .expect("queued timer not on its CPU's queue");
            timers.remove(pos);
            timer
                .state
                .store(TimerState::Disabled as u8, Ordering::Release);
            true
        }
    }
}

/// The platform's periodic tick for the executing CPU.
pub fn hardclock() {
    hardclock_for(cpu::current());
}

/// One hardclock tick charged to `cpu`.
pub(crate) fn hardclock_for(cpu: &'static Cpu) {
    let mut want_timers = false;
    {
        let deferred = cpu.deferred.lock();
        let nanos = cpu.advance_nanos(config::NS_PER_TICK);

        let curthread = cpu.current_thread_raw();
        if !curthread.is_null() {
            let t = unsafe { &*curthread };
            if t.timeslice.fetch_sub(1, Ordering::Relaxed) <= 0 {
                cpu.set_reschedule_reason(RescheduleReason::Preempted);
                arch::platform().raise_dpc_interrupt();
            }
        }

        if let Some(head) = deferred.timers.first() {
            let head = unsafe { head.as_ref() };
            if head.deadline.load(Ordering::Acquire) <= nanos {
                want_timers = true;
            }
        }
    }

    if want_timers {
        dpc::enqueue(&cpu.timer_expiry_dpc);
    }
}

/// Expiry DPC: signals every timer whose deadline has passed on `cpu`.
pub(crate) fn timer_expiry_dpc(cpu_index: usize) {
    let cpu = cpu::cpu_by_index(cpu_index);
    loop {
        let timer_ptr = {
            let mut deferred = cpu.deferred.lock();
            let Some(head) = deferred.timers.first().copied() else {
                break;
            };
            let timer = unsafe { head.as_ref() };
            if timer.deadline.load(Ordering::Acquire) > cpu.local_nanos() {
                break;
            }

            // Cancellation takes the same lock, so the head is ours.
            timer
                .state
                .compare_exchange(
                    TimerState::InQueue as u8,
                    TimerState::Executing as u8,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .expect("expiring timer not InQueue");
            deferred.timers.remove(0);
            head
        };

        let timer = unsafe { timer_ptr.as_ref() };
        let mut wake_queue: WakeQueue = SmallVec::new();

        timer.hdr.lock.acquire_nospl();
        timer.hdr.set_signalled(1);
        object::signal(timer, &mut wake_queue);
        let attached = *timer.dpc.lock();
        if let Some(dpc) = attached {
            dpc::enqueue(dpc);
        }
        // Waking under the header lock keeps the (stack-owned) wait blocks
        // alive until the waiter is truly released.
        object::wake_waiters(&wake_queue);
        timer
            .state
            .store(TimerState::Disabled as u8, Ordering::Release);
        timer.hdr.lock.release_nospl();
    }
}

/// Sleeps the calling thread for at least `nanosecs`.
pub fn sleep(nanosecs: u64) {
    let timer = Timer::new();
    timer.set(nanosecs);
    super::wait::wait_one(&timer, "sleep", false, super::wait::TIMEOUT_INFINITE)
        .expect("sleep wait cannot fail");
    timer.cancel();
}

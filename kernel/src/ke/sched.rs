// SPDX-License-Identifier: MPL-2.0

//! The per-CPU scheduler.

use core::sync::atomic::{AtomicU64, Ordering};

use crate::prelude::*;

use super::{
    cpu::{self, Cpu, RescheduleReason},
    dpc,
    ipl::{self, Ipl},
    rcu,
    spinlock::{RawSpinlock, SpinLock},
    thread::{Thread, ThreadState},
};
use crate::{arch, config};

/// Bit set means the CPU is running its idle thread.
static IDLE_MASK: AtomicU64 = AtomicU64::new(0);

static SCHEDULER_LOCK: RawSpinlock = RawSpinlock::new();

/// Exited threads parked until the done-thread DPC drops their last
/// scheduler reference.
static DONE_QUEUE: SpinLock<VecDeque<Arc<Thread>>> = SpinLock::new(VecDeque::new());

/// The global lock taken around cross-CPU wakeup batches.
pub(crate) fn scheduler_lock() -> &'static RawSpinlock {
    &SCHEDULER_LOCK
}

pub(crate) fn set_cpu_idle(index: usize, idle: bool) {
    if idle {
        IDLE_MASK.fetch_or(1 << index, Ordering::Relaxed);
    } else {
        IDLE_MASK.fetch_and(!(1 << index), Ordering::Relaxed);
    }
}

fn next_thread(cpu: &'static Cpu) -> Arc<Thread> {
    debug_assert!(cpu.sched_lock.is_held());
    let runqueue = unsafe { &mut *cpu.runqueue.get() };
    runqueue
        .pop_front()
        .unwrap_or_else(|| cpu.idle_thread.clone())
}

/// Switches away from the current thread.
///
/// Entered at IPL = DPC with the current thread's lock held; that lock is
/// released once the thread's new state is published, before the machine
/// switch.
pub(crate) fn reschedule() {
    let cpu = cpu::current();
    let old = cpu.current_thread();

    assert!(ipl::current() >= Ipl::Dpc);
    debug_assert!(old.lock.is_held());

    cpu.sched_lock.acquire_nospl();

    if old.is_idle() {
        // The idle thread must never wait or exit.
        assert_eq!(old.state(), ThreadState::Running);
    } else {
        match old.state() {
            ThreadState::Running => {
                old.set_state(ThreadState::Runnable);
                unsafe { (*cpu.runqueue.get()).push_back(old.clone()) };
            }
            ThreadState::Waiting => {}
            ThreadState::Done => {
                DONE_QUEUE.lock().push_back(old.clone());
                dpc::enqueue(&cpu.done_thread_dpc);
            }
            state => panic!("rescheduling a thread in state {:?}", state),
        }
    }

    let next = next_thread(cpu);
    next.set_state(ThreadState::Running);
    next.timeslice
        .store(config::TIMESLICE_TICKS, Ordering::Relaxed);
    next.last_cpu.store(cpu.index(), Ordering::Relaxed);
    unsafe { cpu.set_current_thread(next.clone()) };
    cpu.set_reschedule_reason(RescheduleReason::None);

    cpu.sched_lock.release_nospl();

    rcu::quiet(cpu);

    if Arc::ptr_eq(&old, &next) {
        old.lock.release_nospl();
        return;
    }

    set_cpu_idle(cpu.index(), next.is_idle());

    old.lock.release_nospl();
    arch::platform().switch(&old, &next);
}

/// Makes a runnable thread eligible to run, preferring an idle CPU.
///
/// Called with the thread's lock held at IPL >= DPC.
pub(crate) fn resume_locked(thread: &Arc<Thread>) {
    debug_assert!(thread.lock.is_held());

    let current = cpu::current();
    let idle = IDLE_MASK.load(Ordering::Relaxed);
    let chosen = if idle & (1 << current.index()) != 0 {
        current
    } else if idle != 0 {
        cpu::cpu_by_index(idle.trailing_zeros() as usize)
    } else {
        current
    };

    chosen.sched_lock.acquire_nospl();
    unsafe { (*chosen.runqueue.get()).push_front(thread.clone()) };
    chosen.set_reschedule_reason(RescheduleReason::Preempted);
    chosen.sched_lock.release_nospl();

    if chosen.index() == current.index() {
        arch::platform().raise_dpc_interrupt();
    } else {
        arch::platform().send_dpc_ipi(chosen.index());
    }
}

/// Resumes a thread created in the Initial state, or one made runnable by
/// its owner.
pub fn resume(thread: &Arc<Thread>) {
    let old_ipl = thread.lock.acquire();
    if thread.state() == ThreadState::Initial {
        thread.set_state(ThreadState::Runnable);
    }
    resume_locked(thread);
    thread.lock.release(old_ipl);
}

/// Yields the processor, leaving the thread runnable.
pub fn yield_now() {
    let old_ipl = ipl::raise_to_dpc();
    let thread = super::thread::current();
    thread.lock.acquire_nospl();
    reschedule();
    ipl::lower(old_ipl);
}

/// Drops the scheduler's references to exited threads.
pub(crate) fn done_thread_dpc(_arg: usize) {
    loop {
        let thread = DONE_QUEUE.lock().pop_front();
        match thread {
            Some(thread) => {
                debug_assert_eq!(thread.state(), ThreadState::Done);
                drop(thread);
            }
            None => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ke::thread::Thread;

    #[test]
    fn runqueue_order_and_idle_fallback() {
        crate::arch::hosted::init_kernel();
        let cpu = cpu::register_cpu();

        let a = Thread::new(String::from("a"), None);
        let b = Thread::new(String::from("b"), None);
        a.set_state(ThreadState::Runnable);
        b.set_state(ThreadState::Runnable);

        cpu.sched_lock.acquire_nospl();
        unsafe {
            (*cpu.runqueue.get()).push_back(a.clone());
            (*cpu.runqueue.get()).push_back(b.clone());
        }
        let first = next_thread(cpu);
        let second = next_thread(cpu);
        let third = next_thread(cpu);
        cpu.sched_lock.release_nospl();

        assert!(Arc::ptr_eq(&first, &a));
        assert!(Arc::ptr_eq(&second, &b));
        assert!(third.is_idle());
    }
}

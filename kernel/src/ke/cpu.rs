// SPDX-License-Identifier: MPL-2.0

//! Per-CPU state.

use core::{
    cell::UnsafeCell,
    ptr::NonNull,
    sync::atomic::{AtomicPtr, AtomicU64, AtomicU8, Ordering},
};

use crate::prelude::*;

use super::{
    dpc::{dpc_arg, Dpc},
    rcu::RcuCpu,
    sched,
    spinlock::{RawSpinlock, SpinLock},
    thread::Thread,
    timer::{self, Timer},
};
use crate::arch;

/// Why a reschedule was requested on a CPU.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RescheduleReason {
    None = 0,
    Preempted = 1,
}

/// DPC and timer state guarded together at IPL = High, since the hardclock
/// walks both.
pub(crate) struct Deferred {
    pub(crate) dpcs: VecDeque<&'static Dpc>,
    /// Deadline-sorted, soonest first. Entries are borrowed from timer
    /// owners, who must cancel before the timer's storage dies.
    pub(crate) timers: Vec<NonNull<Timer>>,
}

unsafe impl Send for Deferred {}

pub struct Cpu {
    index: usize,
    pub(crate) sched_lock: RawSpinlock,
    pub(crate) runqueue: UnsafeCell<VecDeque<Arc<Thread>>>,
    curthread: UnsafeCell<Option<Arc<Thread>>>,
    curthread_ptr: AtomicPtr<Thread>,
    pub(crate) idle_thread: Arc<Thread>,
    pub(crate) reschedule_reason: AtomicU8,
    nanos: AtomicU64,
    pub(crate) deferred: SpinLock<Deferred>,
    pub(crate) timer_expiry_dpc: Dpc,
    pub(crate) done_thread_dpc: Dpc,
    pub(crate) rcu_dpc: Dpc,
    pub(crate) rcu: SpinLock<RcuCpu>,
}

unsafe impl Sync for Cpu {}

impl Cpu {
    pub fn index(&self) -> usize {
        self.index
    }

    /// The CPU's nanosecond clock, advanced by the hardclock.
    pub fn local_nanos(&self) -> u64 {
        self.nanos.load(Ordering::SeqCst)
    }

    pub(crate) fn advance_nanos(&self, delta: u64) -> u64 {
        self.nanos.fetch_add(delta, Ordering::SeqCst) + delta
    }

    pub(crate) fn reschedule_reason(&self) -> RescheduleReason {
        match self.reschedule_reason.load(Ordering::Relaxed) {
            0 => RescheduleReason::None,
            _ => RescheduleReason::Preempted,
        }
    }

    pub(crate) fn set_reschedule_reason(&self, reason: RescheduleReason) {
        self.reschedule_reason.store(reason as u8, Ordering::Relaxed);
    }

    /// Lock-free view of the running thread, for the hardclock.
    pub(crate) fn current_thread_raw(&self) -> *mut Thread {
        self.curthread_ptr.load(Ordering::Acquire)
    }

    /// The running thread. Taken under `sched_lock` internally.
    pub fn current_thread(&self) -> Arc<Thread> {
        self.sched_lock.acquire_nospl();
        // Set before any thread can run here, so always present.
        let thread = unsafe { (*self.curthread.get()).clone().unwrap() };
        self.sched_lock.release_nospl();
        thread
    }

    /// Publishes `thread` as this CPU's running thread.
    ///
    /// # Safety
    ///
    /// `sched_lock` must be held.
    pub(crate) unsafe fn set_current_thread(&self, thread: Arc<Thread>) {
        debug_assert!(self.sched_lock.is_held());
        self.curthread_ptr
            .store(Arc::as_ptr(&thread) as *mut Thread, Ordering::Release);
        unsafe {
            *self.curthread.get() = Some(thread);
        }
    }
}

static CPUS: spin::RwLock<Vec<&'static Cpu>> = spin::RwLock::new(Vec::new());

/// Brings up a CPU record with its idle thread and registers it.
pub fn register_cpu() -> &'static Cpu {
    let mut cpus = CPUS.write();
    let index = cpus.len();
    assert!(index < crate::config::MAX_CPUS, "too many CPUs");

    let idle = Thread::new_idle(index);
    let cpu: &'static Cpu = Box::leak(Box::new(Cpu {
        index,
        sched_lock: RawSpinlock::new(),
        runqueue: UnsafeCell::new(VecDeque::new()),
        curthread: UnsafeCell::new(Some(idle.clone())),
        curthread_ptr: AtomicPtr::new(Arc::as_ptr(&idle) as *mut Thread),
        idle_thread: idle,
        reschedule_reason: AtomicU8::new(RescheduleReason::None as u8),
        nanos: AtomicU64::new(0),
        deferred: SpinLock::new_at_high(Deferred {
            dpcs: VecDeque::new(),
            timers: Vec::new(),
        }),
        timer_expiry_dpc: Dpc::new(timer::timer_expiry_dpc, dpc_arg(index)),
        done_thread_dpc: Dpc::new(sched::done_thread_dpc, dpc_arg(index)),
        rcu_dpc: Dpc::new(super::rcu::past_callbacks_dpc, dpc_arg(index)),
        rcu: SpinLock::new(RcuCpu::new()),
    }));
    cpus.push(cpu);
    sched::set_cpu_idle(index, true);
    cpu
}

/// The executing CPU.
pub fn current() -> &'static Cpu {
    let index = arch::platform().current_cpu_index();
    CPUS.read()[index]
}

pub fn cpu_by_index(index: usize) -> &'static Cpu {
    CPUS.read()[index]
}

pub fn cpu_count() -> usize {
    CPUS.read().len()
}

/// Snapshot of all CPUs, for the RCU engine and the hosted ticker.
pub fn all_cpus() -> Vec<&'static Cpu> {
    CPUS.read().clone()
}

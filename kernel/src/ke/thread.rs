// SPDX-License-Identifier: MPL-2.0

//! Kernel threads.

use core::{
    cell::UnsafeCell,
    ptr::NonNull,
    sync::atomic::{AtomicBool, AtomicI32, AtomicU8, AtomicUsize, Ordering},
};

use crate::prelude::*;

use super::{
    port::{Port, PortMsg},
    spinlock::RawSpinlock,
};
use crate::ps::Process;

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadState {
    Initial = 0,
    Runnable = 1,
    Running = 2,
    Waiting = 3,
    Done = 4,
}

/// The wait protocol's per-thread cell, CAS-stepped by waiter and
/// signallers.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WaitStatus {
    Preparing = 0,
    Waiting = 1,
    Satisfied = 2,
}

/// Machine context. A hardware port keeps the register save area and kernel
/// stack pointer here; the hosted port keeps the backing host thread.
#[derive(Default)]
pub struct Pcb {
    #[cfg(not(target_os = "none"))]
    pub(crate) host: spin::Mutex<Option<std::thread::Thread>>,
}

pub struct Thread {
    pub(crate) lock: RawSpinlock,
    state: AtomicU8,
    pub(crate) wait_status: AtomicU8,
    pub(crate) alerted: AtomicBool,
    pub(crate) alertable: AtomicBool,
    pub(crate) timeslice: AtomicI32,
    pub(crate) last_cpu: AtomicUsize,
    /// Written only by the thread itself around its waits.
    wait_reason: UnsafeCell<Option<&'static str>>,
    /// Port this thread is processing a message for, and the message.
    /// Written by port code under the port lock while the thread sleeps, or
    /// by the thread itself.
    pub(crate) port: UnsafeCell<Option<Arc<Port>>>,
    pub(crate) port_msg: UnsafeCell<Option<NonNull<PortMsg>>>,
    pub(crate) in_trap_recovery: AtomicBool,
    pub(crate) pcb: Pcb,
    process: Option<Arc<Process>>,
    idle: bool,
    name: String,
}

unsafe impl Send for Thread {}
unsafe impl Sync for Thread {}

impl Thread {
    pub(crate) fn new(name: String, process: Option<Arc<Process>>) -> Arc<Thread> {
        Arc::new(Thread {
            lock: RawSpinlock::new(),
            state: AtomicU8::new(ThreadState::Initial as u8),
            wait_status: AtomicU8::new(WaitStatus::Satisfied as u8),
            alerted: AtomicBool::new(false),
            alertable: AtomicBool::new(false),
            timeslice: AtomicI32::new(crate::config::TIMESLICE_TICKS),
            last_cpu: AtomicUsize::new(0),
            wait_reason: UnsafeCell::new(None),
            port: UnsafeCell::new(None),
            port_msg: UnsafeCell::new(None),
            in_trap_recovery: AtomicBool::new(false),
            pcb: Pcb::default(),
            process,
            idle: false,
            name,
        })
    }

    pub(crate) fn new_idle(cpu_index: usize) -> Arc<Thread> {
        let mut idle = Thread::new(alloc::format!("idle/{}", cpu_index), None);
        {
            let t = Arc::get_mut(&mut idle).unwrap();
            t.idle = true;
            t.state = AtomicU8::new(ThreadState::Running as u8);
            t.last_cpu = AtomicUsize::new(cpu_index);
        }
        idle
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn process(&self) -> Option<&Arc<Process>> {
        self.process.as_ref()
    }

    pub(crate) fn is_idle(&self) -> bool {
        self.idle
    }

    pub fn state(&self) -> ThreadState {
        match self.state.load(Ordering::Acquire) {
            0 => ThreadState::Initial,
            1 => ThreadState::Runnable,
            2 => ThreadState::Running,
            3 => ThreadState::Waiting,
            _ => ThreadState::Done,
        }
    }

    pub(crate) fn set_state(&self, state: ThreadState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// Runnable -> Running, claimed by exactly one dispatcher.
    pub(crate) fn claim_running(&self) -> bool {
        self.state
            .compare_exchange(
                ThreadState::Runnable as u8,
                ThreadState::Running as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    pub(crate) fn is_waiting(&self) -> bool {
        self.state() == ThreadState::Waiting
    }

    pub(crate) fn set_runnable(&self) {
        self.set_state(ThreadState::Runnable);
    }

    pub(crate) fn set_wait_reason(&self, reason: Option<&'static str>) {
        unsafe { *self.wait_reason.get() = reason };
    }

    pub fn wait_reason(&self) -> Option<&'static str> {
        unsafe { *self.wait_reason.get() }
    }

    pub(crate) fn current_port(&self) -> Option<Arc<Port>> {
        unsafe { (*self.port.get()).clone() }
    }
}

/// The executing thread.
pub fn current() -> Arc<Thread> {
    #[cfg(not(target_os = "none"))]
    {
        crate::arch::hosted::current_thread()
    }
    #[cfg(target_os = "none")]
    {
        super::cpu::current().current_thread()
    }
}

/// Breaks an alertable wait with `Signalled` status, if one is in progress.
pub fn alert(thread: &Arc<Thread>) {
    if !thread.alertable.load(Ordering::Acquire) {
        return;
    }
    thread.alerted.store(true, Ordering::Release);

    loop {
        if thread
            .wait_status
            .compare_exchange(
                WaitStatus::Preparing as u8,
                WaitStatus::Satisfied as u8,
                Ordering::AcqRel,
                Ordering::Relaxed,
            )
            .is_ok()
        {
            return;
        }
        if thread
            .wait_status
            .compare_exchange(
                WaitStatus::Waiting as u8,
                WaitStatus::Satisfied as u8,
                Ordering::AcqRel,
                Ordering::Relaxed,
            )
            .is_ok()
        {
            super::object::wake_waiter(thread);
            return;
        }
        if thread.wait_status.load(Ordering::Acquire) == WaitStatus::Satisfied as u8 {
            return;
        }
    }
}

/// Arms trap recovery for copyin/copyout-style accesses; a kernel fault on
/// an unmapped address transfers control back with an error instead of
/// panicking while armed.
pub fn trap_recovery_begin() {
    current().in_trap_recovery.store(true, Ordering::Release);
}

pub fn trap_recovery_end() {
    current().in_trap_recovery.store(false, Ordering::Release);
}

// SPDX-License-Identifier: MPL-2.0

//! Processes and thread lifecycle.

use core::{
    cell::UnsafeCell,
    sync::atomic::{AtomicU8, Ordering},
};

use spin::Once;

use crate::prelude::*;

use crate::{
    ke::{
        ipl,
        sched,
        spinlock::RawSpinlock,
        thread::{self, Thread, ThreadState},
    },
    vm::procstate::ProcState,
};

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    Live = 0,
    Terminated = 1,
}

pub struct Process {
    lock: RawSpinlock,
    threads: UnsafeCell<Vec<Arc<Thread>>>,
    state: AtomicU8,
    pub vm: ProcState,
    name: String,
}

unsafe impl Send for Process {}
unsafe impl Sync for Process {}

impl Process {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> ProcessState {
        match self.state.load(Ordering::Acquire) {
            0 => ProcessState::Live,
            _ => ProcessState::Terminated,
        }
    }

    pub(crate) fn attach(&self, thread: &Arc<Thread>) {
        let old_ipl = self.lock.acquire();
        unsafe { (*self.threads.get()).push(thread.clone()) };
        self.lock.release(old_ipl);
    }

    pub(crate) fn detach(&self, thread: &Arc<Thread>) {
        let old_ipl = self.lock.acquire();
        let threads = unsafe { &mut *self.threads.get() };
        if let Some(pos) = threads.iter().position(|t| Arc::ptr_eq(t, thread)) {
            threads.remove(pos);
        }
        if threads.is_empty() {
            self.state
                .store(ProcessState::Terminated as u8, Ordering::Release);
        }
        self.lock.release(old_ipl);
    }

    pub fn thread_count(&self) -> usize {
        let old_ipl = self.lock.acquire();
        let count = unsafe { (*self.threads.get()).len() };
        self.lock.release(old_ipl);
        count
    }
}

static KERNEL_PROCESS: Once<Arc<Process>> = Once::new();

/// Creates the kernel process around the already-bootstrapped kernel
/// address-space state. Called once from VM bootstrap.
pub(crate) fn init_kernel_process(vm: ProcState) -> Arc<Process> {
    KERNEL_PROCESS
        .call_once(|| {
            Arc::new(Process {
                lock: RawSpinlock::new(),
                threads: UnsafeCell::new(Vec::new()),
                state: AtomicU8::new(ProcessState::Live as u8),
                vm,
                name: String::from("kernel"),
            })
        })
        .clone()
}

pub fn kernel_process() -> Arc<Process> {
    KERNEL_PROCESS.get().expect("kernel not bootstrapped").clone()
}

/// Creates a user process with a fresh address space.
pub fn process_create(name: &str) -> Result<Arc<Process>> {
    let vm = ProcState::new_user()?;
    let process = Arc::new(Process {
        lock: RawSpinlock::new(),
        threads: UnsafeCell::new(Vec::new()),
        state: AtomicU8::new(ProcessState::Live as u8),
        vm,
        name: String::from(name),
    });
    process.vm.bind_owner();
    crate::vm::balance::register_process(&process);
    Ok(process)
}

/// Creates a thread in `process`, ready to be resumed.
pub fn thread_create(
    process: &Arc<Process>,
    name: &str,
    entry: impl FnOnce() + Send + 'static,
) -> Arc<Thread> {
    let thread = Thread::new(String::from(name), Some(process.clone()));
    process.attach(&thread);

    #[cfg(not(target_os = "none"))]
    crate::arch::hosted::spawn_host_thread(thread.clone(), Box::new(entry));

    #[cfg(target_os = "none")]
    {
        // A hardware port builds the kernel stack and PCB here.
        let _ = entry;
        unimplemented!("thread stack setup is the platform port's");
    }

    thread
}

/// Creates and resumes a kernel-process thread.
pub fn create_kernel_thread(
    name: &str,
    entry: impl FnOnce() + Send + 'static,
) -> Arc<Thread> {
    let thread = thread_create(&kernel_process(), name, entry);
    sched::resume(&thread);
    thread
}

/// Marks the calling thread Done and leaves the processor. The done-thread
/// DPC drops the scheduler's final reference.
///
/// On a hardware port this never returns; under the hosted port the thread
/// wrapper regains control and lets the host thread finish.
pub fn exit_this_thread() {
    let thread = thread::current();
    if let Some(process) = thread.process() {
        process.detach(&thread);
    }

    let old_ipl = ipl::raise_to_dpc();
    thread.lock.acquire_nospl();
    thread.set_state(ThreadState::Done);
    sched::reschedule();
    ipl::lower(old_ipl);
}

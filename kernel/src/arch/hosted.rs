// SPDX-License-Identifier: MPL-2.0

//! The hosted platform port.
//!
//! Stands in for a hardware port when the kernel is built for a host OS:
//! every kernel thread is backed by a host thread, each host thread acts as
//! its own virtual CPU, the hardclock is driven by a ticker thread, and
//! "physical" memory is a leaked, page-aligned host allocation addressed
//! through an identity direct map. Context switch is park/unpark: a thread
//! that the scheduler switches away from parks until it is made Running
//! again; preempted (still-runnable) threads reclaim the processor at once,
//! since the host OS already runs everything in parallel.
//!
//! The port also supplies a byte-vector pagefile so the swap paths have a
//! backing store.

use core::sync::atomic::Ordering;
use core::time::Duration;

use std::{cell::Cell, cell::RefCell, collections::HashMap, io::Write, thread_local};

use alloc::{boxed::Box, string::String, sync::Arc, vec::Vec};

use spin::Once;

use super::Platform;
use crate::{
    config,
    ke::{
        cpu::{self, Cpu},
        dpc, ipl::Ipl, rcu, sched, thread::Thread, thread::ThreadState, timer,
    },
    vm::{self, object::Pagefile, Vaddr},
};

pub struct HostedPlatform;

static HOSTED: HostedPlatform = HostedPlatform;

pub(super) fn get() -> &'static HostedPlatform {
    &HOSTED
}

thread_local! {
    static IPL: Cell<u8> = const { Cell::new(0) };
    static CPU_INDEX: Cell<usize> = const { Cell::new(usize::MAX) };
    static CURRENT_THREAD: RefCell<Option<Arc<Thread>>> = const { RefCell::new(None) };
}

/// The virtual CPU owned by the calling host thread.
fn thread_cpu() -> &'static Cpu {
    let index = CPU_INDEX.with(|c| c.get());
    if index != usize::MAX {
        return cpu::cpu_by_index(index);
    }
    let cpu = cpu::register_cpu();
    CPU_INDEX.with(|c| c.set(cpu.index()));
    cpu
}

/// The kernel thread the calling host thread embodies. Host threads that
/// were not spawned through `ps` (test mains, the ticker) get a bootstrap
/// thread on first use.
pub fn current_thread() -> Arc<Thread> {
    if let Some(thread) = CURRENT_THREAD.with(|t| t.borrow().clone()) {
        return thread;
    }

    let thread = Thread::new(String::from("hosted-bootstrap"), None);
    thread.set_state(ThreadState::Running);
    *thread.pcb.host.lock() = Some(std::thread::current());
    install_current(thread.clone());
    thread
}

fn install_current(thread: Arc<Thread>) {
    let cpu = thread_cpu();
    thread.last_cpu.store(cpu.index(), Ordering::Relaxed);
    CURRENT_THREAD.with(|t| *t.borrow_mut() = Some(thread.clone()));
    cpu.sched_lock.acquire_nospl();
    unsafe { cpu.set_current_thread(thread) };
    cpu.sched_lock.release_nospl();
    sched::set_cpu_idle(cpu.index(), false);
}

/// Reclaims the calling host thread's virtual CPU after a park.
fn rebind_cpu(thread: &Arc<Thread>) {
    let cpu = thread_cpu();
    cpu.sched_lock.acquire_nospl();
    unsafe { cpu.set_current_thread(thread.clone()) };
    cpu.sched_lock.release_nospl();
    sched::set_cpu_idle(cpu.index(), false);
}

fn unpark(thread: &Arc<Thread>) {
    if let Some(handle) = thread.pcb.host.lock().clone() {
        handle.unpark();
    }
}

fn park_until_running(thread: &Arc<Thread>) {
    while thread.state() != ThreadState::Running {
        std::thread::park_timeout(Duration::from_micros(200));
    }
}

/// Pops host-backed runnable threads off a CPU's runqueue and lets the host
/// OS run them. The moral equivalent of taking the reschedule IPI.
pub(crate) fn dispatch_runnable(cpu: &'static Cpu) {
    let mut to_wake: Vec<Arc<Thread>> = Vec::new();

    if !cpu.sched_lock.try_acquire_nospl() {
        // Contended; the ticker will come around.
        return;
    }
    let runqueue = unsafe { &mut *cpu.runqueue.get() };
    let mut i = 0;
    while i < runqueue.len() {
        let thread = runqueue[i].clone();
        let host_backed = thread.pcb.host.lock().is_some();
        if host_backed && thread.claim_running() {
            runqueue.remove(i);
            to_wake.push(thread);
        } else if host_backed && thread.state() == ThreadState::Running {
            runqueue.remove(i);
        } else {
            i += 1;
        }
    }
    cpu.sched_lock.release_nospl();

    for thread in to_wake {
        unpark(&thread);
    }
}

impl Platform for HostedPlatform {
    fn current_ipl(&self) -> Ipl {
        IPL.with(|i| Ipl::from_raw(i.get()))
    }

    fn set_ipl(&self, ipl: Ipl) {
        IPL.with(|i| i.set(ipl as u8));
    }

    fn current_cpu_index(&self) -> usize {
        thread_cpu().index()
    }

    fn raise_dpc_interrupt(&self) {
        dispatch_runnable(thread_cpu());
    }

    fn send_dpc_ipi(&self, cpu: usize) {
        dispatch_runnable(cpu::cpu_by_index(cpu));
    }

    fn invlpg_local(&self, _vaddr: Vaddr) {
        // Software-walked tables; nothing cached.
    }

    fn send_invlpg_ipi(&self, _vaddr: Vaddr) {}

    fn tlb_flush_global(&self) {}

    fn switch(&self, old: &Arc<Thread>, new: &Arc<Thread>) {
        if !new.is_idle() {
            unpark(new);
        }

        match old.state() {
            ThreadState::Waiting => {
                park_until_running(old);
                rebind_cpu(old);
            }
            ThreadState::Runnable => {
                // Preempted; on a host every runnable thread has a
                // processor, so take the CPU straight back.
                let cpu = thread_cpu();
                cpu.sched_lock.acquire_nospl();
                let runqueue = unsafe { &mut *cpu.runqueue.get() };
                if let Some(pos) = runqueue.iter().position(|t| Arc::ptr_eq(t, old)) {
                    runqueue.remove(pos);
                }
                cpu.sched_lock.release_nospl();
                if !old.claim_running() {
                    park_until_running(old);
                }
                rebind_cpu(old);
            }
            ThreadState::Done => {
                // The host thread unwinds from here.
            }
            _ => {}
        }
    }

    fn intr_alloc(&self, _ipl: Ipl, shareable: bool) -> crate::Result<usize> {
        let mut vectors = INTERRUPTS.lock();
        let vector = vectors.len();
        vectors.push(Vector {
            shareable,
            handlers: Vec::new(),
        });
        Ok(vector)
    }

    fn intr_register(&self, vector: usize, handler: fn(usize)) -> crate::Result<()> {
        let mut vectors = INTERRUPTS.lock();
        let Some(slot) = vectors.get_mut(vector) else {
            return Err(crate::Error::new(crate::ErrorKind::NotPresent));
        };
        if !slot.handlers.is_empty() && !slot.shareable {
            return Err(crate::Error::with_message(
                crate::ErrorKind::ResourceExhausted,
                "vector is not shareable",
            ));
        }
        slot.handlers.push(handler);
        Ok(())
    }

    fn direct_map_offset(&self) -> usize {
        0
    }

    fn console_write(&self, s: &str) {
        let _ = std::io::stderr().write_all(s.as_bytes());
    }
}

struct Vector {
    shareable: bool,
    handlers: Vec<fn(usize)>,
}

static INTERRUPTS: spin::Mutex<Vec<Vector>> = spin::Mutex::new(Vec::new());

/// Simulates delivery of a device interrupt: runs the vector's handlers at
/// Device level, then lets the IPL drop drain any DPC work they queued.
pub fn deliver_interrupt(vector: usize) {
    let handlers = {
        let vectors = INTERRUPTS.lock();
        vectors
            .get(vector)
            .map(|v| v.handlers.clone())
            .unwrap_or_default()
    };
    let old_ipl = crate::ke::ipl::raise(Ipl::Device);
    for handler in handlers {
        handler(vector);
    }
    crate::ke::ipl::lower(old_ipl);
}

/// Backs a `ps` thread with a host thread.
pub(crate) fn spawn_host_thread(thread: Arc<Thread>, entry: Box<dyn FnOnce() + Send>) {
    std::thread::spawn(move || {
        *thread.pcb.host.lock() = Some(std::thread::current());

        // Wait to be resumed.
        loop {
            match thread.state() {
                ThreadState::Initial => {
                    std::thread::park_timeout(Duration::from_micros(200));
                }
                ThreadState::Runnable => {
                    if thread.claim_running() {
                        break;
                    }
                }
                ThreadState::Running => break,
                state => panic!("fresh thread in state {:?}", state),
            }
        }
        install_current(thread.clone());

        entry();

        crate::ps::exit_this_thread();
    });
}

fn ticker_main() {
    // The ticker impersonates every CPU's periodic interrupt.
    loop {
        for cpu in cpu::all_cpus() {
            timer::hardclock_for(cpu);

            let old_ipl = crate::ke::ipl::raise_to_dpc();
            dpc::dispatch_for(cpu);
            rcu::quiet(cpu);
            crate::ke::ipl::lower(old_ipl);

            dispatch_runnable(cpu);
        }
        std::thread::sleep(Duration::from_micros(50));
    }
}

/// A pagefile over host memory: drum slots are 4 KiB byte boxes.
struct VecPagefile {
    slots: spin::Mutex<HashMap<u64, Box<[u8]>>>,
    next_slot: core::sync::atomic::AtomicU64,
}

impl Pagefile for VecPagefile {
    fn alloc_slot(&self) -> crate::Result<u64> {
        Ok(self.next_slot.fetch_add(1, Ordering::Relaxed))
    }

    fn free_slot(&self, slot: u64) {
        self.slots.lock().remove(&slot);
    }

    fn read_slot(&self, slot: u64, buf: &mut [u8]) -> crate::Result<()> {
        let slots = self.slots.lock();
        let data = slots
            .get(&slot)
            .ok_or(crate::Error::new(crate::ErrorKind::NotPresent))?;
        buf.copy_from_slice(data);
        Ok(())
    }

    fn write_slot(&self, slot: u64, buf: &[u8]) -> crate::Result<()> {
        self.slots
            .lock()
            .insert(slot, buf.to_vec().into_boxed_slice());
        Ok(())
    }
}

const HOSTED_RAM_BYTES: usize = 64 * 1024 * 1024;

static INIT: Once<()> = Once::new();

/// Brings the kernel up on the host: platform and logger registration, a
/// donated RAM region, the kernel process, allocators, the buffer cache,
/// the pagefile, and the ticker. Idempotent; every test path calls it
/// first.
pub fn init_kernel() {
    INIT.call_once(|| {
        super::set_platform(get());
        crate::logger::init();

        let layout =
            core::alloc::Layout::from_size_align(HOSTED_RAM_BYTES, config::PAGE_SIZE).unwrap();
        // Leaked on purpose: this is the machine's RAM.
        let base = unsafe { std::alloc::alloc_zeroed(layout) };
        assert!(!base.is_null());

        vm::bootstrap(base as usize, HOSTED_RAM_BYTES, config::BootConfig::default());

        vm::object::set_pagefile(Box::leak(Box::new(VecPagefile {
            slots: spin::Mutex::new(HashMap::new()),
            next_slot: core::sync::atomic::AtomicU64::new(1),
        })));

        std::thread::Builder::new()
            .name(String::from("hosted-ticker"))
            .spawn(ticker_main)
            .unwrap();
    });
}

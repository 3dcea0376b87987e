// SPDX-License-Identifier: MPL-2.0

//! Deferred procedure calls.
//!
//! A DPC runs at IPL = DPC from the software-interrupt return path. Each CPU
//! owns a FIFO guarded (together with the timer queue) at IPL = High.
//! Enqueueing below DPC just runs the callback inline under a temporary
//! raise; enqueueing an already-queued DPC is dropped.

use core::sync::atomic::{AtomicUsize, Ordering};

use super::{
    cpu::{self, Cpu, RescheduleReason},
    ipl::{self, Ipl},
    sched,
};
use crate::arch;

const DPC_NO_CPU: usize = usize::MAX;

/// Packs a CPU index into a DPC argument.
pub(crate) fn dpc_arg(index: usize) -> usize {
    index
}

pub struct Dpc {
    callback: fn(usize),
    arg: usize,
    /// Index of the CPU whose queue holds this DPC, or `DPC_NO_CPU`.
    cpu: AtomicUsize,
}

impl Dpc {
    pub const fn new(callback: fn(usize), arg: usize) -> Dpc {
        Dpc {
            callback,
            arg,
            cpu: AtomicUsize::new(DPC_NO_CPU),
        }
    }
}

/// Enqueues `dpc` on the executing CPU, or runs it inline if the caller is
/// below DPC level.
pub fn enqueue(dpc: &'static Dpc) {
    if ipl::current() < Ipl::Dpc {
        let old = ipl::raise_to_dpc();
        (dpc.callback)(dpc.arg);
        ipl::lower(old);
        return;
    }

    let cpu = cpu::current();
    let mut deferred = cpu.deferred.lock();
    if dpc.cpu.load(Ordering::Relaxed) == DPC_NO_CPU {
        dpc.cpu.store(cpu.index(), Ordering::Relaxed);
        deferred.dpcs.push_back(dpc);
        arch::platform().raise_dpc_interrupt();
    }
    drop(deferred);
}

/// Runs the executing CPU's pending DPCs, then any requested reschedule.
///
/// Entered at IPL = DPC from the interrupt return path (or from
/// `ipl::lower` crossing the DPC boundary).
pub(crate) fn dispatch_current() {
    debug_assert_eq!(ipl::current(), Ipl::Dpc);
    dispatch_for(cpu::current());

    let cpu = cpu::current();
    if cpu.reschedule_reason() != RescheduleReason::None {
        let thread = cpu.current_thread();
        thread.lock.acquire_nospl();
        sched::reschedule();
        // IPL stays at DPC; the old thread's lock was dropped inside.
    }
}

/// Drains one CPU's DPC queue. The callbacks run at the caller's (DPC or
/// higher) level.
pub(crate) fn dispatch_for(cpu: &'static Cpu) {
    loop {
        let mut deferred = cpu.deferred.lock();
        let Some(dpc) = deferred.dpcs.pop_front() else {
            break;
        };
        dpc.cpu.store(DPC_NO_CPU, Ordering::Relaxed);
        drop(deferred);

        (dpc.callback)(dpc.arg);
    }
}

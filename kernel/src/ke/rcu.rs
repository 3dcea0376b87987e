// SPDX-License-Identifier: MPL-2.0

//! RCU: Classic Edition.
//!
//! Read sides run at IPL = DPC, so a CPU passing through the scheduler is a
//! quiescent state. A global generation is a bitmap of CPUs that have yet
//! to quiesce; per-CPU callback lists ride generations from next to current
//! to past, and past callbacks run from a DPC.

use smallvec::SmallVec;

use crate::prelude::*;

use super::{
    cpu::{self, Cpu},
    event::Event,
    ipl::{self, Ipl},
    spinlock::SpinLock,
    wait,
};

type Callback = Box<dyn FnOnce() + Send>;

pub(crate) struct RcuCpu {
    /// Generation whose completion releases `current`.
    generation: u64,
    past: VecDeque<Callback>,
    current: VecDeque<Callback>,
    next: VecDeque<Callback>,
}

impl RcuCpu {
    pub(crate) fn new() -> RcuCpu {
        RcuCpu {
            generation: 0,
            past: VecDeque::new(),
            current: VecDeque::new(),
            next: VecDeque::new(),
        }
    }
}

struct RcuGlobal {
    /// CPUs that have yet to quiesce for the current generation.
    quiesced: u64,
    generation: u64,
    highest_generation: u64,
}

static RCU: SpinLock<RcuGlobal> = SpinLock::new(RcuGlobal {
    quiesced: 0,
    generation: 0,
    highest_generation: 0,
});

fn start_generation(global: &mut RcuGlobal) {
    // A new generation sets every CPU's bit, bumps the current generation,
    // and pins the maximum to it.
    let ncpus = cpu::cpu_count() as u32;
    global.quiesced = if ncpus >= 64 {
        u64::MAX
    } else {
        (1u64 << ncpus) - 1
    };
    global.generation += 1;
    global.highest_generation = global.generation;
}

/// An RCU read side: IPL held at DPC for its lifetime.
pub struct RcuReadGuard {
    old_ipl: Ipl,
}

pub fn read_lock() -> RcuReadGuard {
    RcuReadGuard {
        old_ipl: ipl::raise_to_dpc(),
    }
}

impl Drop for RcuReadGuard {
    fn drop(&mut self) {
        ipl::lower(self.old_ipl);
    }
}

/// Runs `callback` after a grace period.
pub fn call(callback: Callback) {
    let old_ipl = ipl::raise_to_dpc();
    cpu::current().rcu.lock().next.push_back(callback);
    ipl::lower(old_ipl);
}

/// Blocks until every reader that predates the call has finished.
pub fn synchronise() {
    let event = Arc::new(Event::new(false));
    let signaller = event.clone();
    call(Box::new(move || {
        signaller.signal();
    }));
    wait::wait_one(&*event, "rcu synchronise", false, wait::TIMEOUT_INFINITE)
        .expect("infinite wait cannot fail");
}

/// Notes a quiescent state on `cpu` and advances its callback lists.
pub(crate) fn quiet(cpu: &'static Cpu) {
    let bit = 1u64 << cpu.index();
    let mut want_dpc = false;

    {
        let mut global = RCU.lock();

        if global.quiesced & bit != 0 {
            global.quiesced &= !bit;
            if global.quiesced == 0 {
                // Last CPU in: the generation completes, and another starts
                // if one is owed.
                global.generation += 1;
                if global.generation <= global.highest_generation {
                    start_generation(&mut global);
                }
            }
        }

        let mut rcpu = cpu.rcu.lock();

        if !rcpu.current.is_empty() && global.generation > rcpu.generation {
            let drained: VecDeque<_> = rcpu.current.drain(..).collect();
            rcpu.past.extend(drained);
            want_dpc = true;
        }

        if rcpu.current.is_empty() && !rcpu.next.is_empty() {
            let drained: VecDeque<_> = rcpu.next.drain(..).collect();
            rcpu.current.extend(drained);
            rcpu.generation = global.generation + 1;

            if global.quiesced != 0 {
                // A generation is in flight; owe one that starts after it.
                assert!(global.highest_generation <= rcpu.generation);
                global.highest_generation = rcpu.generation + 1;
            } else {
                start_generation(&mut global);
            }
        }
    }

    if want_dpc {
        super::dpc::enqueue(&cpu.rcu_dpc);
    }
}

/// Runs a CPU's matured callbacks.
pub(crate) fn past_callbacks_dpc(cpu_index: usize) {
    let cpu = cpu::cpu_by_index(cpu_index);
    loop {
        let mut batch: SmallVec<[Callback; 4]> = SmallVec::new();
        {
            let mut rcpu = cpu.rcu.lock();
            while let Some(cb) = rcpu.past.pop_front() {
                batch.push(cb);
            }
        }
        if batch.is_empty() {
            break;
        }
        for cb in batch {
            cb();
        }
    }
}

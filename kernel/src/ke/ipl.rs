// SPDX-License-Identifier: MPL-2.0

//! Interrupt priority levels.
//!
//! IPL is a per-CPU priority in 0..=15. Raising masks interrupt sources at
//! or below the new level; lowering below DPC drains the CPU's DPC queue
//! before control returns to the caller. Blocking is legal only at IPL
//! below DPC while holding no spinlock.

use crate::arch;

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Ipl {
    Passive = 0,
    Apc = 1,
    Dpc = 2,
    Device = 13,
    High = 15,
}

impl Ipl {
    pub fn from_raw(raw: u8) -> Ipl {
        match raw {
            0 => Ipl::Passive,
            1 => Ipl::Apc,
            2 => Ipl::Dpc,
            13 => Ipl::Device,
            15 => Ipl::High,
            _ => panic!("bad IPL {}", raw),
        }
    }
}

/// Reads the executing CPU's IPL.
pub fn current() -> Ipl {
    arch::platform().current_ipl()
}

/// Raises IPL to at least `new`, returning the previous level. Already
/// being above `new` is a no-op, as with a High-context caller taking a
/// DPC-level lock.
pub fn raise(new: Ipl) -> Ipl {
    let platform = arch::platform();
    let old = platform.current_ipl();
    if new > old {
        platform.set_ipl(new);
    }
    old
}

/// Raises to DPC level.
pub fn raise_to_dpc() -> Ipl {
    raise(Ipl::Dpc)
}

/// Restores IPL to `old`, which must not exceed the current level.
///
/// Crossing the DPC -> passive boundary dispatches the CPU's pending DPCs
/// (and any requested reschedule) first.
pub fn lower(old: Ipl) {
    let platform = arch::platform();
    let cur = platform.current_ipl();
    assert!(old <= cur, "IPL {:?} -> {:?} is a raising", cur, old);

    if cur >= Ipl::Dpc && old < Ipl::Dpc {
        platform.set_ipl(Ipl::Dpc);
        crate::ke::dpc::dispatch_current();
    }
    platform.set_ipl(old);
}

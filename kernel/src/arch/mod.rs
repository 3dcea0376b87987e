// SPDX-License-Identifier: MPL-2.0

//! Architecture backends and the platform seam.
//!
//! Each backend module supplies the page-table geometry and the PTE
//! encode/decode primitives for one port. Nothing above [`crate::vm::pte`]
//! observes the bit layouts. The active backend is selected per target; host
//! builds fall back to the x86_64 layout, which the hosted platform walks in
//! software.
//!
//! The [`Platform`] trait is the downward interface a port registers at
//! bootstrap: context switching, DPC/TLB IPIs, the IPL cell and console
//! output. The hardclock and page-fault upcalls run in the other direction
//! (`ke::timer::hardclock`, `vm::fault`).

pub mod aarch64;
pub mod m68k;
pub mod riscv64;
pub mod x86_64;

#[cfg(not(target_os = "none"))]
pub mod hosted;

use alloc::sync::Arc;

use spin::Once;

use crate::{
    ke::{ipl::Ipl, thread::Thread},
    vm::Vaddr,
};

cfg_if::cfg_if! {
    if #[cfg(target_arch = "aarch64")] {
        pub use aarch64 as current;
    } else if #[cfg(target_arch = "riscv64")] {
        pub use riscv64 as current;
    } else if #[cfg(target_arch = "m68k")] {
        pub use m68k as current;
    } else {
        pub use x86_64 as current;
    }
}

/// Software (non-valid) PTE categories shared by every backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SoftKind {
    /// Points at a pagefile slot.
    Swap = 0,
    /// A page-in is in flight; payload is the transition page's frame.
    Busy = 1,
    /// Page is between memory and the pagefile; payload is its frame.
    Trans = 2,
    /// Compressed pointer to a fork page.
    Fork = 3,
}

impl SoftKind {
    pub(crate) fn from_bits(bits: u64) -> SoftKind {
        match bits & 0b11 {
            0 => SoftKind::Swap,
            1 => SoftKind::Busy,
            2 => SoftKind::Trans,
            _ => SoftKind::Fork,
        }
    }
}

/// The downward interface supplied by a platform port.
///
/// Everything here is machine-dependent: a limine-booted SMP port implements
/// it with real context switches and IPIs, the hosted port with host
/// threads. Registered once at bootstrap.
pub trait Platform: Sync {
    /// Reads the current CPU's interrupt priority level.
    fn current_ipl(&self) -> Ipl;

    /// Writes the current CPU's interrupt priority level. Masking only; DPC
    /// draining is the caller's business (`ke::ipl::lower`).
    fn set_ipl(&self, ipl: Ipl);

    /// Index of the executing CPU in the CPU registry.
    fn current_cpu_index(&self) -> usize;

    /// Requests a DPC-level software interrupt on the executing CPU.
    fn raise_dpc_interrupt(&self);

    /// Sends a DPC/reschedule IPI to another CPU.
    fn send_dpc_ipi(&self, cpu: usize);

    /// Invalidates one local TLB entry.
    fn invlpg_local(&self, vaddr: Vaddr);

    /// Broadcast-invalidates a mapping on every CPU.
    fn send_invlpg_ipi(&self, vaddr: Vaddr);

    /// Flushes the whole TLB on every CPU.
    fn tlb_flush_global(&self);

    /// Switches machine context from `old` to `new`.
    ///
    /// Called at IPL = DPC with no spinlocks held; scheduler state for both
    /// threads is already published.
    fn switch(&self, old: &Arc<Thread>, new: &Arc<Thread>);

    /// Allocates a device interrupt vector delivered at `ipl`.
    fn intr_alloc(&self, ipl: Ipl, shareable: bool) -> crate::Result<usize>;

    /// Attaches a handler to an allocated vector. Shareable vectors may
    /// carry several handlers; each runs with the vector number.
    fn intr_register(&self, vector: usize, handler: fn(usize)) -> crate::Result<()>;

    /// Dumps a backtrace of the interrupted context to the console.
    fn intr_frame_trace(&self) {}

    /// Offset of the physical direct map in kernel virtual space.
    fn direct_map_offset(&self) -> usize;

    /// Writes bytes to the boot console.
    fn console_write(&self, s: &str);
}

static PLATFORM: Once<&'static dyn Platform> = Once::new();

/// Registers the platform port. May be called once.
pub fn set_platform(platform: &'static dyn Platform) {
    PLATFORM.call_once(|| platform);
}

/// Returns the registered platform.
///
/// Host builds install the hosted port on first use so that unit tests need
/// no explicit bootstrap.
pub fn platform() -> &'static dyn Platform {
    #[cfg(not(target_os = "none"))]
    {
        *PLATFORM.call_once(|| hosted::get())
    }
    #[cfg(target_os = "none")]
    {
        *PLATFORM.get().expect("no platform registered")
    }
}

// SPDX-License-Identifier: MPL-2.0

//! Central tunables.
//!
//! Compile-time defaults live here; the handful that an image assembler may
//! want to pick are gathered in [`BootConfig`] and fixed at bootstrap.

/// Base-2 logarithm of the page size.
pub const PAGE_SHIFT: usize = 12;

/// The page size. All four supported ports run 4 KiB pages.
pub const PAGE_SIZE: usize = 1 << PAGE_SHIFT;

/// Number of buddy freelist orders (orders 0 ..= BUDDY_ORDERS - 1).
pub const BUDDY_ORDERS: usize = 16;

/// Hardclock frequency in ticks per second.
pub const KERN_HZ: u64 = 1000;

pub const NS_PER_S: u64 = 1_000_000_000;

/// Nanoseconds added to a CPU clock per hardclock tick.
pub const NS_PER_TICK: u64 = NS_PER_S / KERN_HZ;

/// Timeslice granted to a freshly scheduled thread, in hardclock ticks.
pub const TIMESLICE_TICKS: i32 = 5;

/// Size of one unified-buffer-cache window.
pub const UBC_WINDOW_SIZE: usize = 256 * 1024;

/// Objects up to this size go in small (single-page) slabs.
pub const SMALL_SLAB_MAX: usize = 512;

/// Largest `kmem_alloc` size served from a sized cache; bigger requests go
/// straight to the wired heap.
pub const KMEM_MAX_CACHED: usize = 4096;

/// Default cap on working-set entries for a fresh process.
pub const WS_DEFAULT_MAX: usize = 4096;

/// Working-set entries evicted per balance-set visit to one process.
pub const WS_TRIM_BATCH: usize = 8;

/// Upper bound on CPUs; the idle mask and RCU bitmap are single words.
pub const MAX_CPUS: usize = 64;

/// Bootstrap-time configuration.
#[derive(Debug, Clone, Copy)]
pub struct BootConfig {
    /// Number of UBC windows to carve.
    pub ubc_windows: usize,
    /// Default working-set maximum for new processes.
    pub ws_default_max: usize,
}

impl Default for BootConfig {
    fn default() -> Self {
        BootConfig {
            ubc_windows: 32,
            ws_default_max: WS_DEFAULT_MAX,
        }
    }
}

// SPDX-License-Identifier: MPL-2.0

//! The virtual-memory manager.

pub mod balance;
pub mod fault;
pub mod fork;
pub mod kmem;
pub mod kwired;
pub mod map;
pub mod mdl;
pub mod object;
pub mod page;
pub mod pfndb;
pub mod procstate;
pub mod pte;
pub mod ubc;
pub mod vmem;
pub mod wire;
pub mod wsl;

use spin::Once;

use crate::{arch, config::BootConfig};

pub type Vaddr = usize;
pub type Paddr = usize;
pub type Pfn = usize;

bitflags::bitflags! {
    /// Page protection.
    pub struct VmProtection: u8 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const EXECUTE = 1 << 2;
    }
}

cfg_if::cfg_if! {
    if #[cfg(target_pointer_width = "64")] {
        /// User dynamic address space.
        pub const LOWER_HALF_BASE: Vaddr = 0x0000_0000_0001_0000;
        pub const LOWER_HALF_SIZE: usize = 0x0000_7fff_fffe_0000;
        /// Kernel dynamic address space.
        pub const KVM_DYNAMIC_BASE: Vaddr = 0xffff_9000_0000_0000;
        pub const KVM_DYNAMIC_SIZE: usize = 0x0000_0080_0000_0000;
        /// Buffer-cache window space.
        pub const KVM_UBC_BASE: Vaddr = 0xffff_a000_0000_0000;
    } else {
        pub const LOWER_HALF_BASE: Vaddr = 0x0001_0000;
        pub const LOWER_HALF_SIZE: usize = 0x7ffe_0000;
        pub const KVM_DYNAMIC_BASE: Vaddr = 0xc000_0000;
        pub const KVM_DYNAMIC_SIZE: usize = 0x1000_0000;
        pub const KVM_UBC_BASE: Vaddr = 0xd000_0000;
    }
}

/// Maps a physical address through the direct map.
pub fn paddr_to_vaddr(paddr: Paddr) -> Vaddr {
    paddr + arch::platform().direct_map_offset()
}

/// A raw byte pointer into the direct map.
pub(crate) fn paddr_ptr(paddr: Paddr) -> *mut u8 {
    paddr_to_vaddr(paddr) as *mut u8
}

/// The page of bytes at `paddr`, via the direct map.
///
/// # Safety
///
/// `paddr` must be a page-aligned address inside a PFN-database region that
/// the caller has the right to touch.
pub(crate) unsafe fn page_bytes<'a>(paddr: Paddr) -> &'a mut [u8] {
    unsafe { core::slice::from_raw_parts_mut(paddr_ptr(paddr), crate::config::PAGE_SIZE) }
}

static BOOT_CONFIG: Once<BootConfig> = Once::new();

pub fn boot_config() -> &'static BootConfig {
    BOOT_CONFIG.get().expect("VM not bootstrapped")
}

/// Brings the virtual-memory manager up over one RAM region: the PFN
/// database, the kernel address-space state and process, the wired heap and
/// slab caches, and the buffer cache.
pub fn bootstrap(base: Paddr, length: usize, boot_config: BootConfig) {
    BOOT_CONFIG.call_once(|| boot_config);

    pfndb::add_region(base, length);

    let kernel_vm = procstate::ProcState::new_kernel();
    let kernel_process = crate::ps::init_kernel_process(kernel_vm);
    kernel_process.vm.bind_owner();
    balance::register_process(&kernel_process);

    kwired::init();
    kmem::init();
    ubc::init(boot_config.ubc_windows);

    log::info!(
        "vm: bootstrapped over {} MiB of RAM",
        length / (1024 * 1024)
    );
}

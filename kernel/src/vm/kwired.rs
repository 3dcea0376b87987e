// SPDX-License-Identifier: MPL-2.0

//! The kernel wired heap: a VMem arena over direct-mapped page runs.
//!
//! The arena imports spans by taking naturally aligned runs from the buddy
//! allocator, so every address it hands out is backed by resident, wired
//! pages. The slab caches sit on top.

use spin::Once;

use crate::prelude::*;

use super::{
    page::PageUse,
    pfndb::{self, PfnDb},
    vmem::{AllocConstraints, SpanSource, Vmem},
    Vaddr,
};
use crate::{
    config::{PAGE_SHIFT, PAGE_SIZE},
    ke::SpinLock,
};

struct PageRunSource;

impl SpanSource for PageRunSource {
    fn import(&self, size: usize, db: &mut PfnDb) -> Result<(usize, usize)> {
        let npages = size.div_ceil(PAGE_SIZE);
        let order = npages.next_power_of_two().trailing_zeros() as usize;
        let run = db.alloc_pages(order, PageUse::KWired, false, false)?;
        Ok((
            super::paddr_to_vaddr(run.paddr()),
            (1 << order) * PAGE_SIZE,
        ))
    }

    fn release(&self, base: usize, _size: usize, db: &mut PfnDb) {
        let page = pfndb::page_by_paddr(base - crate::arch::platform().direct_map_offset())
            .expect("wired span outside the PFN database");
        db.delete_page(page);
        db.release_page(page);
    }
}

static KERNEL_WIRED: Once<SpinLock<Vmem>> = Once::new();

/// Spans are imported sixteen pages at a time.
const IMPORT_QUANTUM: usize = 16 * PAGE_SIZE;

pub(crate) fn init() {
    KERNEL_WIRED.call_once(|| {
        SpinLock::new(Vmem::new_imported(
            "kernel-wired",
            PAGE_SIZE,
            Box::new(PageRunSource),
            IMPORT_QUANTUM,
        ))
    });
}

fn arena() -> &'static SpinLock<Vmem> {
    KERNEL_WIRED.get().expect("wired heap not bootstrapped")
}

/// Allocates `npages` of wired kernel memory.
pub fn kalloc_wired(npages: usize) -> Result<Vaddr> {
    // Lock order: PFN lock, then the arena.
    let mut db = pfndb::lock();
    let mut vmem = arena().lock();
    vmem.xalloc(
        npages * PAGE_SIZE,
        AllocConstraints::default(),
        Some(&mut *db),
    )
}

/// Frees a wired allocation. The size must match.
pub fn kfree_wired(addr: Vaddr, npages: usize) {
    let _db = pfndb::lock();
    let mut vmem = arena().lock();
    let freed = vmem.xfree(addr, npages * PAGE_SIZE);
    assert_eq!(freed, npages * PAGE_SIZE);
}

/// The wired page behind a heap address.
pub(crate) fn page_of(addr: Vaddr) -> &'static crate::vm::page::Page {
    let paddr = (addr & !(PAGE_SIZE - 1)) - crate::arch::platform().direct_map_offset();
    pfndb::page_by_pfn(paddr >> PAGE_SHIFT).expect("wired address outside the PFN database")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wired_memory_is_usable_and_reusable() {
        crate::arch::hosted::init_kernel();
        let addr = kalloc_wired(2).unwrap();
        let bytes = unsafe { core::slice::from_raw_parts_mut(addr as *mut u8, 2 * PAGE_SIZE) };
        bytes[0] = 0xa5;
        bytes[2 * PAGE_SIZE - 1] = 0x5a;
        assert_eq!(bytes[0], 0xa5);
        kfree_wired(addr, 2);

        let again = kalloc_wired(1).unwrap();
        kfree_wired(again, 1);
    }
}

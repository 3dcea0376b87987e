// SPDX-License-Identifier: MPL-2.0

//! Map entries (VADs) and address-space operations.
//!
//! A VAD reserves `[start, end)` with a protection, an optional backing
//! object and page offset, and the fork disposition (shared or
//! copy-on-write). VADs never overlap: address space is carved by the
//! process's VMem arena first, so the tree keyed by start address is
//! enough. Unmapping tears PTEs down page by page, with the usual
//! page-table bookkeeping propagating table frees.

use crate::prelude::*;

use super::{
    fork,
    object::{self, VmObject},
    page::PageUse,
    pfndb,
    procstate::ProcState,
    pte::{Pte, PteKind},
    vmem::AllocConstraints,
    wire, Paddr, Vaddr, VmProtection,
};
use crate::{arch::current as md, config::PAGE_SIZE, util::AlignExt};

pub struct MapEntry {
    pub start: Vaddr,
    pub end: Vaddr,
    pub protection: VmProtection,
    pub max_protection: VmProtection,
    pub cow: bool,
    pub inherit_shared: bool,
    pub object: Option<Arc<VmObject>>,
    /// Page-granular offset into the object.
    pub offset_pages: u64,
}

impl MapEntry {
    pub fn size(&self) -> usize {
        self.end - self.start
    }
}

/// Reserves address space and maps a view of `object` (or fresh anonymous
/// memory when `object` is none).
#[allow(clippy::too_many_arguments)]
pub fn map_object_view(
    ps: &ProcState,
    object: Option<Arc<VmObject>>,
    vaddr: Option<Vaddr>,
    size: usize,
    offset: u64,
    protection: VmProtection,
    max_protection: VmProtection,
    inherit_shared: bool,
    cow: bool,
) -> Result<Vaddr> {
    assert!(size.is_aligned_to(PAGE_SIZE));
    assert!((offset as usize).is_aligned_to(PAGE_SIZE));

    let mut map = ps.map.write();

    let start = match vaddr {
        Some(addr) => map.vmem.xalloc_exact(addr, size)?,
        None => map
            .vmem
            .xalloc(size, AllocConstraints::default(), None)?,
    };

    if let Some(object) = object.as_ref() {
        object.map_entry_insert(start, start + size);
    }

    map.vads.insert(
        start,
        MapEntry {
            start,
            end: start + size,
            protection,
            max_protection,
            cow,
            inherit_shared,
            object,
            offset_pages: offset / PAGE_SIZE as u64,
        },
    );

    Ok(start)
}

/// Reserves plain demand-zero anonymous memory.
pub fn allocate(ps: &ProcState, vaddr: Option<Vaddr>, size: usize) -> Result<Vaddr> {
    map_object_view(
        ps,
        None,
        vaddr,
        size,
        0,
        VmProtection::all(),
        VmProtection::all(),
        false,
        false,
    )
}

/// Maps a physical range (device memory) eagerly: the PTEs are created
/// wired, with no working-set entries and no page records behind them.
pub fn map_physical_view(
    ps: &ProcState,
    vaddr: Option<Vaddr>,
    size: usize,
    phys: Paddr,
    protection: VmProtection,
    max_protection: VmProtection,
) -> Result<Vaddr> {
    assert!(size.is_aligned_to(PAGE_SIZE));
    assert!(phys.is_aligned_to(PAGE_SIZE));

    let start = map_object_view(
        ps,
        None,
        vaddr,
        size,
        phys as u64,
        protection,
        max_protection,
        false,
        false,
    )?;

    let mut db = pfndb::lock();
    for i in (0..size).step_by(PAGE_SIZE) {
        let state = match wire::wire_pte(&mut db, ps, start + i) {
            Ok(state) => state,
            Err(_) => return_error_with_message!(ErrorKind::OutOfMemory, "wiring physical view"),
        };
        state.pte.write(Pte::hw(
            (phys + i) >> crate::config::PAGE_SHIFT,
            protection.contains(VmProtection::WRITE),
            !ps.is_kernel(),
        ));
        wire::noswap_pte_created(state.leaf_table(), true);
        state.release(&mut db);
    }

    Ok(start)
}

/// Releases `[start, start + size)`: whole VADs go, partially covered VADs
/// shrink, and a VAD pierced through the middle splits in two.
pub fn deallocate(ps: &ProcState, start: Vaddr, size: usize) -> Result<()> {
    let end = start + size;
    let mut map = ps.map.write();

    let starts: Vec<Vaddr> = map.vads.keys().copied().collect();
    for vad_start in starts {
        let (vad_end, offset_pages) = {
            let vad = &map.vads[&vad_start];
            (vad.end, vad.offset_pages)
        };

        if vad_end <= start || vad_start >= end {
            continue;
        }

        if vad_start >= start && vad_end <= end {
            // Wholly encompassed.
            let vad = map.vads.remove(&vad_start).unwrap();
            let freed = map.vmem.xfree(vad_start, vad_end - vad_start);
            assert_eq!(freed, vad_end - vad_start);
            if let Some(object) = vad.object.as_ref() {
                object.map_entry_remove(vad_start, vad_end);
            }
            unmap_range(ps, vad_start, vad_end);
        } else if vad_start < start && vad_end <= end {
            // Right side of the VAD goes.
            let full = vad_end - vad_start;
            assert_eq!(map.vmem.xfree(vad_start, full), full);
            {
                let vad = map.vads.get_mut(&vad_start).unwrap();
                vad.end = start;
                if let Some(object) = vad.object.as_ref() {
                    object.map_entry_resize(vad_start, vad_end, vad_start, start);
                }
            }
            unmap_range(ps, start, vad_end);
            map.vmem.xalloc_exact(vad_start, start - vad_start)?;
        } else if vad_start >= start && vad_end > end {
            // Left side of the VAD goes.
            let full = vad_end - vad_start;
            assert_eq!(map.vmem.xfree(vad_start, full), full);
            let mut vad = map.vads.remove(&vad_start).unwrap();
            vad.start = end;
            vad.offset_pages = offset_pages + ((end - vad_start) / PAGE_SIZE) as u64;
            if let Some(object) = vad.object.as_ref() {
                object.map_entry_resize(vad_start, vad_end, end, vad_end);
            }
            map.vads.insert(end, vad);
            unmap_range(ps, vad_start, end);
            map.vmem.xalloc_exact(end, vad_end - end)?;
        } else {
            // Pierced through the middle: split in two.
            let full = vad_end - vad_start;
            assert_eq!(map.vmem.xfree(vad_start, full), full);
            let (object, protection, max_protection, cow, inherit_shared) = {
                let vad = map.vads.get_mut(&vad_start).unwrap();
                vad.end = start;
                (
                    vad.object.clone(),
                    vad.protection,
                    vad.max_protection,
                    vad.cow,
                    vad.inherit_shared,
                )
            };
            if let Some(object) = object.as_ref() {
                object.map_entry_resize(vad_start, vad_end, vad_start, start);
                object.map_entry_insert(end, vad_end);
            }
            map.vads.insert(
                end,
                MapEntry {
                    start: end,
                    end: vad_end,
                    protection,
                    max_protection,
                    cow,
                    inherit_shared,
                    object,
                    offset_pages: offset_pages + ((end - vad_start) / PAGE_SIZE) as u64,
                },
            );
            unmap_range(ps, start, end);
            map.vmem.xalloc_exact(vad_start, start - vad_start)?;
            map.vmem.xalloc_exact(end, vad_end - end)?;
        }
    }

    Ok(())
}

/// Tears down every PTE in `[start, end)` along with its working-set
/// entries, releasing or retiring the pages behind them.
pub(crate) fn unmap_range(ps: &ProcState, start: Vaddr, end: Vaddr) {
    let mut ws = ps.ws.lock();
    let mut db = pfndb::lock();

    let mut vaddr = start;
    while vaddr < end {
        let pte_ref = match wire::probe_pte(ps, vaddr) {
            Ok(pte_ref) => pte_ref,
            Err(level) => {
                // Whole subtree absent: skip to its end.
                let span = md::level_span(level);
                vaddr = vaddr.align_down(span) + span;
                continue;
            }
        };

        let pte = pte_ref.read();
        let leaf_table = pfndb::page_by_paddr(pte_ref.table_paddr()).unwrap();

        match pte.kind() {
            PteKind::Zero => {}
            PteKind::Valid => {
                let page = pfndb::page_by_pfn(pte.hw_pfn()).unwrap();
                pte_ref.write(Pte::zero());
                wire::pte_deleted(&mut db, leaf_table, true);
                if page.referent_pte() == pte_ref.paddr() {
                    page.set_referent_pte(0);
                }
                match page.use_() {
                    PageUse::AnonPrivate => {
                        db.delete_page(page);
                        db.release_page(page);
                    }
                    PageUse::FileShared => {
                        db.release_page(page);
                    }
                    PageUse::AnonFork => {
                        db.release_page(page);
                        fork::unref_forkpage_of_page(&mut db, page);
                    }
                    use_ => panic!("unmapping a {:?} page", use_),
                }
            }
            PteKind::Trans | PteKind::Busy => {
                let page = pfndb::page_by_pfn(pte.soft_pfn()).unwrap();
                pte_ref.write(Pte::zero());
                wire::pte_deleted(&mut db, leaf_table, true);
                // Mid-flight I/O holds its own reference; the frame goes
                // when that drops.
                if page.use_() != PageUse::Deleted {
                    db.delete_page(page);
                }
            }
            PteKind::Swap => {
                let slot = pte.swap_slot();
                pte_ref.write(Pte::zero());
                wire::pte_deleted(&mut db, leaf_table, false);
                object::pagefile().free_slot(slot);
            }
            PteKind::Fork => {
                let addr = pte.fork_addr();
                pte_ref.write(Pte::zero());
                wire::pte_deleted(&mut db, leaf_table, false);
                fork::unref_forkpage_at(&mut db, addr);
            }
        }

        ws.remove(vaddr);
        crate::arch::platform().invlpg_local(vaddr);
        vaddr += PAGE_SIZE;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ps;

    #[test]
    fn vad_find_uses_half_open_ranges() {
        crate::arch::hosted::init_kernel();
        let proc = ps::process_create("map-test").unwrap();
        let base = allocate(&proc.vm, None, 4 * PAGE_SIZE).unwrap();

        let map = proc.vm.map.read();
        assert!(map.vad_find(base).is_some());
        assert!(map.vad_find(base + 4 * PAGE_SIZE - 1).is_some());
        assert!(map.vad_find(base + 4 * PAGE_SIZE).is_none());
    }

    #[test]
    fn deallocate_splits_both_edges() {
        crate::arch::hosted::init_kernel();
        let proc = ps::process_create("split-test").unwrap();
        let base = allocate(&proc.vm, None, 8 * PAGE_SIZE).unwrap();

        // Punch out the middle two pages.
        deallocate(&proc.vm, base + 3 * PAGE_SIZE, 2 * PAGE_SIZE).unwrap();

        let map = proc.vm.map.read();
        let left = map.vad_find(base).expect("left half survives");
        assert_eq!(left.end, base + 3 * PAGE_SIZE);
        let right = map
            .vad_find(base + 5 * PAGE_SIZE)
            .expect("right half survives");
        assert_eq!(right.start, base + 5 * PAGE_SIZE);
        assert_eq!(right.end, base + 8 * PAGE_SIZE);
        assert!(map.vad_find(base + 3 * PAGE_SIZE).is_none());
        assert!(map.vad_find(base + 4 * PAGE_SIZE).is_none());
    }

    #[test]
    fn deallocate_trims_last_page() {
        crate::arch::hosted::init_kernel();
        let proc = ps::process_create("trim-test").unwrap();
        let base = allocate(&proc.vm, None, 4 * PAGE_SIZE).unwrap();

        deallocate(&proc.vm, base + 3 * PAGE_SIZE, PAGE_SIZE).unwrap();
        let map = proc.vm.map.read();
        let vad = map.vad_find(base).unwrap();
        assert_eq!(vad.end, base + 3 * PAGE_SIZE);
    }
}

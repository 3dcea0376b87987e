// SPDX-License-Identifier: MPL-2.0

//! The page-table walker.
//!
//! Tables are a uniform multi-level tree (the arch backend fixes depth and
//! fan-out). Each table page counts its non-zero child PTEs and its
//! "noswap" children (valid, transition or busy, the ones that pin the
//! table in memory); a table whose non-zero count reaches zero is freed,
//! and the deletion propagates into its parent.
//!
//! [`wire_pte`] descends to the leaf PTE for an address, allocating or
//! reinstating intermediate tables as it goes, and pins every level's table
//! page against reclamation until the caller releases the wire state.

use smallvec::SmallVec;

use super::{
    page::{Page, PageUse},
    pfndb::{self, PfnDb},
    procstate::ProcState,
    pte::{Pte, PteKind, PteRef},
    Vaddr,
};
use crate::arch::current as md;

/// Why a wire attempt stopped short.
pub enum WireAbort {
    /// An intermediate table is being paged in; wait on the page and retry.
    Busy(&'static Page),
    /// No page for a new table.
    NoMemory,
}

/// A wired leaf PTE: the PTE's location plus pins on each table level.
pub struct PteWireState {
    pub pte: PteRef,
    pinned: SmallVec<[&'static Page; 4]>,
}

impl PteWireState {
    /// The table page holding the leaf PTE.
    pub fn leaf_table(&self) -> &'static Page {
        *self.pinned.last().unwrap()
    }

    /// Drops the pins in reverse order. A table whose deletion was deferred
    /// by a pin is freed when its last pin goes.
    pub fn release(self, db: &mut PfnDb) {
        for page in self.pinned.iter().rev().copied() {
            db.release_page(page);
        }
    }
}

/// Bookkeeping for a PTE that went from zero (or swap) to a state that
/// pins its table.
pub(crate) fn noswap_pte_created(table_page: &Page, is_new: bool) {
    if is_new {
        table_page.adjust_pte_counts(1, 1);
    } else {
        table_page.adjust_pte_counts(0, 1);
    }
}

/// Bookkeeping for a valid/transition/busy PTE that became a swap PTE.
pub(crate) fn pte_became_swap(table_page: &Page) {
    table_page.adjust_pte_counts(0, -1);
}

/// Bookkeeping for a PTE deleted outright. Frees the table (and recurses
/// upward) when its last non-zero PTE goes.
pub(crate) fn pte_deleted(db: &mut PfnDb, table_page: &'static Page, was_noswap: bool) {
    let (nonzero, _) = table_page.adjust_pte_counts(-1, if was_noswap { -1 } else { 0 });
    if nonzero != 0 {
        return;
    }

    let referent = table_page.referent_pte();
    if referent == 0 {
        // The root table stays with the process.
        return;
    }

    let parent_ref = PteRef::new(referent);
    debug_assert_eq!(parent_ref.read().kind(), PteKind::Valid);
    parent_ref.write(Pte::zero());

    db.delete_page(table_page);
    db.release_page(table_page);

    let parent_page = pfndb::page_by_paddr(parent_ref.table_paddr()).unwrap();
    pte_deleted(db, parent_page, true);
}

/// Descends to the leaf PTE for `vaddr`, pinning the table pages.
///
/// Missing intermediates are allocated and installed; transition
/// intermediates are reinstated in place. A busy intermediate aborts the
/// wire; the caller drops its locks, waits and retries.
pub fn wire_pte(
    db: &mut PfnDb,
    ps: &ProcState,
    vaddr: Vaddr,
) -> core::result::Result<PteWireState, WireAbort> {
    let indexes = md::addr_unpack(vaddr);
    let mut pinned: SmallVec<[&'static Page; 4]> = SmallVec::new();
    let mut table_paddr = ps.root_table();

    let release_pins = |db: &mut PfnDb, pinned: &SmallVec<[&'static Page; 4]>| {
        for page in pinned.iter().rev().copied() {
            db.release_page(page);
        }
    };

    for level in (2..=md::TABLE_LEVELS).rev() {
        let dir_page = pfndb::page_by_paddr(table_paddr).unwrap();
        db.retain_page(dir_page);
        pinned.push(dir_page);

        let pte_ref = PteRef::new(table_paddr + indexes[level - 1] * core::mem::size_of::<u64>());
        let pte = pte_ref.read();

        match pte.kind() {
            PteKind::Valid => {
                table_paddr = pte.hw_paddr();
            }
            PteKind::Zero => {
                let table =
                    match db.alloc_page(PageUse::pml_for_level(level - 1), false) {
                        Ok(table) => table,
                        Err(_) => {
                            release_pins(db, &pinned);
                            return Err(WireAbort::NoMemory);
                        }
                    };
                table.set_referent_pte(pte_ref.paddr());
                table.set_owner(ps as *const ProcState as u64);
                pte_ref.write(Pte::hw_table(table.pfn()));
                noswap_pte_created(dir_page, true);
                table_paddr = table.paddr();
            }
            PteKind::Trans => {
                // The table was on its way out; bring it straight back.
                let table = pfndb::page_by_pfn(pte.soft_pfn()).unwrap();
                db.retain_page(table);
                pte_ref.write(Pte::hw_table(table.pfn()));
                db.release_page(table);
                table_paddr = table.paddr();
            }
            PteKind::Busy => {
                let table = pfndb::page_by_pfn(pte.soft_pfn()).unwrap();
                release_pins(db, &pinned);
                return Err(WireAbort::Busy(table));
            }
            PteKind::Swap => {
                // Nothing writes table pages out (the modified-page writer
                // skips them), so a swapped table cannot be observed.
                panic!("page-table page met in swap state");
            }
            PteKind::Fork => panic!("fork PTE at table level {}", level),
        }
    }

    let leaf_table = pfndb::page_by_paddr(table_paddr).unwrap();
    db.retain_page(leaf_table);
    pinned.push(leaf_table);

    let pte = PteRef::new(table_paddr + indexes[0] * core::mem::size_of::<u64>());
    Ok(PteWireState { pte, pinned })
}

/// The leaf PTE for `vaddr` if every intermediate level is present.
///
/// The caller holds the working-set mutex or the PFN lock, which is what
/// keeps the walked tables alive.
pub fn fetch_pte(ps: &ProcState, vaddr: Vaddr) -> Option<PteRef> {
    probe_pte(ps, vaddr).ok()
}

/// Like [`fetch_pte`] but reports the level at which the walk stopped.
pub(crate) fn probe_pte(ps: &ProcState, vaddr: Vaddr) -> core::result::Result<PteRef, usize> {
    let indexes = md::addr_unpack(vaddr);
    let mut table_paddr = ps.root_table();

    for level in (2..=md::TABLE_LEVELS).rev() {
        let pte_ref = PteRef::new(table_paddr + indexes[level - 1] * core::mem::size_of::<u64>());
        let pte = pte_ref.read();
        if pte.kind() != PteKind::Valid {
            return Err(level);
        }
        table_paddr = pte.hw_paddr();
    }

    Ok(PteRef::new(
        table_paddr + indexes[0] * core::mem::size_of::<u64>(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ps;

    #[test]
    fn wire_builds_and_reclaims_tables() {
        crate::arch::hosted::init_kernel();
        let proc = ps::process_create("wire-test").unwrap();
        let ps = &proc.vm;
        let vaddr: Vaddr = 0x4000_2000;

        let mut db = pfndb::lock();
        let before = db.stat().nprocpgtable;
        let state = wire_pte(&mut db, ps, vaddr).ok().unwrap();
        assert_eq!(state.pte.read().kind(), PteKind::Zero);

        // All intermediate levels were built.
        let after = db.stat().nprocpgtable;
        assert_eq!(after - before, md::TABLE_LEVELS - 1);

        // Install a leaf, then tear it down: the whole chain unwinds.
        let page = db.alloc_page(PageUse::AnonPrivate, true).unwrap();
        page.set_referent_pte(state.pte.paddr());
        state.pte.write(Pte::hw(page.pfn(), true, true));
        noswap_pte_created(state.leaf_table(), true);

        let leaf_table = state.leaf_table();
        assert_eq!(leaf_table.nonzero_ptes(), 1);
        assert_eq!(leaf_table.noswap_ptes(), 1);

        state.pte.write(Pte::zero());
        let leaf_table_page = leaf_table;
        state.release(&mut db);
        pte_deleted(&mut db, leaf_table_page, true);
        db.delete_page(page);
        db.release_page(page);

        assert_eq!(db.stat().nprocpgtable, before);
    }

    #[test]
    fn fetch_misses_report_levels() {
        crate::arch::hosted::init_kernel();
        let proc = ps::process_create("fetch-test").unwrap();
        let miss = probe_pte(&proc.vm, 0x7000_0000).unwrap_err();
        assert_eq!(miss, md::TABLE_LEVELS);
    }
}

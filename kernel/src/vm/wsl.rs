// SPDX-License-Identifier: MPL-2.0

//! Working-set lists.
//!
//! Every resident valid PTE of a process has a working-set entry. Entries
//! sit in a contiguous slot vector carrying an intrusive LRU list, with a
//! vaddr index alongside for lookup; eviction takes the least recent
//! unlocked entry. The list itself is guarded by the owning process's
//! working-set mutex; transitions of the PTEs it describes additionally
//! take the PFN lock.

use hashbrown::HashMap;

use super::{
    balance,
    page::PageUse,
    pfndb::{self, PfnDb},
    procstate::ProcState,
    pte::{Pte, PteKind},
    wire, Vaddr,
};
use crate::prelude::*;

const NO_SLOT: u32 = u32::MAX;

#[derive(Debug, Clone, Copy)]
struct Wsle {
    vaddr: Vaddr,
    locked: bool,
    prev: u32,
    next: u32,
    used: bool,
}

pub struct WorkingSet {
    entries: Vec<Wsle>,
    free_head: u32,
    index: HashMap<Vaddr, u32>,
    lru_head: u32,
    lru_tail: u32,
    count: usize,
    locked_count: usize,
    max: usize,
}

impl WorkingSet {
    pub fn new(max: usize) -> WorkingSet {
        WorkingSet {
            entries: Vec::new(),
            free_head: NO_SLOT,
            index: HashMap::new(),
            lru_head: NO_SLOT,
            lru_tail: NO_SLOT,
            count: 0,
            locked_count: 0,
            max,
        }
    }

    pub fn count(&self) -> usize {
        self.count
    }

    pub fn locked_count(&self) -> usize {
        self.locked_count
    }

    pub fn contains(&self, vaddr: Vaddr) -> bool {
        self.index.contains_key(&vaddr)
    }

    fn take_slot(&mut self) -> u32 {
        if self.free_head != NO_SLOT {
            let slot = self.free_head;
            self.free_head = self.entries[slot as usize].next;
            slot
        } else {
            self.entries.push(Wsle {
                vaddr: 0,
                locked: false,
                prev: NO_SLOT,
                next: NO_SLOT,
                used: false,
            });
            (self.entries.len() - 1) as u32
        }
    }

    fn lru_push_tail(&mut self, slot: u32) {
        let tail = self.lru_tail;
        self.entries[slot as usize].prev = tail;
        self.entries[slot as usize].next = NO_SLOT;
        if tail != NO_SLOT {
            self.entries[tail as usize].next = slot;
        } else {
            self.lru_head = slot;
        }
        self.lru_tail = slot;
    }

    fn lru_unlink(&mut self, slot: u32) {
        let (prev, next) = {
            let e = &self.entries[slot as usize];
            (e.prev, e.next)
        };
        if prev != NO_SLOT {
            self.entries[prev as usize].next = next;
        } else {
            self.lru_head = next;
        }
        if next != NO_SLOT {
            self.entries[next as usize].prev = prev;
        } else {
            self.lru_tail = prev;
        }
    }

    fn drop_slot(&mut self, slot: u32) {
        self.entries[slot as usize].used = false;
        self.entries[slot as usize].next = self.free_head;
        self.free_head = slot;
    }

    /// Records a freshly made resident mapping.
    ///
    /// A full list grows while memory allows, otherwise it evicts its own
    /// least recent unlocked entry to make room.
    pub fn insert(&mut self, db: &mut PfnDb, ps: &ProcState, vaddr: Vaddr, locked: bool) {
        debug_assert!(!self.index.contains_key(&vaddr), "duplicate WSLE");

        if self.count >= self.max {
            if !balance::memory_low(db.stat()) {
                self.max += 64;
            } else if let Some(victim) = self.pop_lru_unlocked() {
                evict_mapping(db, ps, victim);
            }
        }

        let slot = self.take_slot();
        self.entries[slot as usize] = Wsle {
            vaddr,
            locked,
            prev: NO_SLOT,
            next: NO_SLOT,
            used: true,
        };
        self.lru_push_tail(slot);
        self.index.insert(vaddr, slot);
        self.count += 1;
        if locked {
            self.locked_count += 1;
        }
    }

    /// Forgets the entry for `vaddr`. The caller tears the PTE down.
    pub fn remove(&mut self, vaddr: Vaddr) -> bool {
        let Some(slot) = self.index.remove(&vaddr) else {
            return false;
        };
        if self.entries[slot as usize].locked {
            self.locked_count -= 1;
        }
        self.lru_unlink(slot);
        self.drop_slot(slot);
        self.count -= 1;
        true
    }

    /// Takes the least recent unlocked entry off the list.
    pub fn pop_lru_unlocked(&mut self) -> Option<Vaddr> {
        let mut slot = self.lru_head;
        while slot != NO_SLOT {
            let entry = self.entries[slot as usize];
            if !entry.locked {
                self.lru_unlink(slot);
                self.index.remove(&entry.vaddr);
                self.drop_slot(slot);
                self.count -= 1;
                return Some(entry.vaddr);
            }
            slot = entry.next;
        }
        None
    }

    /// Forgets every entry in `[start, end)`, returning the vaddrs removed.
    pub fn remove_range(&mut self, start: Vaddr, end: Vaddr) -> Vec<Vaddr> {
        let victims: Vec<Vaddr> = self
            .index
            .keys()
            .copied()
            .filter(|v| *v >= start && *v < end)
            .collect();
        for vaddr in &victims {
            self.remove(*vaddr);
        }
        victims
    }
}

/// Takes a resident mapping out of service while keeping its contents
/// reachable: file pages drop to their object's cache, private anonymous
/// pages become transition (or swap, when a clean drum copy exists) PTEs.
///
/// The working-set entry is the caller's business. Holds: ws mutex, PFN
/// lock.
pub(crate) fn evict_mapping(db: &mut PfnDb, ps: &ProcState, vaddr: Vaddr) -> bool {
    let Some(pte_ref) = wire::fetch_pte(ps, vaddr) else {
        return false;
    };
    let pte = pte_ref.read();
    if pte.kind() != PteKind::Valid {
        return false;
    }

    let page = pfndb::page_by_pfn(pte.hw_pfn()).unwrap();
    let leaf_table = pfndb::page_by_paddr(pte_ref.table_paddr()).unwrap();

    match page.use_() {
        PageUse::FileShared => {
            // Still cached in the object tree; the mapping just goes.
            pte_ref.write(Pte::zero());
            wire::pte_deleted(db, leaf_table, true);
            if page.referent_pte() == pte_ref.paddr() {
                page.set_referent_pte(0);
            }
            db.release_page(page);
        }
        PageUse::AnonPrivate => {
            if !page.dirty() && page.swap_descriptor() != 0 {
                // A clean drum copy exists: go straight to a swap PTE and
                // let the frame be reclaimed.
                pte_ref.write(Pte::swap(page.swap_descriptor()));
                wire::pte_became_swap(leaf_table);
                page.set_referent_pte(0);
                db.release_page(page);
                db.delete_page(page);
            } else {
                pte_ref.write(Pte::trans(page.pfn()));
                page.set_referent_pte(pte_ref.paddr());
                db.release_page(page);
            }
        }
        PageUse::AnonFork => {
            // The prototype keeps the page; the mapping collapses back to
            // a fork PTE.
            let fp_addr = page.owner() as usize;
            assert_ne!(fp_addr, 0);
            pte_ref.write(Pte::fork(fp_addr));
            leaf_table.adjust_pte_counts(0, -1);
            if page.referent_pte() == pte_ref.paddr() {
                page.set_referent_pte(0);
            }
            db.release_page(page);
        }
        use_ => panic!("evicting a {:?} page", use_),
    }

    crate::arch::platform().invlpg_local(vaddr);
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lru_discipline() {
        crate::arch::hosted::init_kernel();
        let proc = crate::ps::process_create("wsl-test").unwrap();
        let mut ws = WorkingSet::new(8);
        let mut db = pfndb::lock();

        ws.insert(&mut db, &proc.vm, 0x1000, false);
        ws.insert(&mut db, &proc.vm, 0x2000, true);
        ws.insert(&mut db, &proc.vm, 0x3000, false);
        assert_eq!(ws.count(), 3);
        assert_eq!(ws.locked_count(), 1);

        // Least recent unlocked first; locked entries are skipped.
        assert_eq!(ws.pop_lru_unlocked(), Some(0x1000));
        assert_eq!(ws.pop_lru_unlocked(), Some(0x3000));
        assert_eq!(ws.pop_lru_unlocked(), None);
        assert_eq!(ws.count(), 1);

        assert!(ws.remove(0x2000));
        assert!(!ws.remove(0x2000));
        assert_eq!(ws.count(), 0);
    }

    #[test]
    fn range_removal() {
        crate::arch::hosted::init_kernel();
        let proc = crate::ps::process_create("wsl-range").unwrap();
        let mut ws = WorkingSet::new(64);
        let mut db = pfndb::lock();
        for i in 0..8usize {
            ws.insert(&mut db, &proc.vm, 0x10000 + i * 0x1000, false);
        }
        let removed = ws.remove_range(0x12000, 0x15000);
        assert_eq!(removed.len(), 3);
        assert_eq!(ws.count(), 5);
    }
}

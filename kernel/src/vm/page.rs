// SPDX-License-Identifier: MPL-2.0

//! The page frame record.
//!
//! One fixed eight-word record per physical page, stored inside its region.
//! All mutation happens under the PFN lock; the fields are atomics so that
//! cross-CPU readers (reference counts, use tags) are defined. The linkage
//! words thread the page through exactly one of the buddy freelists, the
//! standby/modified queues, or a slab freelist header.

use core::sync::atomic::{AtomicU64, Ordering};

use static_assertions::const_assert_eq;

use super::{Paddr, Pfn};
use crate::config::PAGE_SHIFT;

/// What a physical page is being used for.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageUse {
    Free = 0,
    /// Tombstone: freed for real when the last reference drops.
    Deleted = 1,
    /// Kernel wired heap.
    KWired = 2,
    /// The PFN database's own pages.
    PfnDb = 3,
    AnonPrivate = 4,
    /// Anonymous page owned by a fork page.
    AnonFork = 5,
    FileShared = 6,
    /// Allocated as the target of a page-in.
    Transition = 7,
    Pml1 = 8,
    Pml2 = 9,
    Pml3 = 10,
    Pml4 = 11,
    VPml1 = 12,
    VPml2 = 13,
    VPml3 = 14,
    VPml4 = 15,
}

impl PageUse {
    pub fn from_raw(raw: u8) -> PageUse {
        match raw {
            0 => PageUse::Free,
            1 => PageUse::Deleted,
            2 => PageUse::KWired,
            3 => PageUse::PfnDb,
            4 => PageUse::AnonPrivate,
            5 => PageUse::AnonFork,
            6 => PageUse::FileShared,
            7 => PageUse::Transition,
            8 => PageUse::Pml1,
            9 => PageUse::Pml2,
            10 => PageUse::Pml3,
            11 => PageUse::Pml4,
            12 => PageUse::VPml1,
            13 => PageUse::VPml2,
            14 => PageUse::VPml3,
            15 => PageUse::VPml4,
            _ => panic!("bad page use {}", raw),
        }
    }

    pub fn is_pagetable(self) -> bool {
        matches!(
            self,
            PageUse::Pml1 | PageUse::Pml2 | PageUse::Pml3 | PageUse::Pml4
        )
    }

    pub fn is_pageable(self) -> bool {
        matches!(
            self,
            PageUse::AnonPrivate | PageUse::AnonFork | PageUse::FileShared
        )
    }

    /// The page-table use tag for a table at `level` (1-based).
    pub fn pml_for_level(level: usize) -> PageUse {
        match level {
            1 => PageUse::Pml1,
            2 => PageUse::Pml2,
            3 => PageUse::Pml3,
            4 => PageUse::Pml4,
            _ => panic!("bad table level {}", level),
        }
    }
}

/// No linkage / no page.
pub const NO_PFN: u64 = u64::MAX;

// state word layout
const USE_SHIFT: u32 = 0;
const ORDER_SHIFT: u32 = 8;
const DIRTY_BIT: u64 = 1 << 16;
const BUSY_BIT: u64 = 1 << 17;
const ON_FREELIST_BIT: u64 = 1 << 18;
const REFCNT_SHIFT: u32 = 32;

#[repr(C)]
pub struct Page {
    pfn: u64,
    /// use | order | dirty | busy | on-freelist | refcnt.
    state: AtomicU64,
    /// For page-table pages: nonzero PTEs (low 16) and noswap PTEs (next
    /// 16). For file pages: byte offset within the owning object.
    counts: AtomicU64,
    /// Physical address of the PTE referencing this page.
    referent_pte: AtomicU64,
    link_next: AtomicU64,
    link_prev: AtomicU64,
    /// Owning process, fork page, vnode, pager state, or slab cache.
    owner: AtomicU64,
    /// Swap descriptor, or slab freelist head and counts.
    aux: AtomicU64,
}

const_assert_eq!(core::mem::size_of::<Page>(), 64);

impl Page {
    /// Writes a fresh record for `pfn` in place.
    pub(crate) fn init_at(slot: *mut Page, pfn: Pfn) {
        let page = Page {
            pfn: pfn as u64,
            state: AtomicU64::new(0),
            counts: AtomicU64::new(0),
            referent_pte: AtomicU64::new(0),
            link_next: AtomicU64::new(NO_PFN),
            link_prev: AtomicU64::new(NO_PFN),
            owner: AtomicU64::new(0),
            aux: AtomicU64::new(0),
        };
        unsafe { slot.write(page) };
    }

    pub fn pfn(&self) -> Pfn {
        self.pfn as Pfn
    }

    pub fn paddr(&self) -> Paddr {
        (self.pfn as usize) << PAGE_SHIFT
    }

    pub fn use_(&self) -> PageUse {
        PageUse::from_raw(((self.state.load(Ordering::Acquire) >> USE_SHIFT) & 0xff) as u8)
    }

    pub(crate) fn set_use(&self, use_: PageUse) {
        self.update_state(0xff << USE_SHIFT, (use_ as u64) << USE_SHIFT);
    }

    pub fn order(&self) -> usize {
        ((self.state.load(Ordering::Acquire) >> ORDER_SHIFT) & 0xff) as usize
    }

    pub(crate) fn set_order(&self, order: usize) {
        self.update_state(0xff << ORDER_SHIFT, (order as u64) << ORDER_SHIFT);
    }

    pub fn dirty(&self) -> bool {
        self.state.load(Ordering::Acquire) & DIRTY_BIT != 0
    }

    pub(crate) fn set_dirty(&self, dirty: bool) {
        self.update_state(DIRTY_BIT, if dirty { DIRTY_BIT } else { 0 });
    }

    pub fn busy(&self) -> bool {
        self.state.load(Ordering::Acquire) & BUSY_BIT != 0
    }

    pub(crate) fn set_busy(&self, busy: bool) {
        self.update_state(BUSY_BIT, if busy { BUSY_BIT } else { 0 });
    }

    pub fn on_freelist(&self) -> bool {
        self.state.load(Ordering::Acquire) & ON_FREELIST_BIT != 0
    }

    pub(crate) fn set_on_freelist(&self, on: bool) {
        self.update_state(ON_FREELIST_BIT, if on { ON_FREELIST_BIT } else { 0 });
    }

    pub fn refcnt(&self) -> u32 {
        (self.state.load(Ordering::Acquire) >> REFCNT_SHIFT) as u32
    }

    /// Returns the new count.
    pub(crate) fn refcnt_inc(&self) -> u32 {
        let old = self.state.fetch_add(1 << REFCNT_SHIFT, Ordering::AcqRel);
        (old >> REFCNT_SHIFT) as u32 + 1
    }

    /// Returns the new count.
    pub(crate) fn refcnt_dec(&self) -> u32 {
        let old = self.state.fetch_sub(1 << REFCNT_SHIFT, Ordering::AcqRel);
        let old_count = (old >> REFCNT_SHIFT) as u32;
        assert!(old_count > 0, "page {:#x} over-released", self.pfn);
        old_count - 1
    }

    fn update_state(&self, mask: u64, value: u64) {
        let mut cur = self.state.load(Ordering::Relaxed);
        loop {
            let next = (cur & !mask) | value;
            match self
                .state
                .compare_exchange_weak(cur, next, Ordering::AcqRel, Ordering::Relaxed)
            {
                Ok(_) => return,
                Err(actual) => cur = actual,
            }
        }
    }

    pub fn nonzero_ptes(&self) -> u16 {
        (self.counts.load(Ordering::Acquire) & 0xffff) as u16
    }

    pub fn noswap_ptes(&self) -> u16 {
        ((self.counts.load(Ordering::Acquire) >> 16) & 0xffff) as u16
    }

    pub(crate) fn adjust_pte_counts(&self, nonzero: i32, noswap: i32) -> (u16, u16) {
        let cur = self.counts.load(Ordering::Acquire);
        let new_nonzero = ((cur & 0xffff) as i32 + nonzero) as u64;
        let new_noswap = (((cur >> 16) & 0xffff) as i32 + noswap) as u64;
        assert!(new_nonzero <= 0xffff && new_noswap <= 0xffff);
        self.counts
            .store(new_nonzero | (new_noswap << 16), Ordering::Release);
        (new_nonzero as u16, new_noswap as u16)
    }

    /// Byte offset within the owning object, for file pages.
    pub fn offset(&self) -> u64 {
        self.counts.load(Ordering::Acquire)
    }

    pub(crate) fn set_offset(&self, offset: u64) {
        self.counts.store(offset, Ordering::Release);
    }

    pub fn referent_pte(&self) -> Paddr {
        self.referent_pte.load(Ordering::Acquire) as Paddr
    }

    pub(crate) fn set_referent_pte(&self, paddr: Paddr) {
        self.referent_pte.store(paddr as u64, Ordering::Release);
    }

    pub(crate) fn link_next(&self) -> u64 {
        self.link_next.load(Ordering::Acquire)
    }

    pub(crate) fn set_link_next(&self, pfn: u64) {
        self.link_next.store(pfn, Ordering::Release);
    }

    pub(crate) fn link_prev(&self) -> u64 {
        self.link_prev.load(Ordering::Acquire)
    }

    pub(crate) fn set_link_prev(&self, pfn: u64) {
        self.link_prev.store(pfn, Ordering::Release);
    }

    pub(crate) fn owner(&self) -> u64 {
        self.owner.load(Ordering::Acquire)
    }

    pub(crate) fn set_owner(&self, owner: u64) {
        self.owner.store(owner, Ordering::Release);
    }

    /// Swap descriptor (drum slot), zero meaning none.
    pub fn swap_descriptor(&self) -> u64 {
        self.aux.load(Ordering::Acquire)
    }

    pub(crate) fn set_swap_descriptor(&self, slot: u64) {
        self.aux.store(slot, Ordering::Release);
    }

    /// The aux word doubles as the slab freelist header for slab pages.
    pub(crate) fn slab_word(&self) -> u64 {
        self.aux.load(Ordering::Acquire)
    }

    pub(crate) fn set_slab_word(&self, word: u64) {
        self.aux.store(word, Ordering::Release);
    }

    /// Resets the record for reuse from a buddy freelist.
    pub(crate) fn reset_for_alloc(&self, use_: PageUse) {
        let order = self.order();
        self.state.store(
            ((use_ as u64) << USE_SHIFT) | ((order as u64) << ORDER_SHIFT) | (1 << REFCNT_SHIFT),
            Ordering::Release,
        );
        self.counts.store(0, Ordering::Release);
        self.referent_pte.store(0, Ordering::Release);
        self.link_next.store(NO_PFN, Ordering::Release);
        self.link_prev.store(NO_PFN, Ordering::Release);
        self.owner.store(0, Ordering::Release);
        self.aux.store(0, Ordering::Release);
    }
}

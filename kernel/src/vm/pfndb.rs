// SPDX-License-Identifier: MPL-2.0

//! The PFN database and buddy allocator.
//!
//! Physical RAM arrives as regions; each region's page records live at the
//! front of the region itself. Free pages sit on order 0..=15 buddy
//! freelists. Pages whose reference count drops to zero but that still
//! cache useful contents go to the standby (clean) or modified (dirty)
//! queue. Every mutation happens under the one global PFN lock, acquired
//! through [`lock`], whose guard is also the capability passed through the
//! deeper VM layers.

use core::{
    cell::UnsafeCell,
    ops::{Deref, DerefMut},
    sync::atomic::Ordering as AtomicOrdering,
};

use crate::prelude::*;

use super::{
    balance,
    page::{Page, PageUse, NO_PFN},
    Paddr, Pfn,
};
use crate::{
    config::{BUDDY_ORDERS, PAGE_SHIFT, PAGE_SIZE},
    ke::{
        ipl::Ipl,
        spinlock::RawSpinlock,
    },
    util::AlignExt,
};

#[derive(Debug, Clone, Copy, Default)]
pub struct VmStat {
    pub ntotal: usize,
    pub nfree: usize,
    pub nreservedfree: usize,
    pub nactive: usize,
    pub nstandby: usize,
    pub nmodified: usize,
    pub ndeleted: usize,
    pub nanonprivate: usize,
    pub nanonfork: usize,
    pub nfileshared: usize,
    pub ntransition: usize,
    pub nkwired: usize,
    pub npwired: usize,
    pub nprocpgtable: usize,
    pub nprotopgtable: usize,
}

impl VmStat {
    const ZERO: VmStat = VmStat {
        ntotal: 0,
        nfree: 0,
        nreservedfree: 0,
        nactive: 0,
        nstandby: 0,
        nmodified: 0,
        ndeleted: 0,
        nanonprivate: 0,
        nanonfork: 0,
        nfileshared: 0,
        ntransition: 0,
        nkwired: 0,
        npwired: 0,
        nprocpgtable: 0,
        nprotopgtable: 0,
    };

    fn bucket(&mut self, use_: PageUse) -> Option<&mut usize> {
        match use_ {
            PageUse::Deleted => Some(&mut self.ndeleted),
            PageUse::AnonPrivate => Some(&mut self.nanonprivate),
            PageUse::AnonFork => Some(&mut self.nanonfork),
            PageUse::FileShared => Some(&mut self.nfileshared),
            PageUse::Transition => Some(&mut self.ntransition),
            PageUse::KWired => Some(&mut self.nkwired),
            PageUse::PfnDb => Some(&mut self.npwired),
            PageUse::Pml1 | PageUse::Pml2 | PageUse::Pml3 | PageUse::Pml4 => {
                Some(&mut self.nprocpgtable)
            }
            PageUse::VPml1 | PageUse::VPml2 | PageUse::VPml3 | PageUse::VPml4 => {
                Some(&mut self.nprotopgtable)
            }
            PageUse::Free => None,
        }
    }

    fn account_use(&mut self, use_: PageUse, delta: isize) {
        if let Some(bucket) = self.bucket(use_) {
            *bucket = (*bucket as isize + delta) as usize;
        }
    }
}

struct RegionDesc {
    base: Paddr,
    npages: usize,
    pages: *const Page,
}

unsafe impl Send for RegionDesc {}
unsafe impl Sync for RegionDesc {}

static REGIONS: spin::RwLock<Vec<RegionDesc>> = spin::RwLock::new(Vec::new());

/// A PFN-linked page queue (standby, modified).
pub(crate) struct PageQueue {
    head: u64,
    tail: u64,
    len: usize,
}

impl PageQueue {
    const fn new() -> PageQueue {
        PageQueue {
            head: NO_PFN,
            tail: NO_PFN,
            len: 0,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.len
    }

    fn push_tail(&mut self, page: &Page) {
        debug_assert_eq!(page.link_next(), NO_PFN);
        debug_assert_eq!(page.link_prev(), NO_PFN);
        page.set_link_prev(self.tail);
        page.set_link_next(NO_PFN);
        if self.tail != NO_PFN {
            page_by_pfn(self.tail as Pfn).unwrap().set_link_next(page.pfn() as u64);
        } else {
            self.head = page.pfn() as u64;
        }
        self.tail = page.pfn() as u64;
        self.len += 1;
    }

    fn remove(&mut self, page: &Page) {
        let prev = page.link_prev();
        let next = page.link_next();
        if prev != NO_PFN {
            page_by_pfn(prev as Pfn).unwrap().set_link_next(next);
        } else {
            self.head = next;
        }
        if next != NO_PFN {
            page_by_pfn(next as Pfn).unwrap().set_link_prev(prev);
        } else {
            self.tail = prev;
        }
        page.set_link_next(NO_PFN);
        page.set_link_prev(NO_PFN);
        self.len -= 1;
    }

    pub(crate) fn head(&self) -> Option<&'static Page> {
        if self.head == NO_PFN {
            None
        } else {
            page_by_pfn(self.head as Pfn)
        }
    }
}

pub struct PfnDb {
    buddy_heads: [u64; BUDDY_ORDERS],
    buddy_nblocks: [usize; BUDDY_ORDERS],
    pub(crate) standby: PageQueue,
    pub(crate) modified: PageQueue,
    stat: VmStat,
}

struct DbCell(UnsafeCell<PfnDb>);

unsafe impl Sync for DbCell {}

static PFN_LOCK: RawSpinlock = RawSpinlock::new();

static DB: DbCell = DbCell(UnsafeCell::new(PfnDb {
    buddy_heads: [NO_PFN; BUDDY_ORDERS],
    buddy_nblocks: [0; BUDDY_ORDERS],
    standby: PageQueue::new(),
    modified: PageQueue::new(),
    stat: VmStat::ZERO,
}));

/// Witness that the PFN lock is held; dereferences to the database.
pub struct PfnGuard {
    old_ipl: Ipl,
}

impl Deref for PfnGuard {
    type Target = PfnDb;

    fn deref(&self) -> &PfnDb {
        unsafe { &*DB.0.get() }
    }
}

impl DerefMut for PfnGuard {
    fn deref_mut(&mut self) -> &mut PfnDb {
        unsafe { &mut *DB.0.get() }
    }
}

impl Drop for PfnGuard {
    fn drop(&mut self) {
        PFN_LOCK.release(self.old_ipl);
    }
}

/// Acquires the PFN database lock.
pub fn lock() -> PfnGuard {
    let old_ipl = PFN_LOCK.acquire();
    PfnGuard { old_ipl }
}

pub(crate) fn lock_is_held() -> bool {
    PFN_LOCK.is_held()
}

/// A copy of the counters.
pub fn vmstat() -> VmStat {
    lock().stat
}

/// The page record for `pfn`, if any region covers it.
pub fn page_by_pfn(pfn: Pfn) -> Option<&'static Page> {
    let regions = REGIONS.read();
    for region in regions.iter() {
        let base_pfn = region.base >> PAGE_SHIFT;
        if pfn >= base_pfn && pfn < base_pfn + region.npages {
            return Some(unsafe { &*region.pages.add(pfn - base_pfn) });
        }
    }
    None
}

pub fn page_by_paddr(paddr: Paddr) -> Option<&'static Page> {
    page_by_pfn(paddr >> PAGE_SHIFT)
}

fn region_bounds_of(page: &Page) -> (Pfn, usize, *const Page) {
    let regions = REGIONS.read();
    for region in regions.iter() {
        let base_pfn = region.base >> PAGE_SHIFT;
        if page.pfn() >= base_pfn && page.pfn() < base_pfn + region.npages {
            return (base_pfn, region.npages, region.pages);
        }
    }
    panic!("page {:#x} outside every region", page.pfn());
}

/// Hands a contiguous range of RAM to the PFN database.
pub fn add_region(base: Paddr, length: usize) {
    assert!(base.is_aligned_to(PAGE_SIZE) && length.is_aligned_to(PAGE_SIZE));
    let npages = length / PAGE_SIZE;
    let base_pfn = base >> PAGE_SHIFT;

    // The region's own page records live at its front.
    let meta_bytes = (npages * core::mem::size_of::<Page>()).align_up(PAGE_SIZE);
    let meta_pages = meta_bytes / PAGE_SIZE;
    assert!(meta_pages < npages, "region too small for its records");

    let pages = super::paddr_ptr(base) as *mut Page;
    for i in 0..npages {
        Page::init_at(unsafe { pages.add(i) }, base_pfn + i);
    }

    REGIONS.write().push(RegionDesc {
        base,
        npages,
        pages,
    });

    let mut db = lock();

    for i in 0..meta_pages {
        let page = unsafe { &*pages.add(i) };
        page.set_use(PageUse::PfnDb);
        page.refcnt_inc();
        db.stat.npwired += 1;
    }

    // Carve the remainder into maximal naturally aligned buddy runs.
    let mut i = meta_pages;
    while i < npages {
        let pfn = base_pfn + i;
        let mut order = (pfn.trailing_zeros() as usize).min(BUDDY_ORDERS - 1);
        while i + (1 << order) > npages {
            order -= 1;
        }
        let page = unsafe { &*pages.add(i) };
        page.set_order(order);
        db.buddy_push_head(order, page);
        i += 1 << order;
    }

    db.stat.ntotal += npages;
    db.stat.nfree += npages - meta_pages;
    db.stat.nreservedfree += npages - meta_pages;

    log::info!(
        "pfndb: region {:#x}..{:#x} ({} pages, {} record pages)",
        base,
        base + length,
        npages,
        meta_pages
    );
}

impl PfnDb {
    fn buddy_push_head(&mut self, order: usize, page: &Page) {
        debug_assert_eq!(page.order(), order);
        page.set_use(PageUse::Free);
        page.set_link_prev(NO_PFN);
        page.set_link_next(self.buddy_heads[order]);
        if self.buddy_heads[order] != NO_PFN {
            page_by_pfn(self.buddy_heads[order] as Pfn)
                .unwrap()
                .set_link_prev(page.pfn() as u64);
        }
        self.buddy_heads[order] = page.pfn() as u64;
        self.buddy_nblocks[order] += 1;
        page.set_on_freelist(true);
    }

    fn buddy_remove(&mut self, order: usize, page: &Page) {
        debug_assert!(page.on_freelist());
        let prev = page.link_prev();
        let next = page.link_next();
        if prev != NO_PFN {
            page_by_pfn(prev as Pfn).unwrap().set_link_next(next);
        } else {
            self.buddy_heads[order] = next;
        }
        if next != NO_PFN {
            page_by_pfn(next as Pfn).unwrap().set_link_prev(prev);
        }
        page.set_link_next(NO_PFN);
        page.set_link_prev(NO_PFN);
        page.set_on_freelist(false);
        self.buddy_nblocks[order] -= 1;
    }

    fn buddy_pop_head(&mut self, order: usize) -> &'static Page {
        let page = page_by_pfn(self.buddy_heads[order] as Pfn).unwrap();
        self.buddy_remove(order, page);
        page
    }

    pub(crate) fn buddy_nblocks(&self, order: usize) -> usize {
        self.buddy_nblocks[order]
    }

    /// Allocates a naturally aligned run of 2^order pages.
    ///
    /// The run comes back zeroed (unless `zero` is false, for page tables
    /// about to be overwritten wholesale) with `refcnt` 1 and `use_` set.
    /// With `must`, exhaustion is fatal.
    pub fn alloc_pages(
        &mut self,
        order: usize,
        use_: PageUse,
        must: bool,
        zero: bool,
    ) -> Result<&'static Page> {
        assert!(order < BUDDY_ORDERS);
        let npages = 1usize << order;

        let mut from = order;
        while self.buddy_heads[from] == NO_PFN {
            from += 1;
            if from == BUDDY_ORDERS {
                if must {
                    panic!("out of physical pages");
                }
                return_error_with_message!(ErrorKind::OutOfMemory, "no free pages");
            }
        }

        // Split larger runs pairwise down to the requested order.
        while from > order {
            let page = self.buddy_pop_head(from);
            page.set_order(from - 1);
            let buddy = page_by_pfn(page.pfn() + (1 << (from - 1))).unwrap();
            buddy.set_order(from - 1);
            self.buddy_push_head(from - 1, buddy);
            self.buddy_push_head(from - 1, page);
            from -= 1;
        }

        let page = self.buddy_pop_head(order);
        page.reset_for_alloc(use_);

        self.stat.nfree -= npages;
        self.stat.nreservedfree -= npages;
        self.stat.nactive += npages;
        self.stat.account_use(use_, npages as isize);

        if zero {
            unsafe {
                core::ptr::write_bytes(super::paddr_ptr(page.paddr()), 0, npages * PAGE_SIZE)
            };
        }

        balance::update_events(&self.stat);
        Ok(page)
    }

    pub fn alloc_page(&mut self, use_: PageUse, must: bool) -> Result<&'static Page> {
        self.alloc_pages(0, use_, must, true)
    }

    /// Returns a deleted, unreferenced run to its buddy freelist,
    /// coalescing within the region.
    fn free_page(&mut self, page: &'static Page) {
        assert_eq!(page.use_(), PageUse::Deleted);
        assert_eq!(page.refcnt(), 0);
        let npages = 1usize << page.order();

        page.set_dirty(false);
        page.set_referent_pte(0);
        page.set_offset(0);
        page.set_owner(0);
        page.set_swap_descriptor(0);

        self.stat.nfree += npages;
        self.stat.nreservedfree += npages;
        self.stat.ndeleted -= npages;

        let (base_pfn, region_npages, region_pages) = region_bounds_of(page);
        let mut page = page;
        loop {
            let index = page.pfn() - base_pfn;
            let run = 1usize << page.order();

            let buddy_index = if index % (2 * run) == 0 {
                index + run
            } else {
                index - run
            };
            // Never coalesce past the region end.
            if buddy_index + run > region_npages {
                break;
            }
            let buddy = unsafe { &*region_pages.add(buddy_index) };
            if buddy.order() != page.order()
                || !buddy.on_freelist()
                || buddy.use_() != PageUse::Free
            {
                break;
            }

            self.buddy_remove(buddy.order(), buddy);
            let (low, _high) = if page.pfn() < buddy.pfn() {
                (page, buddy)
            } else {
                (buddy, page)
            };
            low.set_order(low.order() + 1);
            page = low;
        }

        page.set_use(PageUse::Free);
        self.buddy_push_head(page.order(), page);
        balance::update_events(&self.stat);
    }

    /// Takes a reference; an inactive page leaves the standby or modified
    /// queue.
    pub fn retain_page(&mut self, page: &'static Page) -> &'static Page {
        let npages = 1usize << page.order();
        if page.refcnt_inc() == 1 {
            assert_ne!(page.use_(), PageUse::Deleted);
            if page.use_().is_pageable() {
                if page.dirty() {
                    self.modified.remove(page);
                    self.stat.nmodified -= npages;
                } else {
                    self.standby.remove(page);
                    self.stat.nstandby -= npages;
                }
            }
            self.stat.nactive += npages;
        }
        page
    }

    /// Drops a reference; the last one parks pageable pages on the standby
    /// or modified queue and frees deleted ones.
    pub fn release_page(&mut self, page: &'static Page) {
        let npages = 1usize << page.order();
        if page.refcnt_dec() != 0 {
            return;
        }

        self.stat.nactive -= npages;

        match page.use_() {
            PageUse::Deleted => self.free_page(page),
            use_ if use_.is_pageable() => {
                if page.dirty() {
                    self.modified.push_tail(page);
                    self.stat.nmodified += npages;
                } else {
                    self.standby.push_tail(page);
                    self.stat.nstandby += npages;
                }
                balance::update_events(&self.stat);
            }
            // Wired, table, and transition pages are reclaimed through
            // their own teardown paths.
            _ => {}
        }
    }

    /// Marks a page for freeing; freed now if unreferenced, else when the
    /// last reference drops.
    pub fn delete_page(&mut self, page: &'static Page) {
        let use_ = page.use_();
        assert_ne!(use_, PageUse::Deleted);
        assert!(!page.busy());
        let npages = 1usize << page.order();

        self.stat.account_use(use_, -(npages as isize));
        self.stat.ndeleted += npages;
        page.set_use(PageUse::Deleted);

        if page.refcnt() == 0 {
            if use_.is_pageable() {
                if page.dirty() {
                    self.modified.remove(page);
                    self.stat.nmodified -= npages;
                } else {
                    self.standby.remove(page);
                    self.stat.nstandby -= npages;
                }
            }
            self.free_page(page);
        }
    }

    pub fn stat(&self) -> &VmStat {
        &self.stat
    }

    pub(crate) fn stat_mut(&mut self) -> &mut VmStat {
        &mut self.stat
    }
}

/// Allocates with the PFN lock taken here.
pub fn alloc_page(use_: PageUse, must: bool) -> Result<&'static Page> {
    lock().alloc_page(use_, must)
}

/// Takes a reference with the PFN lock taken here.
pub fn retain_page(page: &'static Page) -> &'static Page {
    lock().retain_page(page)
}

/// Drops a reference with the PFN lock taken here.
pub fn release_page(page: &'static Page) {
    lock().release_page(page);
}

/// One-line counter dump.
pub fn dump() {
    let stat = vmstat();
    log::info!(
        "pfndb: active {} modified {} standby {} free {} deleted {}",
        stat.nactive,
        stat.nmodified,
        stat.nstandby,
        stat.nfree,
        stat.ndeleted
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    fn init() {
        crate::arch::hosted::init_kernel();
    }

    #[test]
    fn alloc_zeroes_and_sets_fields() {
        init();
        let page = {
            let mut db = lock();
            db.alloc_page(PageUse::AnonPrivate, true).unwrap()
        };
        assert_eq!(page.use_(), PageUse::AnonPrivate);
        assert_eq!(page.refcnt(), 1);
        assert!(!page.on_freelist());
        let bytes = unsafe { super::super::page_bytes(page.paddr()) };
        assert!(bytes.iter().all(|b| *b == 0));

        let mut db = lock();
        db.delete_page(page);
        db.release_page(page);
    }

    #[test]
    fn buddy_split_and_coalesce_round_trip() {
        init();
        let page = {
            let mut db = lock();
            db.alloc_pages(3, PageUse::KWired, true, false).unwrap()
        };
        assert_eq!(page.order(), 3);
        assert!(page.pfn().trailing_zeros() >= 3);

        {
            let mut db = lock();
            db.delete_page(page);
        }
        // Freed straight back: the run must land on a freelist of its
        // order or coalesce higher.
        assert_eq!(page.use_(), PageUse::Free);
        assert!(page.on_freelist() || !page.on_freelist() && page.order() >= 3);
    }

    #[test]
    fn buddy_freelists_are_consistent() {
        init();
        let db = lock();
        for order in 0..BUDDY_ORDERS {
            let mut count = 0usize;
            let mut pfn = db.buddy_heads[order];
            let mut prev = NO_PFN;
            while pfn != NO_PFN {
                let page = page_by_pfn(pfn as Pfn).unwrap();
                assert_eq!(page.order(), order);
                assert!(page.on_freelist());
                assert_eq!(page.use_(), PageUse::Free);
                // Runs are naturally aligned.
                assert_eq!(pfn as usize % (1 << order), 0);
                assert_eq!(page.link_prev(), prev);
                count += 1;
                assert!(count <= db.buddy_nblocks[order], "freelist cycle");
                prev = pfn;
                pfn = page.link_next();
            }
            assert_eq!(count, db.buddy_nblocks[order]);
        }
    }

    #[test]
    fn release_parks_pageable_pages_on_standby() {
        init();
        let page = {
            let mut db = lock();
            db.alloc_page(PageUse::FileShared, true).unwrap()
        };
        {
            let mut db = lock();
            db.release_page(page);
        }
        assert_eq!(page.refcnt(), 0);
        assert!(!page.on_freelist());
        assert_eq!(page.use_(), PageUse::FileShared);

        // Retain pulls it back off the queue.
        {
            let mut db = lock();
            db.retain_page(page);
            assert_eq!(page.refcnt(), 1);
            db.delete_page(page);
            db.release_page(page);
        }
        assert_eq!(page.use_(), PageUse::Free);
    }

    #[test]
    fn dirty_release_goes_to_modified_queue() {
        init();
        let page = {
            let mut db = lock();
            db.alloc_page(PageUse::AnonPrivate, true).unwrap()
        };
        page.set_dirty(true);
        {
            let mut db = lock();
            db.release_page(page);
        }
        // Inactive but dirty: parked, linked, not freed.
        assert_eq!(page.refcnt(), 0);
        assert_eq!(page.use_(), PageUse::AnonPrivate);
        assert!(!page.on_freelist());

        let mut db = lock();
        db.retain_page(page);
        assert_eq!(page.refcnt(), 1);
        page.set_dirty(false);
        db.delete_page(page);
        db.release_page(page);
        assert_eq!(page.use_(), PageUse::Free);
    }
}

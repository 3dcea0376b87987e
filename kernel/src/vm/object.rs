// SPDX-License-Identifier: MPL-2.0

//! VM objects, vnodes, and the paging back ends.
//!
//! A file object wraps a vnode, whose cached pages live in a page tree
//! guarded by the PFN lock. Anonymous objects back shared anonymous
//! mappings the same way, zero-filling on demand. The pagers (a per-vnode
//! [`VnodePager`] and the global [`Pagefile`] of drum slots) are supplied
//! from outside this crate (file systems and the pagefile driver).

use core::{
    cell::UnsafeCell,
    sync::atomic::{AtomicU64, Ordering},
};

use spin::Once;

use crate::prelude::*;

use super::{
    page::Page,
    pfndb::{self, PfnDb},
    Pfn,
};
use crate::ke::{Event, Mutex};

/// Reads and writes a vnode's pages, page at a time.
pub trait VnodePager: Send + Sync {
    fn read_page(&self, offset_pages: u64, buf: &mut [u8]) -> Result<()>;
    fn write_page(&self, offset_pages: u64, buf: &[u8]) -> Result<()>;
}

/// The pagefile: integer drum slots of one page each.
pub trait Pagefile: Send + Sync {
    fn alloc_slot(&self) -> Result<u64>;
    fn free_slot(&self, slot: u64);
    fn read_slot(&self, slot: u64, buf: &mut [u8]) -> Result<()>;
    fn write_slot(&self, slot: u64, buf: &[u8]) -> Result<()>;
}

static PAGEFILE: Once<&'static dyn Pagefile> = Once::new();

pub fn set_pagefile(pagefile: &'static dyn Pagefile) {
    PAGEFILE.call_once(|| pagefile);
}

pub fn pagefile() -> &'static dyn Pagefile {
    *PAGEFILE.get().expect("no pagefile registered")
}

static NEXT_VNODE_ID: AtomicU64 = AtomicU64::new(1);

pub struct Vnode {
    id: u64,
    size: AtomicU64,
    /// Serialises size changes against cached I/O.
    pub rwlock: Mutex<()>,
    pager: Box<dyn VnodePager>,
    /// Page index -> frame of every cached page. Guarded by the PFN lock.
    pages: UnsafeCell<BTreeMap<u64, Pfn>>,
}

unsafe impl Send for Vnode {}
unsafe impl Sync for Vnode {}

impl Vnode {
    pub fn new(pager: Box<dyn VnodePager>, size: u64) -> Arc<Vnode> {
        Arc::new(Vnode {
            id: NEXT_VNODE_ID.fetch_add(1, Ordering::Relaxed),
            size: AtomicU64::new(size),
            rwlock: Mutex::new(()),
            pager,
            pages: UnsafeCell::new(BTreeMap::new()),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn size(&self) -> u64 {
        self.size.load(Ordering::Acquire)
    }

    pub fn set_size(&self, size: u64) {
        self.size.store(size, Ordering::Release);
    }

    pub fn pager(&self) -> &dyn VnodePager {
        &*self.pager
    }

    pub fn cached_page(&self, _db: &PfnDb, index: u64) -> Option<&'static Page> {
        let pages = unsafe { &*self.pages.get() };
        pages.get(&index).and_then(|pfn| pfndb::page_by_pfn(*pfn))
    }

    pub fn cache_page(&self, _db: &mut PfnDb, index: u64, page: &'static Page) {
        let pages = unsafe { &mut *self.pages.get() };
        page.set_offset(index * crate::config::PAGE_SIZE as u64);
        pages.insert(index, page.pfn());
    }

    pub fn uncache_page(&self, _db: &mut PfnDb, index: u64) {
        let pages = unsafe { &mut *self.pages.get() };
        pages.remove(&index);
    }

    pub fn cached_page_count(&self, _db: &PfnDb) -> usize {
        unsafe { &*self.pages.get() }.len()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmObjectKind {
    File,
    Anon,
}

/// A mappable memory object.
pub struct VmObject {
    kind: VmObjectKind,
    vnode: Option<Arc<Vnode>>,
    /// Shared anonymous pages, by page index. Guarded by the PFN lock.
    anon_pages: UnsafeCell<BTreeMap<u64, Pfn>>,
    /// Where this object is mapped, so truncation can chase mappings.
    /// Ordered after the map lock, before the working-set mutex.
    map_entries: Mutex<Vec<(usize, usize)>>,
}

unsafe impl Send for VmObject {}
unsafe impl Sync for VmObject {}

impl VmObject {
    pub fn new_file(vnode: Arc<Vnode>) -> Arc<VmObject> {
        Arc::new(VmObject {
            kind: VmObjectKind::File,
            vnode: Some(vnode),
            anon_pages: UnsafeCell::new(BTreeMap::new()),
            map_entries: Mutex::new(Vec::new()),
        })
    }

    pub fn new_anon() -> Arc<VmObject> {
        Arc::new(VmObject {
            kind: VmObjectKind::Anon,
            vnode: None,
            anon_pages: UnsafeCell::new(BTreeMap::new()),
            map_entries: Mutex::new(Vec::new()),
        })
    }

    pub(crate) fn map_entry_insert(&self, start: usize, end: usize) {
        self.map_entries.lock().push((start, end));
    }

    pub(crate) fn map_entry_remove(&self, start: usize, end: usize) {
        let mut entries = self.map_entries.lock();
        if let Some(pos) = entries.iter().position(|e| *e == (start, end)) {
            entries.remove(pos);
        }
    }

    pub(crate) fn map_entry_resize(
        &self,
        old_start: usize,
        old_end: usize,
        new_start: usize,
        new_end: usize,
    ) {
        let mut entries = self.map_entries.lock();
        if let Some(entry) = entries.iter_mut().find(|e| **e == (old_start, old_end)) {
            *entry = (new_start, new_end);
        }
    }

    pub fn kind(&self) -> VmObjectKind {
        self.kind
    }

    pub fn vnode(&self) -> Option<&Arc<Vnode>> {
        self.vnode.as_ref()
    }

    pub fn cached_page(&self, db: &PfnDb, index: u64) -> Option<&'static Page> {
        match self.kind {
            VmObjectKind::File => self.vnode.as_ref().unwrap().cached_page(db, index),
            VmObjectKind::Anon => {
                let pages = unsafe { &*self.anon_pages.get() };
                pages.get(&index).and_then(|pfn| pfndb::page_by_pfn(*pfn))
            }
        }
    }

    pub fn cache_page(&self, db: &mut PfnDb, index: u64, page: &'static Page) {
        match self.kind {
            VmObjectKind::File => self.vnode.as_ref().unwrap().cache_page(db, index, page),
            VmObjectKind::Anon => {
                let pages = unsafe { &mut *self.anon_pages.get() };
                page.set_offset(index * crate::config::PAGE_SIZE as u64);
                pages.insert(index, page.pfn());
            }
        }
    }
}

/// In-flight page-in or page-out; waiters sleep on the event and refault.
pub struct PagerState {
    pub event: Event,
}

impl PagerState {
    pub fn new() -> Arc<PagerState> {
        Arc::new(PagerState {
            event: Event::new(false),
        })
    }
}

/// Parks an Arc reference to `state` in the page's owner word.
///
/// Caller holds the PFN lock and the page is busy or in transition.
pub(crate) fn attach_pager_state(page: &Page, state: Arc<PagerState>) {
    page.set_owner(Arc::into_raw(state) as u64);
}

/// Clones the pager state out of a busy page's owner word.
pub(crate) fn peek_pager_state(page: &Page) -> Arc<PagerState> {
    let raw = page.owner() as *const PagerState;
    assert!(!raw.is_null(), "busy page without pager state");
    unsafe {
        Arc::increment_strong_count(raw);
        Arc::from_raw(raw)
    }
}

/// Detaches and returns the pager state parked on a page.
pub(crate) fn take_pager_state(page: &Page) -> Arc<PagerState> {
    let raw = page.owner() as *const PagerState;
    assert!(!raw.is_null(), "busy page without pager state");
    page.set_owner(0);
    unsafe { Arc::from_raw(raw) }
}

// SPDX-License-Identifier: MPL-2.0

//! Fork-on-write process memory duplication.
//!
//! Forking moves each private anonymous page of the parent under a
//! reference-counted fork page holding its prototype PTE; parent and child
//! then share it read-only until a write fault breaks the page back out.
//! Pages already fork-shared just gain a reference.

use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use crate::prelude::*;

use super::{
    object,
    page::{Page, PageUse},
    pfndb::{self, PfnDb},
    procstate::ProcState,
    pte::{Pte, PteKind, PteRef},
    wire, Vaddr,
};
use crate::{
    arch::{self, current as md},
    config::PAGE_SIZE,
    ps::Process,
    util::AlignExt,
};

/// A prototype PTE shared between processes after fork.
pub struct ForkPage {
    /// Hardware (resident) or swap encoding of the shared page.
    pub(crate) pte: AtomicU64,
    /// One count per PTE, valid or fork-encoded, that references this
    /// fork page.
    pub(crate) refcount: AtomicU32,
}

impl ForkPage {
    fn new() -> *mut ForkPage {
        Box::into_raw(Box::new(ForkPage {
            pte: AtomicU64::new(0),
            refcount: AtomicU32::new(0),
        }))
    }

    pub(crate) fn proto(&self) -> Pte {
        Pte(self.pte.load(Ordering::Acquire))
    }

    pub(crate) fn set_proto(&self, pte: Pte) {
        self.pte.store(pte.0, Ordering::Release);
    }

    pub(crate) fn refcount(&self) -> u32 {
        self.refcount.load(Ordering::Acquire)
    }
}

pub(crate) fn forkpage_at(addr: usize) -> &'static ForkPage {
    unsafe { &*(addr as *const ForkPage) }
}

/// Converts a fork-owned resident page back to plain private anonymous
/// ownership under the process whose PTE still references it.
fn revert_to_private(db: &mut PfnDb, page: &'static Page) {
    debug_assert_eq!(page.use_(), PageUse::AnonFork);
    let referent = page.referent_pte();
    if referent == 0 {
        // No resident mapping to hand it to; the next fault converts it.
        return;
    }

    let leaf_table = pfndb::page_by_paddr(PteRef::new(referent).table_paddr()).unwrap();
    let owner = leaf_table.owner() as *const ProcState;
    assert!(!owner.is_null());

    let npages = 1usize << page.order();
    db.stat_mut().nanonfork -= npages;
    db.stat_mut().nanonprivate += npages;
    page.set_use(PageUse::AnonPrivate);
    page.set_owner(owner as u64);
    unsafe { &*owner }.n_anonymous.fetch_add(1, Ordering::Relaxed);
}

/// Drops one reference on the fork page at `addr`.
///
/// The next-to-last reference reverts a still-mapped page to private
/// ownership; the last destroys the fork page and retires its page or
/// drum slot.
pub(crate) fn unref_forkpage_at(db: &mut PfnDb, addr: usize) {
    let fp = forkpage_at(addr);
    let remaining = fp.refcount.fetch_sub(1, Ordering::AcqRel) - 1;

    if remaining == 1 {
        let proto = fp.proto();
        if proto.is_valid() {
            let page = pfndb::page_by_pfn(proto.hw_pfn()).unwrap();
            if page.use_() == PageUse::AnonFork {
                revert_to_private(db, page);
            }
        }
        return;
    }

    if remaining == 0 {
        let proto = fp.proto();
        match proto.kind() {
            PteKind::Valid => {
                let page = pfndb::page_by_pfn(proto.hw_pfn()).unwrap();
                if page.use_() == PageUse::AnonFork {
                    page.set_owner(0);
                    db.delete_page(page);
                }
            }
            PteKind::Swap => object::pagefile().free_slot(proto.swap_slot()),
            _ => {}
        }
        drop(unsafe { Box::from_raw(addr as *mut ForkPage) });
    }
}

pub(crate) fn unref_forkpage_of_page(db: &mut PfnDb, page: &'static Page) {
    let addr = page.owner() as usize;
    assert_ne!(addr, 0, "fork page owner missing");
    unref_forkpage_at(db, addr);
}

struct ForkState {
    forkpages: Vec<*mut ForkPage>,
    next: usize,
}

impl ForkState {
    fn take(&mut self) -> &'static ForkPage {
        assert!(self.next < self.forkpages.len(), "fork pages underestimated");
        let fp = self.forkpages[self.next];
        self.next += 1;
        unsafe { &*fp }
    }
}

/// Moves one private page of the parent under a fresh fork page, leaving
/// the parent's PTE read-only (or fork-encoded for non-resident states).
fn convert_private_to_fork(
    db: &mut PfnDb,
    state: &mut ForkState,
    pte_ref: PteRef,
    pte: Pte,
) -> &'static ForkPage {
    let fp = state.take();
    let fp_addr = fp as *const ForkPage as usize;

    match pte.kind() {
        PteKind::Valid => {
            let page = pfndb::page_by_pfn(pte.hw_pfn()).unwrap();
            assert_eq!(page.use_(), PageUse::AnonPrivate);
            let npages = 1usize << page.order();
            db.stat_mut().nanonprivate -= npages;
            db.stat_mut().nanonfork += npages;
            page.set_use(PageUse::AnonFork);
            page.set_owner(fp_addr as u64);
            fp.set_proto(Pte::hw(page.pfn(), true, true));
            pte_ref.write(pte.as_readonly());
        }
        PteKind::Trans => {
            let page = pfndb::page_by_pfn(pte.soft_pfn()).unwrap();
            assert_eq!(page.use_(), PageUse::AnonPrivate);
            let npages = 1usize << page.order();
            db.stat_mut().nanonprivate -= npages;
            db.stat_mut().nanonfork += npages;
            page.set_use(PageUse::AnonFork);
            page.set_owner(fp_addr as u64);
            fp.set_proto(Pte::hw(page.pfn(), true, true));
            page.set_referent_pte(0);
            pte_ref.write(Pte::fork(fp_addr));
            // Transition pinned the table; a fork PTE does not.
            let leaf_table = pfndb::page_by_paddr(pte_ref.table_paddr()).unwrap();
            leaf_table.adjust_pte_counts(0, -1);
        }
        PteKind::Swap => {
            fp.set_proto(pte);
            pte_ref.write(Pte::fork(fp_addr));
        }
        kind => panic!("converting a {:?} PTE to fork", kind),
    }

    fp.refcount.store(2, Ordering::Release);
    fp
}

fn is_private(pte: Pte) -> bool {
    match pte.kind() {
        PteKind::Zero | PteKind::Fork => false,
        PteKind::Trans | PteKind::Swap => true,
        PteKind::Busy => panic!("fork met a busy PTE"),
        PteKind::Valid => {
            let page = pfndb::page_by_pfn(pte.hw_pfn()).unwrap();
            page.use_() == PageUse::AnonPrivate
        }
    }
}

fn is_fork(pte: Pte) -> bool {
    match pte.kind() {
        PteKind::Fork => true,
        PteKind::Valid => {
            let page = pfndb::page_by_pfn(pte.hw_pfn()).unwrap();
            page.use_() == PageUse::AnonFork
        }
        _ => false,
    }
}

/// Walks `[start, end)` of the parent, fork-sharing every private or
/// already-forked page into the child.
fn cow_pages(
    state: &mut ForkState,
    parent: &ProcState,
    child: &ProcState,
    start: Vaddr,
    end: Vaddr,
) {
    let mut vaddr = start;
    while vaddr < end {
        let fp: &'static ForkPage;
        {
            let _parent_ws = parent.ws.lock();
            let mut db = pfndb::lock();

            let pte_ref = match wire::probe_pte(parent, vaddr) {
                Ok(pte_ref) => pte_ref,
                Err(level) => {
                    let span = md::level_span(level);
                    vaddr = vaddr.align_down(span) + span;
                    continue;
                }
            };
            let pte = pte_ref.read();

            if is_private(pte) {
                fp = convert_private_to_fork(&mut db, state, pte_ref, pte);
            } else if is_fork(pte) {
                fp = match pte.kind() {
                    PteKind::Fork => forkpage_at(pte.fork_addr()),
                    _ => {
                        let page = pfndb::page_by_pfn(pte.hw_pfn()).unwrap();
                        forkpage_at(page.owner() as usize)
                    }
                };
                fp.refcount.fetch_add(1, Ordering::AcqRel);
            } else {
                vaddr += PAGE_SIZE;
                continue;
            }
        }

        // With the fork page in hand, plant the child's fork PTE.
        {
            let _child_ws = child.ws.lock();
            let mut db = pfndb::lock();
            let wired = match wire::wire_pte(&mut db, child, vaddr) {
                Ok(wired) => wired,
                Err(_) => panic!("wiring the child's tables failed"),
            };
            debug_assert_eq!(wired.pte.read().kind(), PteKind::Zero);
            wired.pte.write(Pte::fork(fp as *const ForkPage as usize));
            wired.leaf_table().adjust_pte_counts(1, 0);
            wired.release(&mut db);
        }

        vaddr += PAGE_SIZE;
    }
}

/// Duplicates the parent's address space into the child with fork-on-write
/// semantics.
pub fn fork(parent: &Arc<Process>, child: &Arc<Process>) -> Result<()> {
    // Freezing the parent's map also freezes creation of private pages.
    let parent_map = parent.vm.map.write();

    let n_anonymous = parent.vm.n_anonymous.load(Ordering::Acquire);
    let mut state = ForkState {
        forkpages: (0..n_anonymous).map(|_| ForkPage::new()).collect(),
        next: 0,
    };

    let vads: Vec<(Vaddr, Vaddr)> = parent_map
        .vads
        .values()
        .map(|vad| (vad.start, vad.end))
        .collect();

    for (start, end) in vads {
        let (object, offset_pages, protection, max_protection, inherit_shared, cow) = {
            let vad = parent_map.vad_find(start).unwrap();
            (
                vad.object.clone(),
                vad.offset_pages,
                vad.protection,
                vad.max_protection,
                vad.inherit_shared,
                vad.cow,
            )
        };

        let mapped = super::map::map_object_view(
            &child.vm,
            object.clone(),
            Some(start),
            end - start,
            offset_pages * PAGE_SIZE as u64,
            protection,
            max_protection,
            inherit_shared,
            cow,
        )?;
        assert_eq!(mapped, start);

        if cow || (!inherit_shared && object.is_none()) {
            cow_pages(&mut state, &parent.vm, &child.vm, start, end);
        }
    }

    // Preallocation can exceed what the walk met (unmapped privates are
    // never uncounted); surplus fork pages just go back.
    for fp in state.forkpages.drain(state.next..) {
        drop(unsafe { Box::from_raw(fp) });
    }

    parent.vm.n_anonymous.store(0, Ordering::Release);

    {
        let _db = pfndb::lock();
        arch::platform().tlb_flush_global();
    }

    drop(parent_map);
    Ok(())
}

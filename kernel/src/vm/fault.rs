// SPDX-License-Identifier: MPL-2.0

//! The page-fault handler.
//!
//! A fault finds the VAD, checks protection, wires the leaf PTE, and then
//! dispatches on the PTE's state: demand-zero or demand-read for zero PTEs,
//! write upgrades and copy-on-write breaks for valid ones, waits for busy
//! and in-flight transition PTEs, page-in for swap PTEs, and the fork-page
//! protocol for fork PTEs. I/O is never done under the locks: those arms
//! mark the page busy, drop everything, do the read, and either finish the
//! installation or ask the entry path to run the fault again.

use core::sync::atomic::Ordering;

use crate::prelude::*;

use super::{
    balance, fork,
    object::{self, PagerState, VmObjectKind},
    page::{Page, PageUse},
    pfndb::{self, PfnDb},
    procstate::ProcState,
    pte::{Pte, PteKind},
    wire::{self, WireAbort},
    Vaddr, VmProtection,
};
use crate::{
    arch,
    config::{PAGE_SHIFT, PAGE_SIZE},
    ke::{self, thread},
    ps::Process,
    util::AlignExt,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultStatus {
    Ok,
    /// Bad VAD or protection; fatal in the kernel, a signal for users.
    Failure,
    /// No pages; wait for availability and re-enter.
    PageShortage,
    /// State changed underfoot (or I/O finished elsewhere); re-enter.
    Retry,
}

fn wait_for_page(page: &'static Page) {
    let pager = {
        let _db = pfndb::lock();
        if !page.busy() {
            return;
        }
        object::peek_pager_state(page)
    };
    let _ = ke::wait_one(&pager.event, "page-in wait", false, ke::TIMEOUT_INFINITE);
}

/// One fault attempt against `process` at `vaddr`.
///
/// On success, `out` (if given) receives the materialised page with an
/// extra reference.
pub fn fault(
    process: &Arc<Process>,
    vaddr: Vaddr,
    write: bool,
    mut out: Option<&mut Option<&'static Page>>,
) -> FaultStatus {
    let ps = &process.vm;
    let vaddr = vaddr.align_down(PAGE_SIZE);
    let user = !ps.is_kernel();

    let map = ps.map.read();

    let Some(vad) = map.vad_find(vaddr) else {
        if !user && !thread::current().in_trap_recovery.load(Ordering::Acquire) {
            panic!("kernel fault on unmapped {:#x}", vaddr);
        }
        log::trace!("fault: no VAD at {:#x}", vaddr);
        return FaultStatus::Failure;
    };

    if write && !vad.protection.contains(VmProtection::WRITE) {
        if !user {
            panic!("kernel write fault on read-only {:#x}", vaddr);
        }
        return FaultStatus::Failure;
    }

    let object = vad.object.clone();
    let cow = vad.cow;
    let protection = vad.protection;
    let index = vad.offset_pages + ((vaddr - vad.start) >> PAGE_SHIFT) as u64;

    let mut ws = ps.ws.lock();
    let mut db = pfndb::lock();

    let wired = match wire::wire_pte(&mut db, ps, vaddr) {
        Ok(wired) => wired,
        Err(WireAbort::Busy(table)) => {
            drop(db);
            drop(ws);
            drop(map);
            wait_for_page(table);
            return FaultStatus::Retry;
        }
        Err(WireAbort::NoMemory) => return FaultStatus::PageShortage,
    };
    let pte_ref = wired.pte;
    let leaf_table = wired.leaf_table();
    let pte = pte_ref.read();

    let finish = |db: &mut PfnDb, page: &'static Page, out: &mut Option<&mut Option<&'static Page>>| {
        if let Some(out) = out.as_deref_mut() {
            db.retain_page(page);
            *out = Some(page);
        }
    };

    match pte.kind() {
        PteKind::Zero => {
            match object {
                None => {
                    // Demand zero.
                    let page = match db.alloc_page(PageUse::AnonPrivate, false) {
                        Ok(page) => page,
                        Err(_) => {
                            wired.release(&mut db);
                            return FaultStatus::PageShortage;
                        }
                    };
                    let writeable = write && protection.contains(VmProtection::WRITE);
                    page.set_owner(ps as *const ProcState as u64);
                    page.set_referent_pte(pte_ref.paddr());
                    if writeable {
                        page.set_dirty(true);
                    }
                    pte_ref.write(Pte::hw(page.pfn(), writeable, user));
                    wire::noswap_pte_created(leaf_table, true);
                    ps.n_anonymous.fetch_add(1, Ordering::Relaxed);
                    ws.insert(&mut db, ps, vaddr, false);
                    finish(&mut db, page, &mut out);
                    wired.release(&mut db);
                    FaultStatus::Ok
                }
                Some(object) => {
                    if let Some(page) = object.cached_page(&db, index) {
                        if page.busy() {
                            wired.release(&mut db);
                            drop(db);
                            drop(ws);
                            drop(map);
                            wait_for_page(page);
                            return FaultStatus::Retry;
                        }
                        if cow && write {
                            // Private copy straight away.
                            let anon = match db.alloc_page(PageUse::AnonPrivate, false) {
                                Ok(anon) => anon,
                                Err(_) => {
                                    wired.release(&mut db);
                                    return FaultStatus::PageShortage;
                                }
                            };
                            unsafe {
                                super::page_bytes(anon.paddr())
                                    .copy_from_slice(super::page_bytes(page.paddr()));
                            }
                            anon.set_owner(ps as *const ProcState as u64);
                            anon.set_referent_pte(pte_ref.paddr());
                            anon.set_dirty(true);
                            pte_ref.write(Pte::hw(anon.pfn(), true, user));
                            wire::noswap_pte_created(leaf_table, true);
                            ps.n_anonymous.fetch_add(1, Ordering::Relaxed);
                            ws.insert(&mut db, ps, vaddr, false);
                            finish(&mut db, anon, &mut out);
                        } else {
                            db.retain_page(page);
                            let writeable =
                                write && protection.contains(VmProtection::WRITE) && !cow;
                            if writeable {
                                page.set_dirty(true);
                            }
                            page.set_referent_pte(pte_ref.paddr());
                            pte_ref.write(Pte::hw(page.pfn(), writeable, user));
                            wire::noswap_pte_created(leaf_table, true);
                            ws.insert(&mut db, ps, vaddr, false);
                            finish(&mut db, page, &mut out);
                        }
                        wired.release(&mut db);
                        FaultStatus::Ok
                    } else if object.kind() == VmObjectKind::Anon {
                        // Shared anonymous: zero-fill into the object.
                        let page = match db.alloc_page(PageUse::FileShared, false) {
                            Ok(page) => page,
                            Err(_) => {
                                wired.release(&mut db);
                                return FaultStatus::PageShortage;
                            }
                        };
                        object.cache_page(&mut db, index, page);
                        let writeable = write && protection.contains(VmProtection::WRITE);
                        if writeable {
                            page.set_dirty(true);
                        }
                        page.set_referent_pte(pte_ref.paddr());
                        pte_ref.write(Pte::hw(page.pfn(), writeable, user));
                        wire::noswap_pte_created(leaf_table, true);
                        ws.insert(&mut db, ps, vaddr, false);
                        finish(&mut db, page, &mut out);
                        wired.release(&mut db);
                        FaultStatus::Ok
                    } else {
                        // Demand read from the file. The page goes busy in
                        // the object tree and behind a busy PTE; the owner
                        // word carries the pager state until the read is
                        // done.
                        let vnode = object.vnode().unwrap().clone();
                        let page = match db.alloc_page(PageUse::FileShared, false) {
                            Ok(page) => page,
                            Err(_) => {
                                wired.release(&mut db);
                                return FaultStatus::PageShortage;
                            }
                        };
                        vnode.cache_page(&mut db, index, page);
                        page.set_busy(true);
                        object::attach_pager_state(page, PagerState::new());
                        let pager = object::peek_pager_state(page);
                        pte_ref.write(Pte::busy(page.pfn()));
                        wire::noswap_pte_created(leaf_table, true);
                        db.retain_page(page);
                        wired.release(&mut db);
                        drop(db);
                        drop(ws);
                        drop(map);

                        let mut buf = alloc::vec![0u8; PAGE_SIZE];
                        let read = vnode.pager().read_page(index, &mut buf);

                        let mut ws = ps.ws.lock();
                        let mut db = pfndb::lock();
                        unsafe {
                            super::page_bytes(page.paddr()).copy_from_slice(&buf);
                        }
                        page.set_busy(false);
                        let _ = object::take_pager_state(page);
                        pager.event.signal();

                        if page.use_() == PageUse::Deleted {
                            // Unmapped while reading: both references go.
                            db.release_page(page);
                            db.release_page(page);
                            return FaultStatus::Retry;
                        }
                        if read.is_err() {
                            vnode.uncache_page(&mut db, index);
                            debug_assert_eq!(pte_ref.read().kind(), PteKind::Busy);
                            pte_ref.write(Pte::zero());
                            wire::pte_deleted(&mut db, leaf_table, true);
                            db.release_page(page);
                            db.delete_page(page);
                            db.release_page(page);
                            return FaultStatus::Failure;
                        }

                        page.set_owner(&*vnode as *const _ as u64);
                        let writeable = write && protection.contains(VmProtection::WRITE) && !cow;
                        if writeable {
                            page.set_dirty(true);
                        }
                        // The busy PTE is still ours: make it real.
                        debug_assert_eq!(pte_ref.read().kind(), PteKind::Busy);
                        pte_ref.write(Pte::hw(page.pfn(), writeable, user));
                        ws.insert(&mut db, ps, vaddr, false);
                        // The I/O reference becomes the mapping reference.
                        db.release_page(page);
                        finish(&mut db, page, &mut out);
                        FaultStatus::Ok
                    }
                }
            }
        }

        PteKind::Valid => {
            let page = pfndb::page_by_pfn(pte.hw_pfn()).unwrap();
            if write && !pte.hw_is_writeable() {
                match page.use_() {
                    PageUse::AnonFork => {
                        let fp = fork::forkpage_at(page.owner() as usize);
                        if fp.refcount() == 1 {
                            // Sole owner now: convert in place.
                            let fp_addr = page.owner() as usize;
                            let npages = 1usize << page.order();
                            db.stat_mut().nanonfork -= npages;
                            db.stat_mut().nanonprivate += npages;
                            page.set_use(PageUse::AnonPrivate);
                            page.set_owner(ps as *const ProcState as u64);
                            page.set_dirty(true);
                            pte_ref.write(Pte::hw(page.pfn(), true, user));
                            arch::platform().invlpg_local(vaddr);
                            ps.n_anonymous.fetch_add(1, Ordering::Relaxed);
                            drop(unsafe {
                                Box::from_raw(fp_addr as *mut fork::ForkPage)
                            });
                            finish(&mut db, page, &mut out);
                        } else {
                            // Others still share it: copy out.
                            let anon = match db.alloc_page(PageUse::AnonPrivate, false) {
                                Ok(anon) => anon,
                                Err(_) => {
                                    wired.release(&mut db);
                                    return FaultStatus::PageShortage;
                                }
                            };
                            unsafe {
                                super::page_bytes(anon.paddr())
                                    .copy_from_slice(super::page_bytes(page.paddr()));
                            }
                            anon.set_owner(ps as *const ProcState as u64);
                            anon.set_referent_pte(pte_ref.paddr());
                            anon.set_dirty(true);
                            pte_ref.write(Pte::hw(anon.pfn(), true, user));
                            arch::platform().invlpg_local(vaddr);
                            ps.n_anonymous.fetch_add(1, Ordering::Relaxed);
                            page.set_referent_pte(0);
                            db.release_page(page);
                            fork::unref_forkpage_of_page(&mut db, page);
                            finish(&mut db, anon, &mut out);
                        }
                    }
                    PageUse::FileShared if cow => {
                        let anon = match db.alloc_page(PageUse::AnonPrivate, false) {
                            Ok(anon) => anon,
                            Err(_) => {
                                wired.release(&mut db);
                                return FaultStatus::PageShortage;
                            }
                        };
                        unsafe {
                            super::page_bytes(anon.paddr())
                                .copy_from_slice(super::page_bytes(page.paddr()));
                        }
                        anon.set_owner(ps as *const ProcState as u64);
                        anon.set_referent_pte(pte_ref.paddr());
                        anon.set_dirty(true);
                        pte_ref.write(Pte::hw(anon.pfn(), true, user));
                        arch::platform().invlpg_local(vaddr);
                        ps.n_anonymous.fetch_add(1, Ordering::Relaxed);
                        db.release_page(page);
                        finish(&mut db, anon, &mut out);
                    }
                    PageUse::FileShared => {
                        // Shared file mapping: upgrade in place.
                        page.set_dirty(true);
                        pte_ref.write(Pte::hw(page.pfn(), true, user));
                        arch::platform().invlpg_local(vaddr);
                        finish(&mut db, page, &mut out);
                    }
                    PageUse::AnonPrivate => {
                        // First write to a page brought in read-only; any
                        // drum copy is stale from here.
                        page.set_dirty(true);
                        if page.swap_descriptor() != 0 {
                            object::pagefile().free_slot(page.swap_descriptor());
                            page.set_swap_descriptor(0);
                        }
                        pte_ref.write(Pte::hw(page.pfn(), true, user));
                        arch::platform().invlpg_local(vaddr);
                        finish(&mut db, page, &mut out);
                    }
                    _ => {
                        finish(&mut db, page, &mut out);
                    }
                }
            } else {
                // Raced with another CPU; nothing to do.
                finish(&mut db, page, &mut out);
            }
            wired.release(&mut db);
            FaultStatus::Ok
        }

        PteKind::Trans => {
            let page = pfndb::page_by_pfn(pte.soft_pfn()).unwrap();
            if page.busy() {
                wired.release(&mut db);
                drop(db);
                drop(ws);
                drop(map);
                wait_for_page(page);
                return FaultStatus::Retry;
            }
            // Soft fault: the page never left memory.
            db.retain_page(page);
            let writeable = write
                && protection.contains(VmProtection::WRITE)
                && !cow
                && page.use_() == PageUse::AnonPrivate;
            if writeable {
                page.set_dirty(true);
                if page.swap_descriptor() != 0 {
                    object::pagefile().free_slot(page.swap_descriptor());
                    page.set_swap_descriptor(0);
                }
            }
            page.set_referent_pte(pte_ref.paddr());
            pte_ref.write(Pte::hw(page.pfn(), writeable, user));
            // Transition already counted against noswap.
            ws.insert(&mut db, ps, vaddr, false);
            finish(&mut db, page, &mut out);
            wired.release(&mut db);
            FaultStatus::Ok
        }

        PteKind::Busy => {
            let page = pfndb::page_by_pfn(pte.soft_pfn()).unwrap();
            wired.release(&mut db);
            drop(db);
            drop(ws);
            drop(map);
            wait_for_page(page);
            FaultStatus::Retry
        }

        PteKind::Swap => {
            let slot = pte.swap_slot();
            let page = match db.alloc_page(PageUse::Transition, false) {
                Ok(page) => page,
                Err(_) => {
                    wired.release(&mut db);
                    return FaultStatus::PageShortage;
                }
            };
            page.set_busy(true);
            object::attach_pager_state(page, PagerState::new());
            let pager = object::peek_pager_state(page);
            pte_ref.write(Pte::trans(page.pfn()));
            wire::noswap_pte_created(leaf_table, false);
            wired.release(&mut db);
            drop(db);
            drop(ws);
            drop(map);

            let mut buf = alloc::vec![0u8; PAGE_SIZE];
            let read = object::pagefile().read_slot(slot, &mut buf);

            let mut ws = ps.ws.lock();
            let mut db = pfndb::lock();
            unsafe {
                super::page_bytes(page.paddr()).copy_from_slice(&buf);
            }
            page.set_busy(false);
            let _ = object::take_pager_state(page);
            pager.event.signal();

            if page.use_() == PageUse::Deleted {
                db.release_page(page);
                return FaultStatus::Retry;
            }
            if read.is_err() {
                debug_assert_eq!(pte_ref.read().kind(), PteKind::Trans);
                pte_ref.write(Pte::swap(slot));
                wire::pte_became_swap(leaf_table);
                db.delete_page(page);
                db.release_page(page);
                return FaultStatus::Failure;
            }

            let npages = 1usize << page.order();
            db.stat_mut().ntransition -= npages;
            db.stat_mut().nanonprivate += npages;
            page.set_use(PageUse::AnonPrivate);
            page.set_owner(ps as *const ProcState as u64);
            page.set_referent_pte(pte_ref.paddr());

            let writeable = write && protection.contains(VmProtection::WRITE) && !cow;
            if writeable {
                // The drum copy is stale the moment this page is written.
                object::pagefile().free_slot(slot);
                page.set_swap_descriptor(0);
                page.set_dirty(true);
            } else {
                page.set_swap_descriptor(slot);
            }
            debug_assert_eq!(pte_ref.read().kind(), PteKind::Trans);
            pte_ref.write(Pte::hw(page.pfn(), writeable, user));
            ws.insert(&mut db, ps, vaddr, false);
            finish(&mut db, page, &mut out);
            FaultStatus::Ok
        }

        PteKind::Fork => {
            let fp_addr = pte.fork_addr();
            let fp = fork::forkpage_at(fp_addr);
            let proto = fp.proto();

            match proto.kind() {
                PteKind::Valid => {
                    let page = pfndb::page_by_pfn(proto.hw_pfn()).unwrap();
                    if !write {
                        db.retain_page(page);
                        pte_ref.write(Pte::hw(page.pfn(), false, user));
                        wire::noswap_pte_created(leaf_table, false);
                        ws.insert(&mut db, ps, vaddr, false);
                        finish(&mut db, page, &mut out);
                    } else if fp.refcount() == 1 {
                        db.retain_page(page);
                        let npages = 1usize << page.order();
                        db.stat_mut().nanonfork -= npages;
                        db.stat_mut().nanonprivate += npages;
                        page.set_use(PageUse::AnonPrivate);
                        page.set_owner(ps as *const ProcState as u64);
                        page.set_referent_pte(pte_ref.paddr());
                        page.set_dirty(true);
                        pte_ref.write(Pte::hw(page.pfn(), true, user));
                        wire::noswap_pte_created(leaf_table, false);
                        ps.n_anonymous.fetch_add(1, Ordering::Relaxed);
                        ws.insert(&mut db, ps, vaddr, false);
                        drop(unsafe { Box::from_raw(fp_addr as *mut fork::ForkPage) });
                        finish(&mut db, page, &mut out);
                    } else {
                        let anon = match db.alloc_page(PageUse::AnonPrivate, false) {
                            Ok(anon) => anon,
                            Err(_) => {
                                wired.release(&mut db);
                                return FaultStatus::PageShortage;
                            }
                        };
                        unsafe {
                            super::page_bytes(anon.paddr())
                                .copy_from_slice(super::page_bytes(page.paddr()));
                        }
                        anon.set_owner(ps as *const ProcState as u64);
                        anon.set_referent_pte(pte_ref.paddr());
                        anon.set_dirty(true);
                        pte_ref.write(Pte::hw(anon.pfn(), true, user));
                        wire::noswap_pte_created(leaf_table, false);
                        ps.n_anonymous.fetch_add(1, Ordering::Relaxed);
                        ws.insert(&mut db, ps, vaddr, false);
                        fork::unref_forkpage_at(&mut db, fp_addr);
                        finish(&mut db, anon, &mut out);
                    }
                    wired.release(&mut db);
                    FaultStatus::Ok
                }

                PteKind::Trans => {
                    // Another sharer is paging it in.
                    let page = pfndb::page_by_pfn(proto.soft_pfn()).unwrap();
                    wired.release(&mut db);
                    drop(db);
                    drop(ws);
                    drop(map);
                    wait_for_page(page);
                    FaultStatus::Retry
                }

                PteKind::Swap => {
                    let slot = proto.swap_slot();
                    let page = match db.alloc_page(PageUse::Transition, false) {
                        Ok(page) => page,
                        Err(_) => {
                            wired.release(&mut db);
                            return FaultStatus::PageShortage;
                        }
                    };
                    page.set_busy(true);
                    object::attach_pager_state(page, PagerState::new());
                    let pager = object::peek_pager_state(page);
                    // Transition goes into the prototype and our own PTE.
                    fp.set_proto(Pte::trans(page.pfn()));
                    pte_ref.write(Pte::trans(page.pfn()));
                    wire::noswap_pte_created(leaf_table, false);
                    wired.release(&mut db);
                    drop(db);
                    drop(ws);
                    drop(map);

                    let mut buf = alloc::vec![0u8; PAGE_SIZE];
                    let read = object::pagefile().read_slot(slot, &mut buf);

                    let mut ws = ps.ws.lock();
                    let mut db = pfndb::lock();
                    unsafe {
                        super::page_bytes(page.paddr()).copy_from_slice(&buf);
                    }
                    page.set_busy(false);
                    let _ = object::take_pager_state(page);
                    pager.event.signal();

                    if read.is_err() {
                        fp.set_proto(Pte::swap(slot));
                        debug_assert_eq!(pte_ref.read().kind(), PteKind::Trans);
                        pte_ref.write(Pte::fork(fp_addr));
                        wire::pte_became_swap(leaf_table);
                        db.delete_page(page);
                        db.release_page(page);
                        return FaultStatus::Failure;
                    }

                    let npages = 1usize << page.order();
                    db.stat_mut().ntransition -= npages;
                    db.stat_mut().nanonfork += npages;
                    page.set_use(PageUse::AnonFork);
                    page.set_owner(fp_addr as u64);
                    page.set_referent_pte(pte_ref.paddr());
                    fp.set_proto(Pte::hw(page.pfn(), true, true));
                    object::pagefile().free_slot(slot);

                    debug_assert_eq!(pte_ref.read().kind(), PteKind::Trans);
                    pte_ref.write(Pte::hw(page.pfn(), false, user));
                    ws.insert(&mut db, ps, vaddr, false);
                    finish(&mut db, page, &mut out);
                    if write {
                        // Break the share on the next pass.
                        FaultStatus::Retry
                    } else {
                        FaultStatus::Ok
                    }
                }

                kind => panic!("fork prototype in state {:?}", kind),
            }
        }
    }
}

/// Entry point for user faults: retries transient outcomes, waits out page
/// shortages, and reports hard failures for signal delivery.
pub fn handle(process: &Arc<Process>, vaddr: Vaddr, write: bool) -> Result<()> {
    loop {
        match fault(process, vaddr, write, None) {
            FaultStatus::Ok => return Ok(()),
            FaultStatus::Retry => continue,
            FaultStatus::PageShortage => {
                balance::wait_for_pages();
                continue;
            }
            FaultStatus::Failure => {
                return_error_with_message!(ErrorKind::PermissionDenied, "unresolvable fault")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::{map, wsl};

    /// The full round trip of a private page: demand zero, eviction to a
    /// transition PTE, writeback to a drum slot, a soft fault off standby,
    /// eviction to a swap PTE with the frame reclaimed, and a hard fault
    /// back in.
    #[test]
    fn swap_out_and_back_in() {
        crate::arch::hosted::init_kernel();
        let proc = crate::ps::process_create("swap-test").unwrap();
        let base = map::allocate(&proc.vm, None, PAGE_SIZE).unwrap();

        let mut out = None;
        assert_eq!(fault(&proc, base, true, Some(&mut out)), FaultStatus::Ok);
        let page = out.unwrap();
        unsafe { super::super::page_bytes(page.paddr())[7] = 0x77 };
        pfndb::release_page(page);
        assert!(page.dirty());

        // Evict: the PTE goes to transition, the dirty frame to the
        // modified queue.
        {
            let mut ws = proc.vm.ws.lock();
            assert!(ws.remove(base));
            let mut db = pfndb::lock();
            assert!(wsl::evict_mapping(&mut db, &proc.vm, base));
        }
        assert_eq!(page.refcnt(), 0);
        {
            let _ws = proc.vm.ws.lock();
            let pte = wire::fetch_pte(&proc.vm, base).unwrap().read();
            assert_eq!(pte.kind(), PteKind::Trans);
            assert_eq!(pte.soft_pfn(), page.pfn());
        }

        // The modified-page writer gives it a drum slot and cleans it.
        let mut spins = 0;
        while page.dirty() || page.swap_descriptor() == 0 {
            if !balance::writeback_one() {
                std::thread::sleep(core::time::Duration::from_millis(1));
            }
            spins += 1;
            assert!(spins < 10_000, "writeback never reached the page");
        }

        // A read fault finds the frame still resident: a soft fault that
        // keeps the clean drum copy.
        let mut out = None;
        assert_eq!(fault(&proc, base, false, Some(&mut out)), FaultStatus::Ok);
        let soft = out.unwrap();
        assert_eq!(soft.pfn(), page.pfn());
        assert_ne!(page.swap_descriptor(), 0);
        pfndb::release_page(soft);

        // Evicting a clean page with a drum copy leaves a swap PTE and
        // frees the frame.
        {
            let mut ws = proc.vm.ws.lock();
            assert!(ws.remove(base));
            let mut db = pfndb::lock();
            assert!(wsl::evict_mapping(&mut db, &proc.vm, base));
        }
        {
            let _ws = proc.vm.ws.lock();
            let pte = wire::fetch_pte(&proc.vm, base).unwrap().read();
            assert_eq!(pte.kind(), PteKind::Swap);
        }

        // A hard fault pages the contents back in from the drum.
        let mut out = None;
        assert_eq!(fault(&proc, base, false, Some(&mut out)), FaultStatus::Ok);
        let back = out.unwrap();
        assert_eq!(unsafe { super::super::page_bytes(back.paddr())[7] }, 0x77);
        pfndb::release_page(back);

        map::deallocate(&proc.vm, base, PAGE_SIZE).unwrap();
    }

    #[test]
    fn busy_wait_path_retries() {
        crate::arch::hosted::init_kernel();
        let proc = crate::ps::process_create("busy-test").unwrap();
        let base = map::allocate(&proc.vm, None, PAGE_SIZE).unwrap();

        // Craft an in-flight page-in by hand, then complete it from
        // another thread while a fault waits on it.
        let (page, pager) = {
            let _ws = proc.vm.ws.lock();
            let mut db = pfndb::lock();
            let wired = wire::wire_pte(&mut db, &proc.vm, base).ok().unwrap();
            let page = db.alloc_page(PageUse::Transition, true).unwrap();
            page.set_busy(true);
            object::attach_pager_state(page, PagerState::new());
            let pager = object::peek_pager_state(page);
            wired.pte.write(Pte::busy(page.pfn()));
            wire::noswap_pte_created(wired.leaf_table(), true);
            wired.release(&mut db);
            (page, pager)
        };

        let completer_pager = pager.clone();
        let completer = std::thread::spawn(move || {
            std::thread::sleep(core::time::Duration::from_millis(20));
            completer_pager.event.signal();
        });

        // The faulting path waits for the signal and asks to be re-run.
        assert_eq!(fault(&proc, base, false, None), FaultStatus::Retry);
        completer.join().unwrap();

        // Undo the hand-made state.
        {
            let _ws = proc.vm.ws.lock();
            let mut db = pfndb::lock();
            let pte_ref = wire::fetch_pte(&proc.vm, base).unwrap();
            pte_ref.write(Pte::zero());
            let leaf = pfndb::page_by_paddr(pte_ref.table_paddr()).unwrap();
            wire::pte_deleted(&mut db, leaf, true);
            page.set_busy(false);
            let _ = object::take_pager_state(page);
            db.delete_page(page);
            db.release_page(page);
        }
        map::deallocate(&proc.vm, base, PAGE_SIZE).unwrap();
    }
}

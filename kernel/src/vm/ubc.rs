// SPDX-License-Identifier: MPL-2.0

//! The unified buffer cache.
//!
//! Cached file I/O goes through 256 KiB windows mapped in kernel address
//! space. Windows are found through a per-(vnode, offset) map under the UBC
//! spinlock; unreferenced windows sit on a global LRU, and taking a window
//! when none is free replaces the least recent one, evicting every valid
//! PTE the window holds before it is retargeted, so no content is lost.
//! The windows' page mappings live in the kernel working set like any
//! other resident mapping.

use hashbrown::HashMap;

use spin::Once;

use crate::prelude::*;

use super::{
    object::Vnode,
    page::PageUse,
    pfndb,
    pte::{Pte, PteKind},
    wire, wsl, Vaddr,
};
use crate::{
    config::{PAGE_SIZE, UBC_WINDOW_SIZE},
    ke::SpinLock,
};

const PAGES_PER_WINDOW: usize = UBC_WINDOW_SIZE / PAGE_SIZE;

struct Window {
    vnode: Option<Arc<Vnode>>,
    /// Offset in window-size units.
    unit: u32,
    refcnt: u32,
}

struct UbcState {
    windows: Vec<Window>,
    /// Unreferenced windows, least recent first.
    lru: VecDeque<usize>,
    free: Vec<usize>,
    map: HashMap<(u64, u32), usize>,
}

static UBC: Once<SpinLock<UbcState>> = Once::new();

pub(crate) fn init(window_count: usize) {
    UBC.call_once(|| {
        let windows = (0..window_count)
            .map(|_| Window {
                vnode: None,
                unit: 0,
                refcnt: 0,
            })
            .collect();
        SpinLock::new(UbcState {
            windows,
            lru: VecDeque::new(),
            free: (0..window_count).collect(),
            map: HashMap::new(),
        })
    });
    log::info!("ubc: {} windows", window_count);
}

fn ubc() -> &'static SpinLock<UbcState> {
    UBC.get().expect("UBC not bootstrapped")
}

fn window_addr(index: usize) -> Vaddr {
    super::KVM_UBC_BASE + index * UBC_WINDOW_SIZE
}

/// Unmaps everything a window holds, keeping the pages cached in their
/// vnode.
fn window_purge(index: usize) {
    let kproc = crate::ps::kernel_process();
    let kps = &kproc.vm;
    let base = window_addr(index);

    let mut ws = kps.ws.lock();
    let mut db = pfndb::lock();
    for i in 0..PAGES_PER_WINDOW {
        let vaddr = base + i * PAGE_SIZE;
        if let Some(pte_ref) = wire::fetch_pte(kps, vaddr) {
            if pte_ref.read().kind() == PteKind::Valid {
                ws.remove(vaddr);
                wsl::evict_mapping(&mut db, kps, vaddr);
            }
        }
    }
}

/// Finds or builds a window for (`vnode`, `unit`), referenced.
fn take_window(vnode: &Arc<Vnode>, unit: u32) -> usize {
    loop {
        let victim = {
            let mut state = ubc().lock();

            if let Some(index) = state.map.get(&(vnode.id(), unit)).copied() {
                if state.windows[index].refcnt == 0 {
                    let pos = state.lru.iter().position(|w| *w == index).unwrap();
                    state.lru.remove(pos);
                }
                state.windows[index].refcnt += 1;
                return index;
            }

            if let Some(index) = state.free.pop() {
                state.windows[index] = Window {
                    vnode: Some(vnode.clone()),
                    unit,
                    refcnt: 1,
                };
                state.map.insert((vnode.id(), unit), index);
                return index;
            }

            // Replace the least recently used window.
            let index = state.lru.pop_front().expect("all UBC windows pinned");
            let old = &mut state.windows[index];
            old.refcnt += 1;
            let old_key = (old.vnode.as_ref().unwrap().id(), old.unit);
            state.map.remove(&old_key);
            index
        };

        window_purge(victim);

        let mut state = ubc().lock();
        state.windows[victim].refcnt = 0;
        state.windows[victim].vnode = None;
        state.free.push(victim);
        // Raced window creation is possible now the lock was dropped;
        // retry the lookup.
    }
}

fn put_window(index: usize) {
    let mut state = ubc().lock();
    state.windows[index].refcnt -= 1;
    if state.windows[index].refcnt == 0 {
        state.lru.push_back(index);
    }
}

/// Makes one window page resident and returns its frame's physical
/// address.
fn window_page(vnode: &Arc<Vnode>, window: usize, page_in_window: usize, write: bool) -> Result<usize> {
    let kproc = crate::ps::kernel_process();
    let kps = &kproc.vm;
    let vaddr = window_addr(window) + page_in_window * PAGE_SIZE;
    let index = {
        let unit = ubc().lock().windows[window].unit;
        unit as u64 * (UBC_WINDOW_SIZE / PAGE_SIZE) as u64 + page_in_window as u64
    };

    // Fast path: already mapped.
    {
        let _ws = kps.ws.lock();
        if let Some(pte_ref) = wire::fetch_pte(kps, vaddr) {
            let pte = pte_ref.read();
            if pte.kind() == PteKind::Valid {
                let page = pfndb::page_by_pfn(pte.hw_pfn()).unwrap();
                if write {
                    page.set_dirty(true);
                }
                return Ok(page.paddr());
            }
        }
    }

    // Get the file page, reading it in if the cache lacks it.
    let cached = {
        let db = pfndb::lock();
        vnode.cached_page(&db, index)
    };
    let page = match cached {
        Some(page) => page,
        None => {
            let mut buf = alloc::vec![0u8; PAGE_SIZE];
            vnode.pager().read_page(index, &mut buf)?;

            let mut db = pfndb::lock();
            match vnode.cached_page(&db, index) {
                Some(page) => page,
                None => {
                    let page = db.alloc_page(PageUse::FileShared, false)?;
                    unsafe { super::page_bytes(page.paddr()).copy_from_slice(&buf) };
                    vnode.cache_page(&mut db, index, page);
                    page.set_owner(&**vnode as *const Vnode as u64);
                    // The cache itself holds no reference; drop the
                    // allocation's.
                    db.release_page(page);
                    page
                }
            }
        }
    };

    // Map it into the window.
    let mut ws = kps.ws.lock();
    let mut db = pfndb::lock();
    let wired = match wire::wire_pte(&mut db, kps, vaddr) {
        Ok(wired) => wired,
        Err(_) => return_error_with_message!(ErrorKind::OutOfMemory, "wiring a UBC window"),
    };
    let pte = wired.pte.read();
    if pte.kind() != PteKind::Valid {
        db.retain_page(page);
        page.set_referent_pte(wired.pte.paddr());
        wired.pte.write(Pte::hw(page.pfn(), true, false));
        wire::noswap_pte_created(wired.leaf_table(), true);
        ws.insert(&mut db, kps, vaddr, false);
    }
    if write {
        page.set_dirty(true);
    }
    wired.release(&mut db);
    Ok(page.paddr())
}

enum IoDir<'a> {
    Read(&'a mut [u8]),
    Write(&'a [u8]),
}

fn io(vnode: &Arc<Vnode>, offset: u64, dir: &mut IoDir<'_>) -> Result<usize> {
    // The vnode rwlock keeps the size stable across the transfer.
    let _size_guard = vnode.rwlock.lock();

    let total = match dir {
        IoDir::Read(buf) => {
            let size = vnode.size();
            if offset >= size {
                return Ok(0);
            }
            buf.len().min((size - offset) as usize)
        }
        IoDir::Write(buf) => buf.len(),
    };

    let mut done = 0usize;
    while done != total {
        let pos = offset as usize + done;
        let window_unit = (pos / UBC_WINDOW_SIZE) as u32;
        let window_off = pos % UBC_WINDOW_SIZE;
        let chunk = (UBC_WINDOW_SIZE - window_off).min(total - done);

        let window = take_window(vnode, window_unit);

        let mut chunk_done = 0usize;
        while chunk_done != chunk {
            let in_window = window_off + chunk_done;
            let page_index = in_window / PAGE_SIZE;
            let page_off = in_window % PAGE_SIZE;
            let run = (PAGE_SIZE - page_off).min(chunk - chunk_done);

            let write = matches!(dir, IoDir::Write(_));
            let paddr = match window_page(vnode, window, page_index, write) {
                Ok(paddr) => paddr,
                Err(e) => {
                    put_window(window);
                    return Err(e);
                }
            };

            let page_bytes = unsafe { super::page_bytes(paddr) };
            match dir {
                IoDir::Read(buf) => {
                    buf[done + chunk_done..done + chunk_done + run]
                        .copy_from_slice(&page_bytes[page_off..page_off + run]);
                }
                IoDir::Write(buf) => {
                    page_bytes[page_off..page_off + run]
                        .copy_from_slice(&buf[done + chunk_done..done + chunk_done + run]);
                }
            }
            chunk_done += run;
        }

        put_window(window);
        done += chunk;
    }

    if matches!(dir, IoDir::Write(_)) {
        let end = offset + done as u64;
        if end > vnode.size() {
            vnode.set_size(end);
        }
    }

    Ok(done)
}

/// Cached read from `vnode` at `offset`.
pub fn read(vnode: &Arc<Vnode>, offset: u64, buf: &mut [u8]) -> Result<usize> {
    io(vnode, offset, &mut IoDir::Read(buf))
}

/// Cached write to `vnode` at `offset`, extending the size as needed.
pub fn write(vnode: &Arc<Vnode>, offset: u64, buf: &[u8]) -> Result<usize> {
    io(vnode, offset, &mut IoDir::Write(buf))
}

// SPDX-License-Identifier: MPL-2.0

//! Memory balancing: low-memory events, the balance-set manager, and the
//! modified-page writer.
//!
//! The PFN database calls [`update_events`] as counters move; the two
//! daemons wake on their events (or a one-second heartbeat) and, while
//! pressure lasts, trim working sets round-robin and push modified pages
//! out to their backing store.

use core::sync::atomic::{AtomicU32, Ordering};

use spin::Once;

use crate::prelude::*;

use super::{
    object,
    page::PageUse,
    pfndb::{self, VmStat},
    procstate::ProcState,
};
use crate::{
    config::{NS_PER_S, PAGE_SIZE, WS_TRIM_BATCH},
    ke::{self, Event, SpinLock},
    ps::{self, Process},
};

struct Events {
    /// Set while pages are available; fault paths wait on it after a
    /// shortage.
    page_availability: Event,
    balance_set: Event,
    writer: Event,
}

static EVENTS: Once<Events> = Once::new();

fn events() -> &'static Events {
    EVENTS.call_once(|| Events {
        page_availability: Event::new(true),
        balance_set: Event::new(false),
        writer: Event::new(false),
    })
}

// Thresholds, in pages.

fn free_pages_low(stat: &VmStat) -> bool {
    stat.nfree < 64
}

fn avail_pages_very_low(stat: &VmStat) -> bool {
    stat.nfree + stat.nstandby < 96
}

fn avail_pages_low(stat: &VmStat) -> bool {
    stat.nfree + stat.nstandby < 168
}

fn avail_pages_fairly_low(stat: &VmStat) -> bool {
    stat.nfree + stat.nstandby < 384.max(stat.ntotal / 256)
}

fn writer_should_run(stat: &VmStat) -> bool {
    (stat.nmodified >= 16 && avail_pages_fairly_low(stat)) || stat.nmodified >= stat.ntotal / 128
}

pub(crate) fn memory_low(stat: &VmStat) -> bool {
    avail_pages_low(stat)
}

/// Signals the daemons appropriate to the current counters. Called under
/// the PFN lock.
pub(crate) fn update_events(stat: &VmStat) {
    let events = events();
    if avail_pages_low(stat) {
        events.balance_set.signal();
    }
    if writer_should_run(stat) {
        events.writer.signal();
    }
    if avail_pages_very_low(stat) {
        events.page_availability.clear();
    } else {
        events.page_availability.signal();
    }
    let _ = free_pages_low(stat);
}

/// Blocks until pages look available again (or a heartbeat passes).
pub fn wait_for_pages() {
    let _ = ke::wait_one(
        &events().page_availability,
        "page availability",
        false,
        NS_PER_S as i64,
    );
}

struct TrimQueue {
    processes: VecDeque<Weak<Process>>,
}

static TRIM_QUEUE: SpinLock<TrimQueue> = SpinLock::new(TrimQueue {
    processes: VecDeque::new(),
});

static TRIM_COUNTER: AtomicU32 = AtomicU32::new(0);

/// Puts a process in the balance set.
pub(crate) fn register_process(process: &Arc<Process>) {
    TRIM_QUEUE
        .lock()
        .processes
        .push_back(Arc::downgrade(process));
}

/// Evicts up to [`WS_TRIM_BATCH`] least-recent unlocked entries from one
/// working set.
fn trim_one(ps: &ProcState) -> usize {
    let mut trimmed = 0;
    let mut ws = ps.ws.lock();
    for _ in 0..WS_TRIM_BATCH {
        let Some(victim) = ws.pop_lru_unlocked() else {
            break;
        };
        let mut db = pfndb::lock();
        super::wsl::evict_mapping(&mut db, ps, victim);
        trimmed += 1;
    }
    trimmed
}

/// One round-robin sweep over the balance set.
fn trim_working_sets() -> usize {
    let counter = TRIM_COUNTER.fetch_add(1, Ordering::Relaxed) + 1;
    let mut trimmed = 0;

    loop {
        let process = {
            let mut queue = TRIM_QUEUE.lock();
            let Some(weak) = queue.processes.pop_front() else {
                break;
            };
            match weak.upgrade() {
                Some(process) => {
                    if process.vm.last_trim_counter.load(Ordering::Relaxed) == counter {
                        // Went all the way around.
                        queue.processes.push_front(weak);
                        break;
                    }
                    process.vm.last_trim_counter.store(counter, Ordering::Relaxed);
                    queue.processes.push_back(weak);
                    process
                }
                // The process went away; drop its slot.
                None => continue,
            }
        };

        trimmed += trim_one(&process.vm);

        if !memory_low(&pfndb::vmstat()) {
            break;
        }
    }

    trimmed
}

/// Pushes the head of the modified queue to its backing store. Returns
/// whether a page was written.
pub(crate) fn writeback_one() -> bool {
    // Claim the page and snapshot what we need, then do the I/O unlocked.
    let (page, target) = {
        let mut db = pfndb::lock();
        let Some(page) = db.modified.head() else {
            return false;
        };
        db.retain_page(page);

        let target = match page.use_() {
            PageUse::FileShared => {
                let vnode = page.owner() as *const object::Vnode;
                assert!(!vnode.is_null(), "file page without a vnode");
                WriteTarget::File {
                    vnode: unsafe { &*vnode },
                    index: page.offset() / PAGE_SIZE as u64,
                }
            }
            PageUse::AnonPrivate | PageUse::AnonFork => WriteTarget::Pagefile,
            _ => {
                // Not this daemon's to write (page tables stay resident).
                page.set_dirty(false);
                db.release_page(page);
                return true;
            }
        };
        (page, target)
    };

    let mut buf = alloc::vec![0u8; PAGE_SIZE];
    buf.copy_from_slice(unsafe { super::page_bytes(page.paddr()) });

    let outcome: Result<u64> = match target {
        WriteTarget::File { vnode, index } => {
            vnode.pager().write_page(index, &buf).map(|_| 0)
        }
        WriteTarget::Pagefile => {
            let pagefile = object::pagefile();
            pagefile
                .alloc_slot()
                .and_then(|slot| pagefile.write_slot(slot, &buf).map(|_| slot))
        }
    };

    let mut db = pfndb::lock();
    match outcome {
        Ok(slot) => {
            if slot != 0 {
                page.set_swap_descriptor(slot);
            }
            page.set_dirty(false);
        }
        Err(_) => {
            log::warn!("writeback: page {:#x} failed; leaving dirty", page.pfn());
        }
    }
    db.release_page(page);
    true
}

enum WriteTarget {
    File {
        vnode: &'static object::Vnode,
        index: u64,
    },
    Pagefile,
}

/// Starts the balance-set manager and the modified-page writer.
pub fn paging_init() {
    ps::create_kernel_thread("vm balance set manager", || loop {
        let _ = ke::wait_one(
            &events().balance_set,
            "balance set",
            false,
            NS_PER_S as i64,
        );
        events().balance_set.clear();
        if memory_low(&pfndb::vmstat()) {
            let trimmed = trim_working_sets();
            if trimmed > 0 {
                log::debug!("balance: trimmed {} pages", trimmed);
            }
        }
    });

    ps::create_kernel_thread("vm modified page writer", || loop {
        let _ = ke::wait_one(&events().writer, "modified writer", false, NS_PER_S as i64);
        events().writer.clear();
        while writeback_one() {
            if !writer_should_run(&pfndb::vmstat()) {
                break;
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn thresholds_follow_the_counters() {
        let mut stat = VmStat::default();
        stat.ntotal = 4096;
        stat.nfree = 1000;
        stat.nstandby = 0;
        assert!(!avail_pages_low(&stat));
        stat.nfree = 100;
        assert!(avail_pages_low(&stat));
        assert!(!avail_pages_very_low(&stat));
        stat.nfree = 10;
        assert!(avail_pages_very_low(&stat));

        stat.nmodified = 40;
        assert!(writer_should_run(&stat));
    }
}

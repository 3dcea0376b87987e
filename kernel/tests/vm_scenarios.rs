// SPDX-License-Identifier: MPL-2.0

//! Virtual-memory scenarios: demand paging, fork-on-write, page-table
//! reclamation, and buffer-cache coherence, against the hosted platform.

use std::sync::{Arc, Mutex as StdMutex, MutexGuard, OnceLock};
use std::time::Duration;

use noctis_kernel::arch::hosted;
use noctis_kernel::config::PAGE_SIZE;
use noctis_kernel::ps::{self, Process};
use noctis_kernel::vm::{
    fault::{self, FaultStatus},
    fork, map,
    object::{Vnode, VnodePager, VmObject},
    page::{Page, PageUse},
    pfndb, ubc,
    wire, Vaddr, VmProtection,
};
use noctis_kernel::Result;

/// The counter-sensitive scenarios share global state; run them one at a
/// time.
fn serial() -> MutexGuard<'static, ()> {
    static LOCK: OnceLock<StdMutex<()>> = OnceLock::new();
    let guard = LOCK
        .get_or_init(|| StdMutex::new(()))
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner());
    hosted::init_kernel();
    guard
}

fn touch(process: &Arc<Process>, vaddr: Vaddr, write: bool) -> &'static Page {
    let mut out = None;
    let status = fault::fault(process, vaddr, write, Some(&mut out));
    assert_eq!(status, FaultStatus::Ok, "fault at {:#x}", vaddr);
    let page = out.unwrap();
    // Drop the extra reference the fault handed us; the mapping keeps its
    // own.
    pfndb::release_page(page);
    page
}

fn byte_at(page: &Page, offset: usize) -> u8 {
    unsafe { *(noctis_kernel::vm::paddr_to_vaddr(page.paddr() + offset) as *const u8) }
}

fn write_byte(page: &Page, offset: usize, value: u8) {
    unsafe { *(noctis_kernel::vm::paddr_to_vaddr(page.paddr() + offset) as *mut u8) = value };
}

#[test]
fn demand_zero_and_translation() {
    let _serial = serial();
    let proc = ps::process_create("demand-zero").unwrap();
    let base = map::allocate(&proc.vm, None, 2 * PAGE_SIZE).unwrap();

    let page = touch(&proc, base, true);
    assert_eq!(page.use_(), PageUse::AnonPrivate);
    assert_eq!(byte_at(page, 0), 0);
    write_byte(page, 5, 0x5a);

    // The leaf PTE agrees with the page, and the WSLE exists.
    {
        let _ws = proc.vm.ws.lock();
        let pte_ref = wire::fetch_pte(&proc.vm, base).unwrap();
        let pte = pte_ref.read();
        assert!(pte.is_valid());
        assert_eq!(pte.hw_pfn(), page.pfn());
        assert_eq!(page.referent_pte(), pte_ref.paddr());
    }
    assert!(proc.vm.ws.lock().contains(base));

    // Refaulting the same address is benign.
    let again = touch(&proc, base, false);
    assert_eq!(again.pfn(), page.pfn());
    assert_eq!(byte_at(again, 5), 0x5a);

    map::deallocate(&proc.vm, base, 2 * PAGE_SIZE).unwrap();
}

#[test]
fn fault_outside_any_vad_fails() {
    let _serial = serial();
    let proc = ps::process_create("no-vad").unwrap();
    let status = fault::fault(&proc, 0x5000_0000, false, None);
    assert_eq!(status, FaultStatus::Failure);
}

#[test]
fn write_fault_on_readonly_vad_fails() {
    let _serial = serial();
    let proc = ps::process_create("ro-vad").unwrap();
    let base = map::map_object_view(
        &proc.vm,
        None,
        None,
        PAGE_SIZE,
        0,
        VmProtection::READ,
        VmProtection::all(),
        false,
        false,
    )
    .unwrap();
    assert_eq!(fault::fault(&proc, base, true, None), FaultStatus::Failure);
    assert_eq!(fault::fault(&proc, base, false, None), FaultStatus::Ok);
}

#[test]
fn cow_fork() {
    let _serial = serial();
    let parent = ps::process_create("fork-parent").unwrap();
    let base = map::allocate(&parent.vm, None, 3 * PAGE_SIZE).unwrap();

    // Parent writes {0xAA, 0xBB, 0xCC}.
    for (i, value) in [0xaau8, 0xbb, 0xcc].into_iter().enumerate() {
        let page = touch(&parent, base + i * PAGE_SIZE, true);
        write_byte(page, 0, value);
    }

    let child = ps::process_create("fork-child").unwrap();
    fork::fork(&parent, &child).unwrap();

    // Parent breaks P0 out with a write.
    let parent_p0 = touch(&parent, base, true);
    write_byte(parent_p0, 0, 0x11);
    assert_eq!(parent_p0.use_(), PageUse::AnonPrivate);

    // The child still sees the originals.
    let child_p0 = touch(&child, base, false);
    assert_eq!(byte_at(child_p0, 0), 0xaa);
    assert_ne!(child_p0.pfn(), parent_p0.pfn());

    let child_p1 = touch(&child, base + PAGE_SIZE, false);
    assert_eq!(byte_at(child_p1, 0), 0xbb);
    // P1 remains fork-shared between the two.
    assert_eq!(child_p1.use_(), PageUse::AnonFork);
    let parent_p1 = touch(&parent, base + PAGE_SIZE, false);
    assert_eq!(parent_p1.pfn(), child_p1.pfn());

    // Child exits: its address space goes away.
    map::deallocate(&child.vm, base, 3 * PAGE_SIZE).unwrap();

    // Parent-only pages revert to private anonymous use.
    let parent_p1_after = touch(&parent, base + PAGE_SIZE, false);
    assert_eq!(parent_p1_after.use_(), PageUse::AnonPrivate);
    assert_eq!(byte_at(parent_p1_after, 0), 0xbb);

    // And the parent can write them again without interference.
    let parent_p2 = touch(&parent, base + 2 * PAGE_SIZE, true);
    assert_eq!(byte_at(parent_p2, 0), 0xcc);

    map::deallocate(&parent.vm, base, 3 * PAGE_SIZE).unwrap();
}

#[test]
fn pagetable_reclamation() {
    let _serial = serial();
    let proc = ps::process_create("table-reclaim").unwrap();

    let baseline = pfndb::vmstat().nprocpgtable;

    // Reserve a megabyte, touch one page, then drop the whole mapping.
    let base = map::allocate(&proc.vm, None, 1024 * 1024).unwrap();
    touch(&proc, base + 512 * 1024, true);

    assert!(pfndb::vmstat().nprocpgtable > baseline);

    map::deallocate(&proc.vm, base, 1024 * 1024).unwrap();

    // Every table the touch built has gone back to the buddy allocator.
    assert_eq!(pfndb::vmstat().nprocpgtable, baseline);
}

/// A pager over a heap buffer; reads beyond the backing vector zero-fill.
struct VecPager {
    data: StdMutex<Vec<u8>>,
}

impl VecPager {
    fn new(initial: Vec<u8>) -> VecPager {
        VecPager {
            data: StdMutex::new(initial),
        }
    }
}

impl VnodePager for VecPager {
    fn read_page(&self, offset_pages: u64, buf: &mut [u8]) -> Result<()> {
        let data = self.data.lock().unwrap();
        let start = offset_pages as usize * PAGE_SIZE;
        buf.fill(0);
        if start < data.len() {
            let run = buf.len().min(data.len() - start);
            buf[..run].copy_from_slice(&data[start..start + run]);
        }
        Ok(())
    }

    fn write_page(&self, offset_pages: u64, buf: &[u8]) -> Result<()> {
        let mut data = self.data.lock().unwrap();
        let start = offset_pages as usize * PAGE_SIZE;
        if data.len() < start + buf.len() {
            data.resize(start + buf.len(), 0);
        }
        data[start..start + buf.len()].copy_from_slice(buf);
        Ok(())
    }
}

#[test]
fn file_mapping_demand_read_and_cow() {
    let _serial = serial();

    let mut contents = vec![0u8; 2 * PAGE_SIZE];
    contents[0] = 0x10;
    contents[PAGE_SIZE] = 0x20;
    contents[2 * PAGE_SIZE - 1] = 0x2f;
    let vnode = Vnode::new(Box::new(VecPager::new(contents)), 2 * PAGE_SIZE as u64);
    let object = VmObject::new_file(vnode);

    let proc = ps::process_create("file-map").unwrap();
    let base = map::map_object_view(
        &proc.vm,
        Some(object.clone()),
        None,
        2 * PAGE_SIZE,
        0,
        VmProtection::READ | VmProtection::WRITE,
        VmProtection::all(),
        false,
        true, // private: fork-on-write from the file
    )
    .unwrap();

    // Read faults bring file contents in shared and read-only.
    let p0 = touch(&proc, base, false);
    assert_eq!(p0.use_(), PageUse::FileShared);
    assert_eq!(byte_at(p0, 0), 0x10);

    // The very last byte of the mapping is reachable.
    let p1 = touch(&proc, base + 2 * PAGE_SIZE - 1, false);
    assert_eq!(byte_at(p1, PAGE_SIZE - 1), 0x2f);

    // A write fault copies privately; the cache page stays clean.
    let private = touch(&proc, base, true);
    assert_eq!(private.use_(), PageUse::AnonPrivate);
    assert_eq!(byte_at(private, 0), 0x10);
    write_byte(private, 0, 0x99);
    assert_eq!(byte_at(p0, 0), 0x10);

    map::deallocate(&proc.vm, base, 2 * PAGE_SIZE).unwrap();
}

#[test]
fn shared_anonymous_object_is_shared_between_processes() {
    let _serial = serial();
    let object = VmObject::new_anon();

    let a = ps::process_create("anon-a").unwrap();
    let b = ps::process_create("anon-b").unwrap();
    let prot = VmProtection::READ | VmProtection::WRITE;

    let base_a = map::map_object_view(
        &a.vm,
        Some(object.clone()),
        None,
        PAGE_SIZE,
        0,
        prot,
        VmProtection::all(),
        true,
        false,
    )
    .unwrap();
    let base_b = map::map_object_view(
        &b.vm,
        Some(object.clone()),
        None,
        PAGE_SIZE,
        0,
        prot,
        VmProtection::all(),
        true,
        false,
    )
    .unwrap();

    let page_a = touch(&a, base_a, true);
    write_byte(page_a, 9, 0x77);
    let page_b = touch(&b, base_b, false);
    assert_eq!(page_a.pfn(), page_b.pfn());
    assert_eq!(byte_at(page_b, 9), 0x77);

    map::deallocate(&a.vm, base_a, PAGE_SIZE).unwrap();
    map::deallocate(&b.vm, base_b, PAGE_SIZE).unwrap();
}

#[test]
fn ubc_io_round_trips_and_survives_window_replacement() {
    let _serial = serial();

    let vnode = Vnode::new(Box::new(VecPager::new(Vec::new())), 0);
    const WINDOW: usize = 256 * 1024;

    // Two writers append 4 KiB chunks at alternating offsets, spread over
    // more windows than the cache has, forcing replacement along the way.
    let units = 36usize;
    let writer = |vnode: Arc<Vnode>, parity: usize| {
        std::thread::spawn(move || {
            for unit in 0..units {
                for chunk in 0..2usize {
                    let index = unit * 4 + chunk * 2 + parity;
                    let offset = (index * PAGE_SIZE) as u64 + (unit as u64 * WINDOW as u64);
                    let buf = vec![(index % 251) as u8 + 1; PAGE_SIZE];
                    ubc::write(&vnode, offset, &buf).unwrap();
                }
            }
        })
    };

    let t0 = writer(vnode.clone(), 0);
    let t1 = writer(vnode.clone(), 1);
    t0.join().unwrap();
    t1.join().unwrap();

    // Everything written is readable back, bit for bit.
    for unit in 0..units {
        for index in (unit * 4)..(unit * 4 + 4) {
            let offset = (index * PAGE_SIZE) as u64 + (unit as u64 * WINDOW as u64);
            let mut buf = vec![0u8; PAGE_SIZE];
            let read = ubc::read(&vnode, offset, &mut buf).unwrap();
            assert_eq!(read, PAGE_SIZE);
            assert!(
                buf.iter().all(|b| *b == (index % 251) as u8 + 1),
                "unit {} chunk {} corrupted",
                unit,
                index
            );
        }
    }
}

#[test]
fn ubc_read_stops_at_end_of_file() {
    let _serial = serial();
    let vnode = Vnode::new(Box::new(VecPager::new(Vec::new())), 0);

    ubc::write(&vnode, 0, &[1, 2, 3, 4]).unwrap();
    assert_eq!(vnode.size(), 4);

    let mut buf = [0u8; 16];
    assert_eq!(ubc::read(&vnode, 0, &mut buf).unwrap(), 4);
    assert_eq!(&buf[..4], &[1, 2, 3, 4]);
    assert_eq!(ubc::read(&vnode, 100, &mut buf).unwrap(), 0);
}

#[test]
fn deallocate_wholly_releases_anonymous_pages() {
    let _serial = serial();
    let proc = ps::process_create("dealloc").unwrap();
    let base = map::allocate(&proc.vm, None, 4 * PAGE_SIZE).unwrap();

    let before = pfndb::vmstat().nanonprivate;
    for i in 0..4 {
        touch(&proc, base + i * PAGE_SIZE, true);
    }
    assert_eq!(pfndb::vmstat().nanonprivate, before + 4);

    map::deallocate(&proc.vm, base, 4 * PAGE_SIZE).unwrap();
    assert_eq!(pfndb::vmstat().nanonprivate, before);
    assert_eq!(proc.vm.ws.lock().count(), 0);

    // The space can be mapped again afterwards.
    let again = map::allocate(&proc.vm, Some(base), 4 * PAGE_SIZE).unwrap();
    assert_eq!(again, base);
    map::deallocate(&proc.vm, base, 4 * PAGE_SIZE).unwrap();
}

#[test]
fn trap_recovery_turns_kernel_faults_into_errors() {
    let _serial = serial();
    let kernel = ps::kernel_process();

    // With a recovery frame armed, a kernel fault on an unmapped address
    // surfaces as a failure for copyin/copyout to handle.
    noctis_kernel::ke::thread::trap_recovery_begin();
    let status = fault::fault(&kernel, 0xffff_9fff_0000_0000, false, None);
    noctis_kernel::ke::thread::trap_recovery_end();
    assert_eq!(status, FaultStatus::Failure);
}

#[test]
fn paging_daemons_heartbeat() {
    let _serial = serial();
    noctis_kernel::vm::balance::paging_init();
    // Let the balance-set manager and the writer take a few heartbeats.
    std::thread::sleep(Duration::from_millis(150));
}

#[test]
fn vm_fault_entry_loops_to_completion() {
    let _serial = serial();
    let proc = ps::process_create("entry").unwrap();
    let base = map::allocate(&proc.vm, None, PAGE_SIZE).unwrap();
    fault::handle(&proc, base + 123, true).unwrap();
    assert!(proc.vm.ws.lock().contains(base));
    map::deallocate(&proc.vm, base, PAGE_SIZE).unwrap();

    // Give the balance machinery a tick so its events settle.
    std::thread::sleep(Duration::from_millis(10));
}

// SPDX-License-Identifier: MPL-2.0

//! Slab caches over the wired heap.
//!
//! Two slab formats. Small objects (up to 512 bytes) pack a whole page,
//! free slots chained inline by 16-bit offsets; the slab header lives in
//! the page's own PFN record (the aux word carries the freelist head and
//! counts, the owner word the cache), so no header bytes are spent in the
//! page. Large objects get slabs of roundup(16 * size, page) bytes with
//! out-of-line bookkeeping: a free stack per slab and a hash from object
//! address to slab. Freelists are LIFO. `alloc` dispatches to a
//! power-of-two ladder of caches up to 4096 bytes; bigger requests go to
//! the wired heap directly. `free` must be told the exact size.

use hashbrown::HashMap;

use spin::Once;

use crate::prelude::*;

use super::{
    kwired,
    page::Page,
    Vaddr,
};
use crate::{
    config::{KMEM_MAX_CACHED, PAGE_SIZE, SMALL_SLAB_MAX},
    ke::SpinLock,
    util::AlignExt,
};

const ZONE_SIZES: [usize; 32] = [
    8, 16, 24, 32, 40, 48, 56, 64, 80, 96, 112, 128, 160, 192, 224, 256, 320, 384, 448, 512, 640,
    768, 896, 1024, 1280, 1536, 1792, 2048, 2560, 3072, 3584, 4096,
];

const NO_OFFSET: u16 = u16::MAX;

fn zone_index(size: usize) -> Option<usize> {
    assert!(size > 0);
    let index = if size <= 64 {
        size.align_up(8) / 8 - 1
    } else if size <= 128 {
        (size - 64).align_up(16) / 16 + 7
    } else if size <= 256 {
        (size - 128).align_up(32) / 32 + 11
    } else if size <= 512 {
        (size - 256).align_up(64) / 64 + 15
    } else if size <= 1024 {
        (size - 512).align_up(128) / 128 + 19
    } else if size <= 2048 {
        (size - 1024).align_up(256) / 256 + 23
    } else if size <= KMEM_MAX_CACHED {
        (size - 2048).align_up(512) / 512 + 27
    } else {
        return None;
    };
    Some(index)
}

/// Slab-header view over a small slab's page record: the aux word packs
/// the freelist head offset, the free count, and the capacity.
struct SmallSlabHdr<'a> {
    page: &'a Page,
}

impl SmallSlabHdr<'_> {
    fn head(&self) -> u16 {
        (self.page.slab_word() & 0xffff) as u16
    }

    fn nfree(&self) -> u16 {
        ((self.page.slab_word() >> 16) & 0xffff) as u16
    }

    fn capacity(&self) -> u16 {
        ((self.page.slab_word() >> 32) & 0xffff) as u16
    }

    fn set(&self, head: u16, nfree: u16, capacity: u16) {
        self.page
            .set_slab_word(head as u64 | ((nfree as u64) << 16) | ((capacity as u64) << 32));
    }
}

struct LargeSlab {
    free: Vec<Vaddr>,
    capacity: usize,
}

struct ZoneInner {
    /// Small slabs, by slab page base address.
    smalls: Vec<Vaddr>,
    /// Large slabs by base address, and the object -> slab base map.
    larges: HashMap<Vaddr, LargeSlab>,
    allocated: HashMap<Vaddr, Vaddr>,
}

struct Zone {
    size: usize,
    index: usize,
    inner: SpinLock<ZoneInner>,
}

impl Zone {
    fn is_small(&self) -> bool {
        self.size <= SMALL_SLAB_MAX
    }

    fn slab_bytes(&self) -> usize {
        if self.is_small() {
            PAGE_SIZE
        } else {
            (16 * self.size).align_up(PAGE_SIZE)
        }
    }

    fn capacity(&self) -> usize {
        self.slab_bytes() / self.size
    }

    fn alloc(&self) -> Vaddr {
        let mut inner = self.inner.lock();

        if self.is_small() {
            // LIFO within a slab; first slab with room wins.
            for base in inner.smalls.iter().copied() {
                let hdr = SmallSlabHdr {
                    page: kwired::page_of(base),
                };
                if hdr.nfree() == 0 {
                    continue;
                }
                let offset = hdr.head();
                let obj = base + offset as usize;
                let next = unsafe { (obj as *const u16).read() };
                hdr.set(next, hdr.nfree() - 1, hdr.capacity());
                return obj;
            }

            // A fresh slab: one page, freelist threaded through it.
            let base = kwired::kalloc_wired(1).expect("wired heap exhausted");
            let capacity = self.capacity() as u16;
            for i in 0..capacity {
                let obj = base + i as usize * self.size;
                let next = if i + 1 == capacity {
                    NO_OFFSET
                } else {
                    (i + 1) * self.size as u16
                };
                unsafe { (obj as *mut u16).write(next) };
            }
            let page = kwired::page_of(base);
            page.set_owner(self.index as u64);
            let hdr = SmallSlabHdr { page };
            hdr.set(self.size as u16, capacity - 1, capacity);
            inner.smalls.push(base);
            base
        } else {
            let found = inner
                .larges
                .iter()
                .find(|(_, slab)| !slab.free.is_empty())
                .map(|(base, _)| *base);
            let base = match found {
                Some(base) => base,
                None => {
                    let bytes = self.slab_bytes();
                    let base =
                        kwired::kalloc_wired(bytes / PAGE_SIZE).expect("wired heap exhausted");
                    let mut free = Vec::with_capacity(self.capacity());
                    for i in (0..self.capacity()).rev() {
                        free.push(base + i * self.size);
                    }
                    inner.larges.insert(
                        base,
                        LargeSlab {
                            free,
                            capacity: self.capacity(),
                        },
                    );
                    base
                }
            };
            let obj = inner.larges.get_mut(&base).unwrap().free.pop().unwrap();
            inner.allocated.insert(obj, base);
            obj
        }
    }

    fn free(&self, obj: Vaddr) {
        let mut inner = self.inner.lock();

        if self.is_small() {
            let base = obj.align_down(PAGE_SIZE);
            let page = kwired::page_of(base);
            assert_eq!(page.owner() as usize, self.index, "free to wrong cache");
            let hdr = SmallSlabHdr { page };
            unsafe { (obj as *mut u16).write(hdr.head()) };
            hdr.set((obj - base) as u16, hdr.nfree() + 1, hdr.capacity());

            if hdr.nfree() == hdr.capacity() {
                let pos = inner.smalls.iter().position(|b| *b == base).unwrap();
                inner.smalls.remove(pos);
                drop(inner);
                kwired::kfree_wired(base, 1);
            }
        } else {
            let base = inner
                .allocated
                .remove(&obj)
                .expect("freeing an unallocated object");
            let slab = inner.larges.get_mut(&base).unwrap();
            slab.free.push(obj);
            if slab.free.len() == slab.capacity {
                inner.larges.remove(&base);
                let bytes = self.slab_bytes();
                drop(inner);
                kwired::kfree_wired(base, bytes / PAGE_SIZE);
            }
        }
    }
}

static ZONES: Once<Vec<Zone>> = Once::new();

pub(crate) fn init() {
    ZONES.call_once(|| {
        ZONE_SIZES
            .iter()
            .enumerate()
            .map(|(index, size)| Zone {
                size: *size,
                index,
                inner: SpinLock::new(ZoneInner {
                    smalls: Vec::new(),
                    larges: HashMap::new(),
                    allocated: HashMap::new(),
                }),
            })
            .collect()
    });
}

fn zones() -> &'static [Zone] {
    ZONES.get().expect("kmem not bootstrapped")
}

/// Allocates `size` bytes of wired kernel memory.
pub fn alloc(size: usize) -> *mut u8 {
    match zone_index(size) {
        Some(index) => zones()[index].alloc() as *mut u8,
        None => {
            let npages = size.align_up(PAGE_SIZE) / PAGE_SIZE;
            kwired::kalloc_wired(npages).expect("wired heap exhausted") as *mut u8
        }
    }
}

/// Allocates zeroed memory.
pub fn zalloc(size: usize) -> *mut u8 {
    let ptr = alloc(size);
    unsafe { core::ptr::write_bytes(ptr, 0, size) };
    ptr
}

/// Frees `size` bytes at `ptr`; `size` must be the allocation's size.
pub fn free(ptr: *mut u8, size: usize) {
    match zone_index(size) {
        Some(index) => zones()[index].free(ptr as Vaddr),
        None => {
            let npages = size.align_up(PAGE_SIZE) / PAGE_SIZE;
            kwired::kfree_wired(ptr as Vaddr, npages);
        }
    }
}

/// Logs a line per cache with outstanding objects.
pub fn dump() {
    for zone in zones() {
        let inner = zone.inner.lock();
        let small_slabs = inner.smalls.len();
        let large_slabs = inner.larges.len();
        if small_slabs + large_slabs > 0 {
            log::info!(
                "kmem_{}: {} slabs, {} live large objects",
                zone.size,
                small_slabs + large_slabs,
                inner.allocated.len()
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn init_env() {
        crate::arch::hosted::init_kernel();
    }

    #[test]
    fn zone_ladder_matches_the_size_table() {
        init_env();
        assert_eq!(zone_index(1), Some(0));
        assert_eq!(zone_index(8), Some(0));
        assert_eq!(zone_index(9), Some(1));
        assert_eq!(zone_index(64), Some(7));
        assert_eq!(zone_index(65), Some(8));
        assert_eq!(zone_index(512), Some(19));
        assert_eq!(zone_index(513), Some(20));
        assert_eq!(zone_index(4096), Some(31));
        assert_eq!(zone_index(4097), None);
        for (index, size) in ZONE_SIZES.iter().enumerate() {
            assert_eq!(zone_index(*size), Some(index));
        }
    }

    #[test]
    fn small_slab_lifo_reuse() {
        init_env();
        let a = alloc(24);
        let b = alloc(24);
        assert_ne!(a, b);
        unsafe {
            a.write_bytes(0x11, 24);
            b.write_bytes(0x22, 24);
        }
        free(b, 24);
        // LIFO: the freed slot comes straight back.
        let c = alloc(24);
        assert_eq!(b, c);
        free(c, 24);
        free(a, 24);
    }

    #[test]
    fn large_slab_round_trip() {
        init_env();
        let objs: Vec<*mut u8> = (0..20).map(|_| alloc(1024)).collect();
        for (i, obj) in objs.iter().enumerate() {
            unsafe { obj.write_bytes(i as u8, 1024) };
        }
        for (i, obj) in objs.iter().enumerate() {
            assert_eq!(unsafe { obj.read() }, i as u8);
            free(*obj, 1024);
        }
    }

    #[test]
    fn oversize_goes_to_the_wired_heap() {
        init_env();
        let ptr = alloc(3 * PAGE_SIZE);
        unsafe { ptr.write_bytes(0xcc, 3 * PAGE_SIZE) };
        free(ptr, 3 * PAGE_SIZE);
    }
}

// SPDX-License-Identifier: MPL-2.0

//! Memory descriptor lists: pinned scatter-gather page lists for I/O.

use crate::prelude::*;

use super::{
    page::{Page, PageUse},
    pfndb,
    procstate::ProcState,
    wire, Paddr, Vaddr,
};
use crate::{
    arch,
    config::{PAGE_SHIFT, PAGE_SIZE},
    util::AlignExt,
};

pub struct Mdl {
    pages: Vec<&'static Page>,
    /// Byte offset of the first valid byte in the first page.
    offset: usize,
    write: bool,
    /// Whether the pages were allocated by this MDL (buffer MDLs) rather
    /// than pinned from an address space.
    owned: bool,
}

impl Mdl {
    /// Builds an MDL over freshly allocated pages.
    pub fn with_pages(npages: usize, use_: PageUse) -> Result<Mdl> {
        let mut pages = Vec::with_capacity(npages);
        let mut db = pfndb::lock();
        for _ in 0..npages {
            pages.push(db.alloc_page(use_, false)?);
        }
        Ok(Mdl {
            pages,
            offset: 0,
            write: false,
            owned: true,
        })
    }

    /// A wired I/O buffer of `npages`.
    pub fn buffer(npages: usize) -> Result<Mdl> {
        Mdl::with_pages(npages, PageUse::KWired)
    }

    /// Describes `[vaddr, vaddr + size)` of `ps`, pinning each page.
    ///
    /// Direct-map addresses translate without a walk; everything else must
    /// be resident in `ps`'s tables.
    pub fn create(ps: &ProcState, vaddr: Vaddr, size: usize, write: bool) -> Result<Mdl> {
        assert!(size > 0);
        let start = vaddr.align_down(PAGE_SIZE);
        let end = (vaddr + size).align_up(PAGE_SIZE);
        let npages = (end - start) / PAGE_SIZE;

        let direct_offset = arch::platform().direct_map_offset();
        let mut pages = Vec::with_capacity(npages);
        let mut db = pfndb::lock();

        for i in 0..npages {
            let page_vaddr = start + i * PAGE_SIZE;

            let page = if let Some(page) =
                pfndb::page_by_paddr(page_vaddr.wrapping_sub(direct_offset))
            {
                page
            } else {
                let pte_ref = wire::fetch_pte(ps, page_vaddr)
                    .ok_or(Error::new(ErrorKind::NotPresent))?;
                let pte = pte_ref.read();
                if !pte.is_valid() {
                    return_error_with_message!(ErrorKind::NotPresent, "MDL over non-resident page");
                }
                pfndb::page_by_pfn(pte.hw_pfn()).unwrap()
            };

            db.retain_page(page);
            pages.push(page);
        }

        Ok(Mdl {
            pages,
            offset: vaddr % PAGE_SIZE,
            write,
            owned: false,
        })
    }

    pub fn page_count(&self) -> usize {
        self.pages.len()
    }

    pub fn is_write(&self) -> bool {
        self.write
    }

    pub fn pages(&self) -> &[&'static Page] {
        &self.pages
    }

    /// Resolves a byte offset within the MDL to a physical address.
    pub fn paddr(&self, offset: usize) -> Option<Paddr> {
        let total = self.offset + offset;
        let index = total >> PAGE_SHIFT;
        let page = self.pages.get(index)?;
        Some(page.paddr() + (total & (PAGE_SIZE - 1)))
    }
}

impl Drop for Mdl {
    fn drop(&mut self) {
        let mut db = pfndb::lock();
        for page in self.pages.drain(..) {
            if self.owned {
                db.delete_page(page);
            }
            db.release_page(page);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buffer_mdl_resolves_offsets() {
        crate::arch::hosted::init_kernel();
        let mdl = Mdl::buffer(2).unwrap();
        assert_eq!(mdl.page_count(), 2);

        let first = mdl.paddr(0).unwrap();
        assert_eq!(first, mdl.pages()[0].paddr());
        let second = mdl.paddr(PAGE_SIZE + 7).unwrap();
        assert_eq!(second, mdl.pages()[1].paddr() + 7);
        assert!(mdl.paddr(2 * PAGE_SIZE).is_none());
    }

    #[test]
    fn create_pins_direct_map_pages() {
        crate::arch::hosted::init_kernel();
        let buffer = Mdl::buffer(1).unwrap();
        let vaddr = super::super::paddr_to_vaddr(buffer.pages()[0].paddr()) + 12;

        let kproc = crate::ps::kernel_process();
        let mdl = Mdl::create(&kproc.vm, vaddr, 100, true).unwrap();
        assert_eq!(mdl.page_count(), 1);
        assert_eq!(mdl.paddr(0).unwrap(), buffer.pages()[0].paddr() + 12);
        // Pinned twice now: once by the buffer, once by the view.
        assert_eq!(buffer.pages()[0].refcnt(), 2);
        drop(mdl);
        assert_eq!(buffer.pages()[0].refcnt(), 1);
    }
}

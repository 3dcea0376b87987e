// SPDX-License-Identifier: MPL-2.0

//! Architecture-neutral PTE handling.
//!
//! A PTE is one word in one of six states; everything above this module
//! works with [`PteKind`] and the constructors here, never with bit
//! layouts. PTEs are addressed physically ([`PteRef`]) so that a page
//! record's back-pointer (`referent_pte`) needs no language-level
//! reference into a table page.

use core::sync::atomic::{AtomicU64, Ordering};

use super::{Paddr, Pfn};
use crate::arch::{current as md, SoftKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PteKind {
    Zero,
    Valid,
    Trans,
    Busy,
    Swap,
    Fork,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pte(pub(crate) u64);

impl Pte {
    pub fn zero() -> Pte {
        Pte(0)
    }

    pub fn hw(pfn: Pfn, writeable: bool, user: bool) -> Pte {
        Pte(md::make_hw(pfn, writeable, user))
    }

    pub fn hw_table(pfn: Pfn) -> Pte {
        Pte(md::make_hw_table(pfn))
    }

    pub fn trans(pfn: Pfn) -> Pte {
        Pte(md::make_trans(pfn))
    }

    pub fn busy(pfn: Pfn) -> Pte {
        Pte(md::make_busy(pfn))
    }

    pub fn swap(slot: u64) -> Pte {
        Pte(md::make_swap(slot))
    }

    pub fn fork(addr: usize) -> Pte {
        Pte(md::make_fork(addr))
    }

    /// Categorises the PTE.
    pub fn kind(self) -> PteKind {
        if md::is_empty(self.0) {
            PteKind::Zero
        } else if md::is_valid(self.0) {
            PteKind::Valid
        } else {
            match md::soft_kind(self.0) {
                SoftKind::Swap => PteKind::Swap,
                SoftKind::Busy => PteKind::Busy,
                SoftKind::Trans => PteKind::Trans,
                SoftKind::Fork => PteKind::Fork,
            }
        }
    }

    pub fn is_valid(self) -> bool {
        self.kind() == PteKind::Valid
    }

    pub fn hw_pfn(self) -> Pfn {
        debug_assert!(self.is_valid());
        md::hw_pfn(self.0)
    }

    pub fn hw_paddr(self) -> Paddr {
        self.hw_pfn() << crate::config::PAGE_SHIFT
    }

    /// The frame a transition or busy PTE refers to.
    pub fn soft_pfn(self) -> Pfn {
        debug_assert!(matches!(self.kind(), PteKind::Trans | PteKind::Busy));
        md::soft_data(self.0) as Pfn
    }

    pub fn swap_slot(self) -> u64 {
        debug_assert_eq!(self.kind(), PteKind::Swap);
        md::soft_data(self.0)
    }

    pub fn fork_addr(self) -> usize {
        debug_assert_eq!(self.kind(), PteKind::Fork);
        md::fork_addr(self.0)
    }

    pub fn hw_is_writeable(self) -> bool {
        debug_assert!(self.is_valid());
        md::hw_is_writeable(self.0)
    }

    pub fn as_readonly(self) -> Pte {
        debug_assert!(self.is_valid());
        Pte(md::hw_set_readonly(self.0))
    }
}

/// A PTE located by its physical address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PteRef {
    paddr: Paddr,
}

impl PteRef {
    pub fn new(paddr: Paddr) -> PteRef {
        debug_assert_eq!(paddr % core::mem::size_of::<u64>(), 0);
        PteRef { paddr }
    }

    pub fn paddr(self) -> Paddr {
        self.paddr
    }

    fn cell(self) -> &'static AtomicU64 {
        unsafe { &*(super::paddr_to_vaddr(self.paddr) as *const AtomicU64) }
    }

    pub fn read(self) -> Pte {
        Pte(self.cell().load(Ordering::Acquire))
    }

    pub fn write(self, pte: Pte) {
        self.cell().store(pte.0, Ordering::Release);
    }

    /// The table page this PTE lives in.
    pub fn table_paddr(self) -> Paddr {
        self.paddr & !(crate::config::PAGE_SIZE - 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_are_disjoint() {
        assert_eq!(Pte::zero().kind(), PteKind::Zero);
        assert_eq!(Pte::hw(5, true, false).kind(), PteKind::Valid);
        assert_eq!(Pte::trans(5).kind(), PteKind::Trans);
        assert_eq!(Pte::busy(5).kind(), PteKind::Busy);
        assert_eq!(Pte::swap(5).kind(), PteKind::Swap);
        assert_eq!(Pte::fork(0x1000).kind(), PteKind::Fork);
    }

    #[test]
    fn readonly_preserves_frame() {
        let pte = Pte::hw(0x99, true, true).as_readonly();
        assert!(pte.is_valid());
        assert!(!pte.hw_is_writeable());
        assert_eq!(pte.hw_pfn(), 0x99);
    }
}

// SPDX-License-Identifier: MPL-2.0

//! Per-process virtual-memory state.

use core::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

use crate::prelude::*;

use super::{
    map::MapEntry,
    page::PageUse,
    pfndb,
    vmem::Vmem,
    wsl::WorkingSet,
    Paddr, Vaddr,
};
use crate::{
    arch,
    ke::{Mutex, RwMutex},
};

/// The VAD tree and address-space arena, under the map lock.
pub struct MapSpace {
    pub vads: BTreeMap<Vaddr, MapEntry>,
    pub vmem: Vmem,
}

impl MapSpace {
    /// The VAD covering `vaddr`, if any.
    pub fn vad_find(&self, vaddr: Vaddr) -> Option<&MapEntry> {
        self.vads
            .range(..=vaddr)
            .next_back()
            .map(|(_, vad)| vad)
            .filter(|vad| vad.end > vaddr)
    }
}

pub struct ProcState {
    /// Address-space layout: VADs and the dynamic-address arena.
    pub map: RwMutex<MapSpace>,
    /// Working-set list; also the lock under which page tables of this
    /// process are edited.
    pub ws: Mutex<WorkingSet>,
    root_table: AtomicUsize,
    /// Private anonymous pages created since the last fork.
    pub(crate) n_anonymous: AtomicUsize,
    pub(crate) last_trim_counter: AtomicU32,
    kernel: bool,
}

impl ProcState {
    fn new(kernel: bool, vmem: Vmem) -> ProcState {
        let root = {
            let mut db = pfndb::lock();
            let levels = arch::current::TABLE_LEVELS;
            db.alloc_page(PageUse::pml_for_level(levels), true)
                .expect("no page for a root table")
        };

        ProcState {
            map: RwMutex::new(MapSpace {
                vads: BTreeMap::new(),
                vmem,
            }),
            ws: Mutex::new(WorkingSet::new(super::boot_config().ws_default_max)),
            root_table: AtomicUsize::new(root.paddr()),
            n_anonymous: AtomicUsize::new(0),
            last_trim_counter: AtomicU32::new(0),
            kernel,
        }
    }

    /// The kernel's own address-space state, made once at bootstrap.
    pub(crate) fn new_kernel() -> ProcState {
        ProcState::new(
            true,
            Vmem::new(
                "kernel-dynamic-va",
                super::KVM_DYNAMIC_BASE,
                super::KVM_DYNAMIC_SIZE,
                crate::config::PAGE_SIZE,
            ),
        )
    }

    pub(crate) fn new_user() -> Result<ProcState> {
        Ok(ProcState::new(
            false,
            Vmem::new(
                "dynamic-va",
                super::LOWER_HALF_BASE,
                super::LOWER_HALF_SIZE,
                crate::config::PAGE_SIZE,
            ),
        ))
    }

    /// Stamps this state's address into its root table page, once the
    /// state has its final home.
    pub(crate) fn bind_owner(&self) {
        let root = pfndb::page_by_paddr(self.root_table()).unwrap();
        root.set_owner(self as *const ProcState as u64);
    }

    pub fn root_table(&self) -> Paddr {
        self.root_table.load(Ordering::Acquire)
    }

    pub fn is_kernel(&self) -> bool {
        self.kernel
    }

    pub fn n_anonymous(&self) -> usize {
        self.n_anonymous.load(Ordering::Acquire)
    }
}

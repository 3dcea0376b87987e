// SPDX-License-Identifier: MPL-2.0

//! The Noctis nanokernel and virtual-memory manager.
//!
//! The crate is split along the lines of the system itself:
//!
//! - [`ke`]: the nanokernel: IPL and spinlocks, DPCs and timers, dispatcher
//!   objects with wait-one/wait-multi, the per-CPU scheduler, and RCU.
//! - [`vm`]: the virtual-memory manager: the PFN database and buddy
//!   allocator, the page-table walker with the pin/wire protocol, working-set
//!   lists, the page-fault handler with fork-on-write, VMem arenas and slab
//!   caches, MDLs, and the unified buffer cache.
//! - [`ps`]: the thin process/thread executive the two sit under.
//! - [`arch`]: per-architecture page-table encodings and the platform seam
//!   through which a port supplies context switching, IPIs and the clock.
//!
//! Device drivers, boot protocol glue and file-system clients live outside
//! this crate and reach it only through the interfaces re-exported from the
//! modules above.

#![no_std]
#![deny(unsafe_op_in_unsafe_fn)]

extern crate alloc;

#[cfg(not(target_os = "none"))]
extern crate std;

#[macro_use]
pub mod error;

pub mod arch;
pub mod config;
pub mod ke;
pub mod logger;
pub mod prelude;
pub mod ps;
pub mod util;
pub mod vm;

pub use error::{Error, ErrorKind, Result};

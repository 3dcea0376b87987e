// SPDX-License-Identifier: MPL-2.0

//! The kernel prelude.

pub(crate) use alloc::{
    boxed::Box,
    collections::{BTreeMap, VecDeque},
    string::String,
    sync::{Arc, Weak},
    vec,
    vec::Vec,
};

pub use crate::error::{Error, ErrorKind, Result};
pub(crate) use crate::vm::{Paddr, Pfn, Vaddr};

// SPDX-License-Identifier: MPL-2.0

//! Small utilities shared across the kernel.

mod align;

pub use align::AlignExt;

// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Executable memory for template-compiled code.
//!
//! A [`CodeArena`] hands out page-rounded regions that are readable, writable
//! and executable at the same time. Regions are referred to by [`CodeBlob`]
//! handles which carry a generation, so a handle that outlived a `free` or an
//! `expand` is caught instead of silently aliasing someone else's code.
//!
//! [`Assembler`] is a write cursor on top of a single region. It knows nothing
//! about instruction encodings, it only appends little-endian bytes and grows
//! the region when it runs out of space.

mod arena;
mod assembler;
mod error;
mod mmap;

pub use arena::{ArenaConfig, CodeArena, CodeBlob};
pub use assembler::Assembler;
pub use error::AllocError;

/// The granularity regions are rounded up to.
#[must_use]
pub fn page_size() -> usize {
    mmap::page_size()
}

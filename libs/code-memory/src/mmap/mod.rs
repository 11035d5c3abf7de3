// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Anonymous read-write-execute mappings straight from the OS.

cfg_if::cfg_if! {
    if #[cfg(unix)] {
        mod unix;
        use unix as sys;
    } else if #[cfg(windows)] {
        mod windows;
        use windows as sys;
    } else {
        compile_error!("code-memory needs an OS that can map executable memory");
    }
}

use core::ptr::NonNull;
use core::slice;

pub(crate) use sys::page_size;

/// An owned, page-aligned mapping that is readable, writable and executable.
///
/// The mapping is released when this is dropped.
#[derive(Debug)]
pub(crate) struct Mmap {
    ptr: NonNull<u8>,
    len: usize,
}

// Safety: `Mmap` owns its mapping exclusively; the raw pointer is never shared
// through `&self` methods in a way that allows unsynchronized mutation.
unsafe impl Send for Mmap {}
// Safety: see above, shared access only ever reads.
unsafe impl Sync for Mmap {}

impl Mmap {
    /// Maps `len` zeroed bytes. `len` must be a non-zero multiple of the page size.
    pub(crate) fn new_executable(len: usize) -> std::io::Result<Self> {
        debug_assert!(len > 0 && len.is_multiple_of(page_size()));
        let ptr = sys::map_executable(len)?;
        Ok(Self { ptr, len })
    }

    #[inline]
    pub(crate) fn as_non_null(&self) -> NonNull<u8> {
        self.ptr
    }

    #[inline]
    pub(crate) fn as_ptr(&self) -> *const u8 {
        self.ptr.as_ptr()
    }

    #[inline]
    pub(crate) fn as_mut_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    #[inline]
    pub(crate) fn len(&self) -> usize {
        self.len
    }

    pub(crate) fn as_slice(&self) -> &[u8] {
        // Safety: the mapping is `len` bytes long, readable, and lives as long as `self`.
        unsafe { slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }
}

impl Drop for Mmap {
    fn drop(&mut self) {
        // Safety: `ptr` and `len` describe a mapping created by `map_executable`
        // that nothing else owns.
        unsafe { sys::unmap(self.ptr, self.len) }
    }
}

/// Rounds `size` up to a whole number of pages, returning `None` on overflow.
pub(crate) fn page_round_up(size: usize) -> Option<usize> {
    let page_size = page_size();
    Some(size.checked_add(page_size - 1)? & !(page_size - 1))
}

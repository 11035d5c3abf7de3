// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::ptr::{self, NonNull};
use std::io::Error;

pub(crate) fn map_executable(len: usize) -> std::io::Result<NonNull<u8>> {
    // macOS refuses RWX mappings without MAP_JIT.
    cfg_if::cfg_if! {
        if #[cfg(target_os = "macos")] {
            let map_flags = libc::MAP_ANON | libc::MAP_PRIVATE | libc::MAP_JIT;
        } else {
            let map_flags = libc::MAP_ANON | libc::MAP_PRIVATE;
        }
    }

    // Safety: anonymous mapping with no address hint, the kernel picks the placement.
    let mmap = unsafe {
        libc::mmap(
            ptr::null_mut(),
            len,
            libc::PROT_READ | libc::PROT_WRITE | libc::PROT_EXEC,
            map_flags,
            -1,
            0,
        )
    };
    if mmap == libc::MAP_FAILED {
        return Err(Error::last_os_error());
    }

    NonNull::new(mmap.cast::<u8>()).ok_or_else(Error::last_os_error)
}

/// # Safety
///
/// `ptr` and `len` must describe a live mapping returned by [`map_executable`].
pub(crate) unsafe fn unmap(ptr: NonNull<u8>, len: usize) {
    // Safety: ensured by caller
    let ret = unsafe { libc::munmap(ptr.as_ptr().cast(), len) };
    debug_assert_eq!(ret, 0);
}

pub(crate) fn page_size() -> usize {
    // Safety: sysconf has no preconditions
    let pagesize = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    let pagesize = usize::try_from(pagesize).unwrap_or(4096);
    debug_assert!(pagesize.is_power_of_two());
    pagesize
}

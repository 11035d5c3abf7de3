// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::ptr::{self, NonNull};
use std::io::Error;
use windows_sys::Win32::System::Memory::{
    MEM_COMMIT, MEM_RELEASE, MEM_RESERVE, PAGE_EXECUTE_READWRITE, VirtualAlloc, VirtualFree,
};
use windows_sys::Win32::System::SystemInformation::{GetSystemInfo, SYSTEM_INFO};

pub(crate) fn map_executable(len: usize) -> std::io::Result<NonNull<u8>> {
    // Safety: fresh reservation with no address hint.
    let base = unsafe {
        VirtualAlloc(
            ptr::null(),
            len,
            MEM_COMMIT | MEM_RESERVE,
            PAGE_EXECUTE_READWRITE,
        )
    };
    NonNull::new(base.cast::<u8>()).ok_or_else(Error::last_os_error)
}

/// # Safety
///
/// `ptr` must be the base of a live allocation returned by [`map_executable`].
pub(crate) unsafe fn unmap(ptr: NonNull<u8>, _len: usize) {
    // Safety: ensured by caller
    let ret = unsafe { VirtualFree(ptr.as_ptr().cast(), 0, MEM_RELEASE) };
    debug_assert_ne!(ret, 0);
}

pub(crate) fn page_size() -> usize {
    // Safety: GetSystemInfo only writes to the struct we hand it.
    let info = unsafe {
        let mut info = core::mem::zeroed::<SYSTEM_INFO>();
        GetSystemInfo(&raw mut info);
        info
    };
    usize::try_from(info.dwPageSize).unwrap_or(4096)
}

// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The contract between compiled code and whoever runs it.

use crate::trap::TrapKind;
use core::ffi::c_void;
use core::mem::offset_of;
use core::ptr;

cfg_if::cfg_if! {
    if #[cfg(target_arch = "x86_64")] {
        /// Signature of every compiled function.
        ///
        /// Arguments are passed as an array of 8-byte slots, one per parameter
        /// in declaration order. `i32` and `f32` arguments occupy the low half
        /// of their slot (floats as raw bits). The single result, if any, is
        /// returned the same way. After a trap the function returns `0` and
        /// [`VMContext::trap_code`] is non-zero.
        pub type EntryFn = unsafe extern "sysv64" fn(vmctx: *mut VMContext, args: *const u64) -> u64;
        /// Services compiled code can't perform inline, see [`RuntimeCall`].
        pub type RuntimeCallFn =
            unsafe extern "sysv64" fn(vmctx: *mut VMContext, call: u32, arg0: u64, arg1: u64) -> u64;
        /// Invoked once when compiled code traps, after the trap code was
        /// recorded.
        ///
        /// If it returns, the trapping function and all its compiled callers
        /// return `0` up to the host.
        pub type TrapHandlerFn = unsafe extern "sysv64" fn(vmctx: *mut VMContext);
    } else {
        pub type EntryFn = unsafe extern "C" fn(vmctx: *mut VMContext, args: *const u64) -> u64;
        pub type RuntimeCallFn =
            unsafe extern "C" fn(vmctx: *mut VMContext, call: u32, arg0: u64, arg1: u64) -> u64;
        pub type TrapHandlerFn = unsafe extern "C" fn(vmctx: *mut VMContext);
    }
}

/// Requests compiled code makes through [`VMContext::runtime_call`].
///
/// `MemoryGrow` receives the delta in pages as `arg0` and returns the old size
/// in pages, or `u32::MAX` if the memory can't grow. On success it must update
/// [`VMContext::memory_base`] and [`VMContext::memory_len`].
///
/// `ResolveIndirect` receives the expected type index as `arg0` and the table
/// element index as `arg1`. It returns the entry point of the function to
/// call, or null after recording the trap in [`VMContext::trap_code`].
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u32)]
pub enum RuntimeCall {
    MemoryGrow = 0,
    ResolveIndirect = 1,
}

impl RuntimeCall {
    #[must_use]
    pub fn from_u32(call: u32) -> Option<Self> {
        match call {
            0 => Some(Self::MemoryGrow),
            1 => Some(Self::ResolveIndirect),
            _ => None,
        }
    }
}

/// Per-instance state compiled code reads through `rbx`.
///
/// Field offsets are part of the generated code, they are checked below.
#[derive(Debug)]
#[repr(C)]
pub struct VMContext {
    /// Base of linear memory, may be null when the length is zero.
    pub memory_base: *mut u8,
    /// Length of linear memory in bytes.
    pub memory_len: u64,
    /// One 8-byte slot per global in the module's global index space.
    pub globals: *mut u64,
    /// One entry point per function in the module's function index space.
    pub functions: *const *const u8,
    pub runtime_call: RuntimeCallFn,
    pub trap_handler: TrapHandlerFn,
    /// Zero while no trap happened, otherwise a [`TrapKind`] code.
    pub trap_code: u32,
    /// Free for the embedder, never touched by compiled code.
    pub host_data: *mut c_void,
}

pub(crate) const MEMORY_BASE: i32 = 0;
pub(crate) const MEMORY_LEN: i32 = 8;
pub(crate) const GLOBALS: i32 = 16;
pub(crate) const FUNCTIONS: i32 = 24;
pub(crate) const RUNTIME_CALL: i32 = 32;
pub(crate) const TRAP_HANDLER: i32 = 40;
pub(crate) const TRAP_CODE: i32 = 48;

const _: () = {
    assert!(offset_of!(VMContext, memory_base) == MEMORY_BASE.cast_unsigned() as usize);
    assert!(offset_of!(VMContext, memory_len) == MEMORY_LEN.cast_unsigned() as usize);
    assert!(offset_of!(VMContext, globals) == GLOBALS.cast_unsigned() as usize);
    assert!(offset_of!(VMContext, functions) == FUNCTIONS.cast_unsigned() as usize);
    assert!(offset_of!(VMContext, runtime_call) == RUNTIME_CALL.cast_unsigned() as usize);
    assert!(offset_of!(VMContext, trap_handler) == TRAP_HANDLER.cast_unsigned() as usize);
    assert!(offset_of!(VMContext, trap_code) == TRAP_CODE.cast_unsigned() as usize);
};

impl Default for VMContext {
    fn default() -> Self {
        Self::new()
    }
}

impl VMContext {
    /// A context without memory, globals or functions whose runtime refuses
    /// every request and whose trap handler does nothing.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            memory_base: ptr::null_mut(),
            memory_len: 0,
            globals: ptr::null_mut(),
            functions: ptr::null(),
            runtime_call: no_runtime,
            trap_handler: ignore_trap,
            trap_code: 0,
            host_data: ptr::null_mut(),
        }
    }

    /// The trap recorded by the last call, if any.
    #[must_use]
    pub fn trap(&self) -> Option<TrapKind> {
        TrapKind::from_code(self.trap_code)
    }

    pub fn clear_trap(&mut self) {
        self.trap_code = 0;
    }

    /// # Safety
    ///
    /// `vmctx` must point to a live context. Compiled code always passes the
    /// context it was entered with.
    pub(crate) unsafe fn record_trap(vmctx: *mut VMContext, kind: TrapKind) {
        // Safety: ensured by caller
        unsafe { (*vmctx).trap_code = kind.code() };
    }
}

jit_abi! {
    fn no_runtime(vmctx: *mut VMContext, call: u32, _arg0: u64, _arg1: u64) -> u64 {
        match RuntimeCall::from_u32(call) {
            Some(RuntimeCall::MemoryGrow) => u64::from(u32::MAX),
            Some(RuntimeCall::ResolveIndirect) | None => {
                // Safety: only ever called by compiled code with its own context
                unsafe { VMContext::record_trap(vmctx, TrapKind::TableOutOfBounds) };
                0
            }
        }
    }

    fn ignore_trap(_vmctx: *mut VMContext) {}
}

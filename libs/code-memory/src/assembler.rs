// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::arena::{CodeArena, CodeBlob};
use crate::error::AllocError;
use core::mem::ManuallyDrop;
use core::{ptr, slice};

/// An append-only write cursor into one region of a [`CodeArena`].
///
/// The assembler exclusively owns its region until [`finish`](Self::finish)
/// hands the [`CodeBlob`] to the caller. Dropping an unfinished assembler
/// frees the region.
pub struct Assembler<'a> {
    arena: &'a CodeArena,
    blob: CodeBlob,
    offset: usize,
}

impl<'a> Assembler<'a> {
    /// Starts a new region with room for at least `size_hint` bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if the arena can't map the region.
    pub fn new(arena: &'a CodeArena, size_hint: usize) -> Result<Self, AllocError> {
        let blob = arena.allocate(size_hint)?;
        Ok(Self {
            arena,
            blob,
            offset: 0,
        })
    }

    /// The number of bytes emitted so far, which is also the offset the next
    /// byte will be written at.
    #[inline]
    #[must_use]
    pub fn offset(&self) -> usize {
        self.offset
    }

    #[inline]
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.blob.size()
    }

    /// The bytes emitted so far.
    #[must_use]
    pub fn code(&self) -> &[u8] {
        // Safety: the region is live and owned by us, and `offset <= size`.
        unsafe { slice::from_raw_parts(self.blob.as_ptr(), self.offset) }
    }

    fn reserve(&mut self, additional: usize) -> Result<(), AllocError> {
        let needed = self
            .offset
            .checked_add(additional)
            .ok_or(AllocError::SizeOverflow(additional))?;

        if needed > self.blob.size() {
            self.blob = self.arena.expand_to(self.blob, needed)?;
            log::trace!(
                "assembler region grew to {} bytes at {:p}",
                self.blob.size(),
                self.blob.as_ptr()
            );
        }

        Ok(())
    }

    /// Appends raw bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if the region had to grow and the arena failed to map
    /// the bigger one.
    pub fn emit_bytes(&mut self, bytes: &[u8]) -> Result<(), AllocError> {
        self.reserve(bytes.len())?;
        // Safety: `reserve` made room for `bytes.len()` bytes past `offset`
        // and the region is exclusively ours.
        unsafe {
            ptr::copy_nonoverlapping(
                bytes.as_ptr(),
                self.blob.as_mut_ptr().add(self.offset),
                bytes.len(),
            );
        }
        self.offset += bytes.len();
        Ok(())
    }

    /// # Errors
    ///
    /// See [`emit_bytes`](Self::emit_bytes).
    #[inline]
    pub fn emit_u8(&mut self, val: u8) -> Result<(), AllocError> {
        self.emit_bytes(&[val])
    }

    /// # Errors
    ///
    /// See [`emit_bytes`](Self::emit_bytes).
    #[inline]
    pub fn emit_u16(&mut self, val: u16) -> Result<(), AllocError> {
        self.emit_bytes(&val.to_le_bytes())
    }

    /// # Errors
    ///
    /// See [`emit_bytes`](Self::emit_bytes).
    #[inline]
    pub fn emit_u32(&mut self, val: u32) -> Result<(), AllocError> {
        self.emit_bytes(&val.to_le_bytes())
    }

    /// # Errors
    ///
    /// See [`emit_bytes`](Self::emit_bytes).
    #[inline]
    pub fn emit_u64(&mut self, val: u64) -> Result<(), AllocError> {
        self.emit_bytes(&val.to_le_bytes())
    }

    /// Overwrites four already emitted bytes at `at`.
    ///
    /// Offsets stay meaningful across relocation, so forward branches record
    /// the offset of their displacement and patch it once the target is known.
    ///
    /// # Panics
    ///
    /// Panics if `at..at + 4` reaches past the bytes emitted so far.
    pub fn patch_u32(&mut self, at: usize, val: u32) {
        assert!(
            at.checked_add(4).is_some_and(|end| end <= self.offset),
            "patch at {at:#x} is outside the emitted code (len {:#x})",
            self.offset
        );
        let bytes = val.to_le_bytes();
        // Safety: checked above that the four bytes lie within emitted code.
        unsafe {
            ptr::copy_nonoverlapping(bytes.as_ptr(), self.blob.as_mut_ptr().add(at), bytes.len());
        }
    }

    /// Ends emission and hands the region to the caller, who must eventually
    /// pass it back to [`CodeArena::free`].
    #[must_use]
    pub fn finish(self) -> CodeBlob {
        let this = ManuallyDrop::new(self);
        log::trace!(
            "finished {} bytes of code in {:?}",
            this.offset,
            this.blob
        );
        this.blob
    }
}

impl Drop for Assembler<'_> {
    fn drop(&mut self) {
        self.arena.free(self.blob);
    }
}

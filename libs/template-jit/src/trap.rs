// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::fmt;

/// Why compiled code stopped executing.
///
/// The discriminants are the values written to
/// [`VMContext::trap_code`](crate::VMContext::trap_code), zero is reserved for
/// "no trap".
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum TrapKind {
    /// Code that was supposed to have been unreachable was reached.
    UnreachableCodeReached = 1,
    /// An out-of-bounds memory access.
    MemoryOutOfBounds = 2,
    /// An integer division by zero.
    IntegerDivisionByZero = 3,
    /// An integer arithmetic operation caused an overflow.
    IntegerOverflow = 4,
    /// Failed float-to-int conversion.
    BadConversionToInteger = 5,
    /// Out-of-bounds access to a table.
    TableOutOfBounds = 6,
    /// Indirect call to a null table entry.
    IndirectCallToNull = 7,
    /// Signature mismatch on indirect call.
    BadSignature = 8,
}

impl TrapKind {
    pub(crate) const ALL: [TrapKind; 8] = [
        Self::UnreachableCodeReached,
        Self::MemoryOutOfBounds,
        Self::IntegerDivisionByZero,
        Self::IntegerOverflow,
        Self::BadConversionToInteger,
        Self::TableOutOfBounds,
        Self::IndirectCallToNull,
        Self::BadSignature,
    ];

    #[must_use]
    pub const fn code(self) -> u32 {
        self as u32
    }

    /// Position in [`Self::ALL`], used to index per-kind tables.
    pub(crate) const fn slot(self) -> usize {
        self as usize - 1
    }

    #[must_use]
    pub fn from_code(code: u32) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.code() == code)
    }
}

impl fmt::Display for TrapKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrapKind::UnreachableCodeReached => f.write_str("unreachable code executed"),
            TrapKind::MemoryOutOfBounds => f.write_str("out of bounds memory access"),
            TrapKind::IntegerDivisionByZero => f.write_str("integer divide by zero"),
            TrapKind::IntegerOverflow => f.write_str("integer overflow"),
            TrapKind::BadConversionToInteger => f.write_str("invalid conversion to integer"),
            TrapKind::TableOutOfBounds => f.write_str("out of bounds table access"),
            TrapKind::IndirectCallToNull => f.write_str("accessed uninitialized table element"),
            TrapKind::BadSignature => f.write_str("indirect call signature mismatch"),
        }
    }
}

impl core::error::Error for TrapKind {}

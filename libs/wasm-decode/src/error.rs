// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::fmt;

/// The broad category a decoding failure falls into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorClass {
    /// The input violates the structure of the binary format.
    MalformedBinary,
    /// An LEB128 integer is too long or does not fit its target width.
    EncodingOverflow,
    /// The input is well-formed but uses something this decoder doesn't
    /// implement.
    UnsupportedConstruct,
}

#[derive(Debug, Clone, PartialEq, Eq, onlyerror::Error)]
pub enum ErrorKind {
    #[error("unexpected end of input")]
    UnexpectedEof,
    #[error("magic header not detected")]
    BadMagic,
    #[error("unknown binary version {0:#x}")]
    UnsupportedVersion(u32),
    #[error("malformed UTF-8 encoding")]
    MalformedUtf8,
    #[error("string too long")]
    StringTooLong,
    #[error("integer too large")]
    IntegerTooLarge,
    #[error("integer representation too long")]
    IntegerTooLong,
    #[error("malformed section id {0}")]
    UnknownSection(u8),
    #[error("section {0} out of order")]
    SectionOutOfOrder(u8),
    /// Declared section size and where in the section decoding stopped.
    #[error("section size mismatch: declared {0} bytes, decoding stopped at byte {1}")]
    SectionSizeMismatch(usize, usize),
    #[error("function body size mismatch")]
    FunctionBodySizeMismatch,
    #[error("function and code section have inconsistent lengths ({0} vs {1})")]
    FunctionCodeMismatch(usize, usize),
    #[error("too many {0} (limit is {1})")]
    TooMany(&'static str, usize),
    #[error("too many locals")]
    TooManyLocals,
    #[error("function body too large")]
    FunctionTooLarge,
    #[error("malformed value type {0:#04x}")]
    MalformedValType(u8),
    #[error("malformed function type tag {0:#04x}")]
    MalformedFuncTypeTag(u8),
    #[error("malformed reference type {0:#04x}")]
    MalformedRefType(u8),
    #[error("malformed limits flags {0:#04x}")]
    MalformedLimits(u8),
    #[error("malformed mutability {0:#04x}")]
    MalformedMutability(u8),
    #[error("malformed import kind {0:#04x}")]
    MalformedImportKind(u8),
    #[error("malformed export kind {0:#04x}")]
    MalformedExportKind(u8),
    #[error("malformed element segment flags {0}")]
    MalformedElementFlags(u32),
    #[error("malformed element kind {0:#04x}")]
    MalformedElementKind(u8),
    #[error("malformed data segment flags {0}")]
    MalformedDataFlags(u32),
    #[error("zero byte expected")]
    ZeroByteExpected,
    #[error("malformed block type {0}")]
    MalformedBlockType(i64),
    #[error("`else` outside of an `if` block")]
    UnexpectedElse,
    #[error("nesting too deep")]
    NestingTooDeep,
    #[error("undefined opcode {0:#04x}")]
    UnknownOpcode(u8),
    #[error("undefined opcode {0:#04x} {1}")]
    UnknownPrefixedOpcode(u8, u32),
    #[error("element segments using initializer expressions are not supported")]
    UnsupportedElementExprs,
}

impl ErrorKind {
    #[must_use]
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::IntegerTooLarge | Self::IntegerTooLong => ErrorClass::EncodingOverflow,
            Self::UnknownOpcode(_)
            | Self::UnknownPrefixedOpcode(..)
            | Self::UnsupportedElementExprs => ErrorClass::UnsupportedConstruct,
            _ => ErrorClass::MalformedBinary,
        }
    }
}

impl From<leb128::Error> for ErrorKind {
    fn from(err: leb128::Error) -> Self {
        match err {
            leb128::Error::Overflow => Self::IntegerTooLarge,
            leb128::Error::TooLong => Self::IntegerTooLong,
            leb128::Error::UnexpectedEof | leb128::Error::NotEnoughSpace => Self::UnexpectedEof,
        }
    }
}

/// A decoding failure together with the absolute byte offset it was detected
/// at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodeError {
    offset: usize,
    kind: ErrorKind,
}

impl DecodeError {
    pub(crate) fn new(kind: ErrorKind, offset: usize) -> Self {
        Self { offset, kind }
    }

    /// Byte offset into the module binary where the problem was found.
    #[must_use]
    pub fn offset(&self) -> usize {
        self.offset
    }

    #[must_use]
    pub fn kind(&self) -> &ErrorKind {
        &self.kind
    }

    #[must_use]
    pub fn class(&self) -> ErrorClass {
        self.kind.class()
    }
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (at offset {:#x})", self.kind, self.offset)
    }
}

impl core::error::Error for DecodeError {
    fn source(&self) -> Option<&(dyn core::error::Error + 'static)> {
        Some(&self.kind)
    }
}

/// Errors returned by [`read_from_file`](crate::read_from_file).
#[derive(Debug, onlyerror::Error)]
pub enum LoadError {
    #[error("failed to read module file")]
    Io(#[from] std::io::Error),
    #[error("failed to decode module")]
    Decode(#[from] DecodeError),
}

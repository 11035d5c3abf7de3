// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Decoder for the WebAssembly module binary format.
//!
//! [`decode`] turns a byte buffer into an owned, immutable [`Module`]. Decoding
//! is strict: integers must use bounded LEB128 encodings, sections must appear
//! in order and consume exactly their declared size, and function bodies are
//! decoded into nested [`Instruction`] trees.
//!
//! ```
//! let module = wasm_decode::decode(b"\0asm\x01\0\0\0").unwrap();
//! assert!(module.types().is_empty());
//! assert!(module.code().is_empty());
//! ```

mod binary_reader;
mod error;
mod indices;
mod instructions;
mod limits;
mod module;
mod opcode;
mod parser;
#[cfg(feature = "test_utils")]
pub mod test_utils;
mod types;

use std::path::Path;

pub use error::{DecodeError, ErrorClass, ErrorKind, LoadError};
pub use indices::*;
pub use instructions::{BlockType, Expr, Ieee32, Ieee64, Instruction, MemArg};
pub use limits::*;
pub use module::{
    CustomSection, Data, DataMode, Element, ElementMode, Export, ExportDesc, FunctionBody, Global,
    Import, ImportDesc, Locals, Module, WASM_MAGIC_BYTES, WASM_VERSION,
};
pub use opcode::{Opcode, TRUNC_SAT_PREFIX, TruncSatOp};
pub use types::{
    FuncType, GlobalType, Limits, MAX_PAGES, MemoryType, Mutability, PAGE_SIZE, RefType,
    TableType, ValType,
};

type Result<T> = core::result::Result<T, DecodeError>;

/// Decodes a module binary with the default [`ReaderConfig`].
///
/// # Errors
///
/// Returns a [`DecodeError`] describing the first problem found. No partially
/// decoded module is ever returned.
pub fn decode(bytes: &[u8]) -> Result<Module> {
    decode_with_config(bytes, &ReaderConfig::default())
}

/// Decodes a module binary.
///
/// # Errors
///
/// Returns a [`DecodeError`] describing the first problem found.
pub fn decode_with_config(bytes: &[u8], config: &ReaderConfig) -> Result<Module> {
    parser::parse_module(bytes, config)
}

/// Reads the file at `path` and decodes it.
///
/// # Errors
///
/// Returns [`LoadError::Io`] if the file can't be read and
/// [`LoadError::Decode`] if its contents are not a valid module.
pub fn read_from_file(path: impl AsRef<Path>) -> core::result::Result<Module, LoadError> {
    let path = path.as_ref();
    log::debug!("Reading module from {}", path.display());
    let bytes = std::fs::read(path)?;
    Ok(decode(&bytes)?)
}

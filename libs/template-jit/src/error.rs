// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use code_memory::AllocError;
use wasm_decode::Opcode;

#[derive(Debug, onlyerror::Error)]
pub enum Error {
    /// The function uses a construct this backend has no template for.
    #[error("unsupported: {0}")]
    Unsupported(&'static str),
    /// An instruction reached the opcode dispatch with a shape it never has
    /// when produced by the decoder.
    #[error("no template for `{0}` in this position")]
    BadOpcode(Opcode),
    /// The function body is structurally broken, e.g. it pops more values
    /// than a block holds or refers to a local that doesn't exist.
    #[error("invalid function: {0}")]
    InvalidFunction(String),
    #[error("failed to allocate code memory")]
    Alloc(#[from] AllocError),
}

pub(crate) fn invalid(msg: impl Into<String>) -> Error {
    Error::InvalidFunction(msg.into())
}

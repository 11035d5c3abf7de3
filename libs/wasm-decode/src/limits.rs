// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Upper bounds on the size of decoded items.
//!
//! Counts read from the binary are checked against these before anything is
//! allocated, so a hostile length prefix can't make the reader reserve
//! gigabytes of memory.

pub const MAX_WASM_STRING_SIZE: usize = 100_000;
pub const MAX_WASM_TYPES: usize = 1_000_000;
pub const MAX_WASM_IMPORTS: usize = 100_000;
pub const MAX_WASM_EXPORTS: usize = 100_000;
pub const MAX_WASM_TABLES: usize = 100;
pub const MAX_WASM_MEMORIES: usize = 100;
pub const MAX_WASM_FUNCTIONS: usize = 1_000_000;
pub const MAX_WASM_GLOBALS: usize = 1_000_000;
pub const MAX_WASM_ELEMENT_SEGMENTS: usize = 100_000;
pub const MAX_WASM_DATA_SEGMENTS: usize = 100_000;
pub const MAX_WASM_BR_TABLE_SIZE: usize = MAX_WASM_FUNCTION_SIZE;

pub const MAX_WASM_FUNCTION_SIZE: usize = 128 * 1024;
pub const MAX_WASM_FUNCTION_LOCALS: usize = 50000;
pub const MAX_WASM_FUNCTION_PARAMS: usize = 1000;
pub const MAX_WASM_FUNCTION_RETURNS: usize = 1000;

pub const MAX_WASM_TABLE_ENTRIES: usize = 10_000_000;

/// Default bound on how deeply `block`/`loop`/`if` may nest.
pub const DEFAULT_MAX_NESTING_DEPTH: usize = 1024;

/// Tunables for [`decode_with_config`](crate::decode_with_config).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReaderConfig {
    /// Structured control instructions nested deeper than this are rejected
    /// as malformed.
    pub max_nesting_depth: usize,
}

impl Default for ReaderConfig {
    fn default() -> Self {
        Self {
            max_nesting_depth: DEFAULT_MAX_NESTING_DEPTH,
        }
    }
}

// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

/// Knobs for a [`TemplateCompiler`](crate::TemplateCompiler).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompilerConfig {
    /// Estimated native code bytes per wasm instruction, used to size the
    /// initial code region. Underestimates only cost a region expansion.
    pub bytes_per_instruction: usize,
}

impl Default for CompilerConfig {
    fn default() -> Self {
        Self {
            bytes_per_instruction: 16,
        }
    }
}

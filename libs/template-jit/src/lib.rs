// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! A single-pass template compiler from decoded WebAssembly functions to
//! native code.
//!
//! Every instruction is translated to a fixed native sequence without any
//! register allocation or optimisation. The operand stack lives on the native
//! stack and structured control flow maps directly onto native jumps. See
//! [`VMContext`] for the contract between compiled code and the embedder.

#![cfg_attr(
    not(target_arch = "x86_64"),
    allow(dead_code, reason = "only the x86-64 backend exists so far")
)]

/// Declares functions with the calling convention compiled code uses for
/// calls out of the generated code.
macro_rules! jit_abi {
    ($($(#[$attr:meta])* $vis:vis fn $name:ident($($arg:ident: $ty:ty),* $(,)?) $(-> $ret:ty)? $body:block)*) => {
        $(
            #[cfg(target_arch = "x86_64")]
            $(#[$attr])* $vis extern "sysv64" fn $name($($arg: $ty),*) $(-> $ret)? $body
            #[cfg(not(target_arch = "x86_64"))]
            $(#[$attr])* $vis extern "C" fn $name($($arg: $ty),*) $(-> $ret)? $body
        )*
    };
}

mod builtins;
mod config;
mod control;
mod error;
mod trap;
mod vmctx;
#[cfg(target_arch = "x86_64")]
mod x86_64;

use code_memory::{CodeArena, CodeBlob};
use cranelift_entity::EntityRef;
use wasm_decode::{DefinedFuncIdx, FuncType, FunctionBody, Module};

pub use config::CompilerConfig;
pub use error::Error;
pub use trap::TrapKind;
pub use vmctx::{EntryFn, RuntimeCall, RuntimeCallFn, TrapHandlerFn, VMContext};
#[cfg(target_arch = "x86_64")]
pub use x86_64::X86_64Compiler;

/// A backend turning one function at a time into native code.
pub trait TemplateCompiler {
    /// Compiles `func` into a fresh region of `arena`.
    ///
    /// The returned blob is callable at its base address with the [`EntryFn`]
    /// signature once the caller has filled in a [`VMContext`]. The caller
    /// owns it and must eventually [`free`](CodeArena::free) it.
    ///
    /// # Errors
    ///
    /// Returns an error if the function uses an unsupported construct, is
    /// structurally invalid, or code memory could not be allocated. No code
    /// memory is leaked in that case.
    fn compile(&self, func: &Function<'_>, arena: &CodeArena) -> Result<CodeBlob, Error>;

    /// Compiles every function defined by `module`, in definition order.
    ///
    /// # Errors
    ///
    /// Stops at the first function that fails to compile and frees the blobs
    /// compiled so far.
    fn compile_module(&self, module: &Module, arena: &CodeArena) -> Result<Vec<CodeBlob>, Error> {
        let mut blobs = Vec::with_capacity(module.code().len());
        for idx in 0..module.code().len() {
            let result = Function::new(module, DefinedFuncIdx::new(idx))
                .ok_or_else(|| error::invalid(format!("function {idx} has no type")))
                .and_then(|func| self.compile(&func, arena));

            match result {
                Ok(blob) => blobs.push(blob),
                Err(err) => {
                    for blob in blobs {
                        arena.free(blob);
                    }
                    return Err(err);
                }
            }
        }
        Ok(blobs)
    }
}

/// Returns the backend for the architecture we're running on.
#[must_use]
pub fn host_compiler() -> Option<Box<dyn TemplateCompiler + Send + Sync>> {
    cfg_if::cfg_if! {
        if #[cfg(target_arch = "x86_64")] {
            Some(Box::new(X86_64Compiler::default()))
        } else {
            None
        }
    }
}

/// A function defined by a module, together with everything needed to
/// compile it.
#[derive(Debug, Clone, Copy)]
pub struct Function<'m> {
    module: &'m Module,
    index: DefinedFuncIdx,
    ty: &'m FuncType,
    body: &'m FunctionBody,
}

impl<'m> Function<'m> {
    /// Looks up the defined function `index`, `None` if it doesn't exist.
    #[must_use]
    pub fn new(module: &'m Module, index: DefinedFuncIdx) -> Option<Self> {
        Some(Self {
            module,
            index,
            ty: module.defined_func_type(index)?,
            body: module.code().get(index.index())?,
        })
    }

    #[must_use]
    pub fn module(&self) -> &'m Module {
        self.module
    }

    #[must_use]
    pub fn index(&self) -> DefinedFuncIdx {
        self.index
    }

    #[must_use]
    pub fn ty(&self) -> &'m FuncType {
        self.ty
    }

    #[must_use]
    pub fn body(&self) -> &'m FunctionBody {
        self.body
    }

    /// Total instruction count of the body, nested blocks included.
    #[must_use]
    pub fn instruction_count(&self) -> usize {
        self.body.body().instruction_count()
    }
}

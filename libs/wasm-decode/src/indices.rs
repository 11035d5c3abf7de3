// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::binary_reader::BinaryReader;
use cranelift_entity::entity_impl;

macro_rules! impl_read {
    ($name:ident, $read_fn_name:ident) => {
        impl BinaryReader<'_> {
            pub(crate) fn $read_fn_name(&mut self) -> crate::Result<$name> {
                Ok($name::from_u32(self.read_var_u32()?))
            }
        }
    };
}

/// Index into the type section.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TypeIdx(u32);
entity_impl!(TypeIdx, "type");
impl_read!(TypeIdx, read_type_idx);

/// Index into the function index space (imported functions first).
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FuncIdx(u32);
entity_impl!(FuncIdx, "func");
impl_read!(FuncIdx, read_func_idx);

/// Index of a function defined by the module, i.e. into the code section.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DefinedFuncIdx(u32);
entity_impl!(DefinedFuncIdx, "defined-func");

#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TableIdx(u32);
entity_impl!(TableIdx, "table");
impl_read!(TableIdx, read_table_idx);

#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MemIdx(u32);
entity_impl!(MemIdx, "memory");
impl_read!(MemIdx, read_mem_idx);

#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GlobalIdx(u32);
entity_impl!(GlobalIdx, "global");
impl_read!(GlobalIdx, read_global_idx);

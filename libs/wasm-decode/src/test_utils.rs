// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! A small binary encoder for writing test modules by hand.

#![allow(clippy::missing_panics_doc, reason = "test helpers")]

use crate::instructions::BlockType;
use crate::opcode::{Opcode, TRUNC_SAT_PREFIX, TruncSatOp};
use crate::types::{FuncType, GlobalType, Limits, Mutability, ValType};
use crate::module::{WASM_MAGIC_BYTES, WASM_VERSION};
use leb128::Leb128Write;

pub fn uleb(out: &mut Vec<u8>, val: u64) {
    out.write_uleb128(val).expect("writing to a Vec can't fail");
}

pub fn sleb(out: &mut Vec<u8>, val: i64) {
    out.write_sleb128(val).expect("writing to a Vec can't fail");
}

pub fn name(out: &mut Vec<u8>, name: &str) {
    uleb(out, name.len() as u64);
    out.extend_from_slice(name.as_bytes());
}

fn limits(out: &mut Vec<u8>, limits: Limits) {
    out.push(limits.tag());
    uleb(out, u64::from(limits.min));
    if let Some(max) = limits.max {
        uleb(out, u64::from(max));
    }
}

fn global_type(out: &mut Vec<u8>, ty: GlobalType) {
    out.push(ty.ty.as_byte());
    out.push(u8::from(ty.mutability == Mutability::Var));
}

fn vec_of<T>(items: &[T], mut f: impl FnMut(&mut Vec<u8>, &T)) -> Vec<u8> {
    let mut out = Vec::new();
    uleb(&mut out, items.len() as u64);
    for item in items {
        f(&mut out, item);
    }
    out
}

/// `i32.const offset; end`, the usual segment offset expression.
fn offset_expr(out: &mut Vec<u8>, offset: i32) {
    out.push(Opcode::I32Const.as_u8());
    sleb(out, i64::from(offset));
    out.push(Opcode::End.as_u8());
}

/// Builds a module binary section by section.
///
/// Sections are written in the order the methods are called, so tests can
/// produce out-of-order or duplicated sections on purpose.
pub struct ModuleBuilder {
    bytes: Vec<u8>,
}

impl Default for ModuleBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ModuleBuilder {
    pub fn new() -> Self {
        let mut bytes = WASM_MAGIC_BYTES.to_vec();
        bytes.extend_from_slice(&WASM_VERSION.to_le_bytes());
        Self { bytes }
    }

    #[must_use]
    pub fn raw_section(mut self, id: u8, payload: &[u8]) -> Self {
        self.bytes.push(id);
        uleb(&mut self.bytes, payload.len() as u64);
        self.bytes.extend_from_slice(payload);
        self
    }

    #[must_use]
    pub fn custom(self, section_name: &str, data: &[u8]) -> Self {
        let mut payload = Vec::new();
        name(&mut payload, section_name);
        payload.extend_from_slice(data);
        self.raw_section(0, &payload)
    }

    #[must_use]
    pub fn types(self, types: &[FuncType]) -> Self {
        let payload = vec_of(types, |out, ty| {
            out.push(0x60);
            uleb(out, ty.params().len() as u64);
            out.extend(ty.params().iter().map(|p| p.as_byte()));
            uleb(out, ty.results().len() as u64);
            out.extend(ty.results().iter().map(|r| r.as_byte()));
        });
        self.raw_section(1, &payload)
    }

    /// Function imports, each given as `(module, name, type index)`.
    #[must_use]
    pub fn func_imports(self, imports: &[(&str, &str, u32)]) -> Self {
        let payload = vec_of(imports, |out, (module, field, ty)| {
            name(out, module);
            name(out, field);
            out.push(0x00);
            uleb(out, u64::from(*ty));
        });
        self.raw_section(2, &payload)
    }

    #[must_use]
    pub fn functions(self, type_indices: &[u32]) -> Self {
        let payload = vec_of(type_indices, |out, ty| uleb(out, u64::from(*ty)));
        self.raw_section(3, &payload)
    }

    #[must_use]
    pub fn table(self, table_limits: Limits) -> Self {
        let payload = vec_of(&[table_limits], |out, l| {
            out.push(0x70);
            limits(out, *l);
        });
        self.raw_section(4, &payload)
    }

    #[must_use]
    pub fn memory(self, memory_limits: Limits) -> Self {
        let payload = vec_of(&[memory_limits], |out, l| limits(out, *l));
        self.raw_section(5, &payload)
    }

    /// Globals initialised with an `i64.const`/`i32.const` of `init`.
    #[must_use]
    pub fn globals(self, globals: &[(GlobalType, i64)]) -> Self {
        let payload = vec_of(globals, |out, (ty, init)| {
            global_type(out, *ty);
            match ty.ty {
                ValType::I64 => out.push(Opcode::I64Const.as_u8()),
                _ => out.push(Opcode::I32Const.as_u8()),
            }
            sleb(out, *init);
            out.push(Opcode::End.as_u8());
        });
        self.raw_section(6, &payload)
    }

    /// Exports, each given as `(name, kind, index)`.
    #[must_use]
    pub fn exports(self, exports: &[(&str, u8, u32)]) -> Self {
        let payload = vec_of(exports, |out, (export_name, kind, idx)| {
            name(out, export_name);
            out.push(*kind);
            uleb(out, u64::from(*idx));
        });
        self.raw_section(7, &payload)
    }

    #[must_use]
    pub fn start(self, func: u32) -> Self {
        let mut payload = Vec::new();
        uleb(&mut payload, u64::from(func));
        self.raw_section(8, &payload)
    }

    /// Active element segments for table 0, each given as
    /// `(offset, function indices)`.
    #[must_use]
    pub fn elements(self, segments: &[(i32, &[u32])]) -> Self {
        let payload = vec_of(segments, |out, (offset, funcs)| {
            uleb(out, 0);
            offset_expr(out, *offset);
            uleb(out, funcs.len() as u64);
            for func in *funcs {
                uleb(out, u64::from(*func));
            }
        });
        self.raw_section(9, &payload)
    }

    #[must_use]
    pub fn code(self, bodies: &[FuncBody]) -> Self {
        let payload = vec_of(bodies, |out, body| out.extend(body.encode()));
        self.raw_section(10, &payload)
    }

    /// Active data segments for memory 0, each given as `(offset, bytes)`.
    #[must_use]
    pub fn data(self, segments: &[(i32, &[u8])]) -> Self {
        let payload = vec_of(segments, |out, (offset, init)| {
            uleb(out, 0);
            offset_expr(out, *offset);
            uleb(out, init.len() as u64);
            out.extend_from_slice(init);
        });
        self.raw_section(11, &payload)
    }

    #[must_use]
    pub fn finish(self) -> Vec<u8> {
        self.bytes
    }
}

/// Builds the encoding of one function body.
#[derive(Debug, Clone, Default)]
pub struct FuncBody {
    locals: Vec<(u32, ValType)>,
    code: Vec<u8>,
}

impl FuncBody {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_locals(locals: &[(u32, ValType)]) -> Self {
        Self {
            locals: locals.to_vec(),
            code: Vec::new(),
        }
    }

    #[must_use]
    pub fn op(mut self, op: Opcode) -> Self {
        self.code.push(op.as_u8());
        self
    }

    #[must_use]
    pub fn ops(mut self, ops: &[Opcode]) -> Self {
        self.code.extend(ops.iter().map(|op| op.as_u8()));
        self
    }

    #[must_use]
    pub fn raw(mut self, bytes: &[u8]) -> Self {
        self.code.extend_from_slice(bytes);
        self
    }

    #[must_use]
    pub fn index(mut self, op: Opcode, index: u32) -> Self {
        self.code.push(op.as_u8());
        uleb(&mut self.code, u64::from(index));
        self
    }

    #[must_use]
    pub fn local_get(self, index: u32) -> Self {
        self.index(Opcode::LocalGet, index)
    }

    #[must_use]
    pub fn local_set(self, index: u32) -> Self {
        self.index(Opcode::LocalSet, index)
    }

    #[must_use]
    pub fn i32_const(mut self, val: i32) -> Self {
        self.code.push(Opcode::I32Const.as_u8());
        sleb(&mut self.code, i64::from(val));
        self
    }

    #[must_use]
    pub fn i64_const(mut self, val: i64) -> Self {
        self.code.push(Opcode::I64Const.as_u8());
        sleb(&mut self.code, val);
        self
    }

    #[must_use]
    pub fn f32_const(mut self, val: f32) -> Self {
        self.code.push(Opcode::F32Const.as_u8());
        self.code.extend_from_slice(&val.to_le_bytes());
        self
    }

    #[must_use]
    pub fn f64_const(mut self, val: f64) -> Self {
        self.code.push(Opcode::F64Const.as_u8());
        self.code.extend_from_slice(&val.to_le_bytes());
        self
    }

    /// Opens a `block`, `loop` or `if`.
    #[must_use]
    pub fn block(mut self, op: Opcode, ty: BlockType) -> Self {
        self.code.push(op.as_u8());
        match ty {
            BlockType::Empty => self.code.push(0x40),
            BlockType::Value(ty) => self.code.push(ty.as_byte()),
            BlockType::FuncType(idx) => sleb(&mut self.code, i64::from(idx.as_u32())),
        }
        self
    }

    #[must_use]
    pub fn memarg(mut self, op: Opcode, align: u32, offset: u32) -> Self {
        self.code.push(op.as_u8());
        uleb(&mut self.code, u64::from(align));
        uleb(&mut self.code, u64::from(offset));
        self
    }

    #[must_use]
    pub fn br_table(mut self, labels: &[u32], default: u32) -> Self {
        self.code.push(Opcode::BrTable.as_u8());
        uleb(&mut self.code, labels.len() as u64);
        for label in labels {
            uleb(&mut self.code, u64::from(*label));
        }
        uleb(&mut self.code, u64::from(default));
        self
    }

    #[must_use]
    pub fn call_indirect(mut self, ty: u32) -> Self {
        self.code.push(Opcode::CallIndirect.as_u8());
        uleb(&mut self.code, u64::from(ty));
        self.code.push(0x00);
        self
    }

    /// `memory.size` or `memory.grow` with their zero byte.
    #[must_use]
    pub fn memory_op(mut self, op: Opcode) -> Self {
        self.code.push(op.as_u8());
        self.code.push(0x00);
        self
    }

    #[must_use]
    pub fn trunc_sat(mut self, op: TruncSatOp) -> Self {
        self.code.push(TRUNC_SAT_PREFIX);
        uleb(&mut self.code, u64::from(op.selector()));
        self
    }

    #[must_use]
    pub fn end(self) -> Self {
        self.op(Opcode::End)
    }

    /// The size-prefixed body as it appears in the code section.
    pub fn encode(&self) -> Vec<u8> {
        let mut body = Vec::new();
        uleb(&mut body, self.locals.len() as u64);
        for (count, ty) in &self.locals {
            uleb(&mut body, u64::from(*count));
            body.push(ty.as_byte());
        }
        body.extend_from_slice(&self.code);

        let mut out = Vec::new();
        uleb(&mut out, body.len() as u64);
        out.extend(body);
        out
    }
}

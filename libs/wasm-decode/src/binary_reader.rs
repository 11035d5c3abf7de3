// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::error::{DecodeError, ErrorKind};
use crate::indices::{MemIdx, TableIdx};
use crate::instructions::{BlockType, Expr, Ieee32, Ieee64, Instruction, MemArg};
use crate::limits::{
    MAX_WASM_BR_TABLE_SIZE, MAX_WASM_FUNCTION_LOCALS, MAX_WASM_FUNCTION_PARAMS,
    MAX_WASM_FUNCTION_RETURNS, MAX_WASM_FUNCTION_SIZE, MAX_WASM_STRING_SIZE, ReaderConfig,
};
use crate::module::{
    CustomSection, Data, DataMode, Element, ElementMode, Export, ExportDesc, FunctionBody, Global,
    Import, ImportDesc, Locals,
};
use crate::opcode::{Opcode, TRUNC_SAT_PREFIX, TruncSatOp};
use crate::types::{
    FuncType, GlobalType, Limits, MemoryType, Mutability, RefType, TableType, ValType,
};
use leb128::Leb128Read;

/// A cursor over an immutable byte buffer.
///
/// Every read advances the cursor and fails as soon as the buffer runs out.
/// Errors carry the absolute offset into the original module binary, even for
/// readers created over a sub-slice with [`BinaryReader::sub_reader`].
#[derive(Clone)]
pub(crate) struct BinaryReader<'a> {
    bytes: &'a [u8],
    pos: usize,
    original_offset: usize,
    max_nesting_depth: usize,
}

impl<'a> BinaryReader<'a> {
    pub fn new(bytes: &'a [u8], original_offset: usize, config: &ReaderConfig) -> Self {
        Self {
            bytes,
            pos: 0,
            original_offset,
            max_nesting_depth: config.max_nesting_depth,
        }
    }

    /// Absolute offset of the cursor in the module binary.
    pub fn original_position(&self) -> usize {
        self.original_offset + self.pos
    }

    pub fn eof(&self) -> bool {
        self.pos >= self.bytes.len()
    }

    pub fn bytes_remaining(&self) -> usize {
        self.bytes.len() - self.pos
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn error(&self, kind: ErrorKind) -> DecodeError {
        DecodeError::new(kind, self.original_position())
    }

    pub fn error_at(kind: ErrorKind, offset: usize) -> DecodeError {
        DecodeError::new(kind, offset)
    }

    fn ensure_bytes(&self, len: usize) -> crate::Result<()> {
        if len > self.bytes_remaining() {
            Err(self.error(ErrorKind::UnexpectedEof))
        } else {
            Ok(())
        }
    }

    /// Splits off the next `len` bytes into a reader of their own.
    pub fn sub_reader(&mut self, len: usize) -> crate::Result<BinaryReader<'a>> {
        let original_offset = self.original_position();
        let bytes = self.read_bytes(len)?;
        Ok(BinaryReader {
            bytes,
            pos: 0,
            original_offset,
            max_nesting_depth: self.max_nesting_depth,
        })
    }

    pub fn read_u8(&mut self) -> crate::Result<u8> {
        self.ensure_bytes(1)?;
        let byte = self.bytes[self.pos];
        self.pos += 1;
        Ok(byte)
    }

    pub fn read_bytes(&mut self, len: usize) -> crate::Result<&'a [u8]> {
        self.ensure_bytes(len)?;
        let bytes = &self.bytes[self.pos..self.pos + len];
        self.pos += len;
        Ok(bytes)
    }

    pub fn read_array<const N: usize>(&mut self) -> crate::Result<[u8; N]> {
        let mut out = [0; N];
        out.copy_from_slice(self.read_bytes(N)?);
        Ok(out)
    }

    /// Fixed width little-endian `u32`, used by the module header.
    pub fn read_u32_le(&mut self) -> crate::Result<u32> {
        Ok(u32::from_le_bytes(self.read_array()?))
    }

    fn read_leb<T>(
        &mut self,
        f: impl FnOnce(&mut &'a [u8]) -> Result<T, leb128::Error>,
    ) -> crate::Result<T> {
        let start = self.original_position();
        let mut rest = &self.bytes[self.pos..];
        match f(&mut rest) {
            Ok(val) => {
                self.pos = self.bytes.len() - rest.len();
                Ok(val)
            }
            Err(err) => Err(Self::error_at(err.into(), start)),
        }
    }

    pub fn read_var_u32(&mut self) -> crate::Result<u32> {
        let start = self.original_position();
        let val = self.read_leb(|r| r.read_var_u(32))?;
        u32::try_from(val).map_err(|_| Self::error_at(ErrorKind::IntegerTooLarge, start))
    }

    pub fn read_var_s32(&mut self) -> crate::Result<i32> {
        let start = self.original_position();
        let val = self.read_leb(|r| r.read_var_s(32))?;
        i32::try_from(val).map_err(|_| Self::error_at(ErrorKind::IntegerTooLarge, start))
    }

    pub fn read_var_s33(&mut self) -> crate::Result<i64> {
        self.read_leb(|r| r.read_var_s(33))
    }

    pub fn read_var_s64(&mut self) -> crate::Result<i64> {
        self.read_leb(|r| r.read_var_s(64))
    }

    /// Reads a LEB128 `u32` length and converts it to `usize`.
    pub fn read_size(&mut self, limit: usize, what: &'static str) -> crate::Result<usize> {
        let start = self.original_position();
        let size = self.read_var_u32()? as usize;
        if size > limit {
            Err(Self::error_at(ErrorKind::TooMany(what, limit), start))
        } else {
            Ok(size)
        }
    }

    /// Reads a length-prefixed vector, calling `f` once per element.
    pub fn read_vec<T>(
        &mut self,
        limit: usize,
        what: &'static str,
        mut f: impl FnMut(&mut Self) -> crate::Result<T>,
    ) -> crate::Result<Vec<T>> {
        let count = self.read_size(limit, what)?;
        // every element occupies at least one byte
        let mut items = Vec::with_capacity(count.min(self.bytes_remaining()));
        for _ in 0..count {
            items.push(f(self)?);
        }
        Ok(items)
    }

    pub fn read_zero_byte(&mut self) -> crate::Result<()> {
        let offset = self.original_position();
        match self.read_u8()? {
            0 => Ok(()),
            _ => Err(Self::error_at(ErrorKind::ZeroByteExpected, offset)),
        }
    }

    pub fn read_name(&mut self) -> crate::Result<String> {
        let start = self.original_position();
        let len = self.read_var_u32()? as usize;
        if len > MAX_WASM_STRING_SIZE {
            return Err(Self::error_at(ErrorKind::StringTooLong, start));
        }

        let offset = self.original_position();
        let bytes = self.read_bytes(len)?;
        core::str::from_utf8(bytes)
            .map(ToOwned::to_owned)
            .map_err(|err| Self::error_at(ErrorKind::MalformedUtf8, offset + err.valid_up_to()))
    }

    pub fn read_f32(&mut self) -> crate::Result<Ieee32> {
        Ok(Ieee32(u32::from_le_bytes(self.read_array()?)))
    }

    pub fn read_f64(&mut self) -> crate::Result<Ieee64> {
        Ok(Ieee64(u64::from_le_bytes(self.read_array()?)))
    }

    pub fn read_val_type(&mut self) -> crate::Result<ValType> {
        let offset = self.original_position();
        let byte = self.read_u8()?;
        ValType::from_byte(byte)
            .ok_or_else(|| Self::error_at(ErrorKind::MalformedValType(byte), offset))
    }

    pub fn read_func_type(&mut self) -> crate::Result<FuncType> {
        let offset = self.original_position();
        let tag = self.read_u8()?;
        if tag != 0x60 {
            return Err(Self::error_at(ErrorKind::MalformedFuncTypeTag(tag), offset));
        }

        let params = self.read_vec(MAX_WASM_FUNCTION_PARAMS, "params", Self::read_val_type)?;
        let results = self.read_vec(MAX_WASM_FUNCTION_RETURNS, "results", Self::read_val_type)?;
        Ok(FuncType::new(params, results))
    }

    pub fn read_limits(&mut self) -> crate::Result<Limits> {
        let offset = self.original_position();
        let tag = self.read_u8()?;

        match tag {
            0x00 => Ok(Limits {
                min: self.read_var_u32()?,
                max: None,
            }),
            0x01 => Ok(Limits {
                min: self.read_var_u32()?,
                max: Some(self.read_var_u32()?),
            }),
            t => Err(Self::error_at(ErrorKind::MalformedLimits(t), offset)),
        }
    }

    pub fn read_ref_type(&mut self) -> crate::Result<RefType> {
        let offset = self.original_position();
        match self.read_u8()? {
            0x70 => Ok(RefType::FuncRef),
            t => Err(Self::error_at(ErrorKind::MalformedRefType(t), offset)),
        }
    }

    pub fn read_table_type(&mut self) -> crate::Result<TableType> {
        Ok(TableType {
            element: self.read_ref_type()?,
            limits: self.read_limits()?,
        })
    }

    pub fn read_memory_type(&mut self) -> crate::Result<MemoryType> {
        Ok(MemoryType {
            limits: self.read_limits()?,
        })
    }

    pub fn read_global_type(&mut self) -> crate::Result<GlobalType> {
        let ty = self.read_val_type()?;
        let offset = self.original_position();
        let mutability = match self.read_u8()? {
            0x00 => Mutability::Const,
            0x01 => Mutability::Var,
            t => return Err(Self::error_at(ErrorKind::MalformedMutability(t), offset)),
        };

        Ok(GlobalType { ty, mutability })
    }

    pub fn read_block_type(&mut self) -> crate::Result<BlockType> {
        let offset = self.original_position();
        let b = self.bytes.get(self.pos).copied();

        if b == Some(0x40) {
            self.pos += 1;
            return Ok(BlockType::Empty);
        }

        if let Some(ty) = b.and_then(ValType::from_byte) {
            self.pos += 1;
            return Ok(BlockType::Value(ty));
        }

        let idx = self.read_var_s33()?;
        u32::try_from(idx)
            .map(|idx| BlockType::FuncType(crate::TypeIdx::from_u32(idx)))
            .map_err(|_| Self::error_at(ErrorKind::MalformedBlockType(idx), offset))
    }

    pub fn read_memarg(&mut self) -> crate::Result<MemArg> {
        Ok(MemArg {
            align: self.read_var_u32()?,
            offset: self.read_var_u32()?,
        })
    }

    pub fn read_import(&mut self) -> crate::Result<Import> {
        let module = self.read_name()?;
        let name = self.read_name()?;
        let offset = self.original_position();

        let desc = match self.read_u8()? {
            0x00 => ImportDesc::Func(self.read_type_idx()?),
            0x01 => ImportDesc::Table(self.read_table_type()?),
            0x02 => ImportDesc::Memory(self.read_memory_type()?),
            0x03 => ImportDesc::Global(self.read_global_type()?),
            tag => return Err(Self::error_at(ErrorKind::MalformedImportKind(tag), offset)),
        };

        Ok(Import { module, name, desc })
    }

    pub fn read_export(&mut self) -> crate::Result<Export> {
        let name = self.read_name()?;
        let offset = self.original_position();

        let desc = match self.read_u8()? {
            0x00 => ExportDesc::Func(self.read_func_idx()?),
            0x01 => ExportDesc::Table(self.read_table_idx()?),
            0x02 => ExportDesc::Memory(self.read_mem_idx()?),
            0x03 => ExportDesc::Global(self.read_global_idx()?),
            tag => return Err(Self::error_at(ErrorKind::MalformedExportKind(tag), offset)),
        };

        Ok(Export { name, desc })
    }

    pub fn read_global(&mut self) -> crate::Result<Global> {
        let ty = self.read_global_type()?;
        let init = self.read_expr_until_end()?;

        Ok(Global { ty, init })
    }

    fn read_elem_kind(&mut self) -> crate::Result<()> {
        let offset = self.original_position();
        match self.read_u8()? {
            0x00 => Ok(()),
            kind => Err(Self::error_at(ErrorKind::MalformedElementKind(kind), offset)),
        }
    }

    pub fn read_element(&mut self) -> crate::Result<Element> {
        let offset = self.original_position();
        let flags = self.read_var_u32()?;

        let mode = match flags {
            0 => ElementMode::Active {
                table: TableIdx::from_u32(0),
                offset: self.read_expr_until_end()?,
            },
            1 => {
                self.read_elem_kind()?;
                ElementMode::Passive
            }
            2 => {
                let table = self.read_table_idx()?;
                let offset = self.read_expr_until_end()?;
                self.read_elem_kind()?;
                ElementMode::Active { table, offset }
            }
            3 => {
                self.read_elem_kind()?;
                ElementMode::Declarative
            }
            4..=7 => return Err(Self::error_at(ErrorKind::UnsupportedElementExprs, offset)),
            _ => return Err(Self::error_at(ErrorKind::MalformedElementFlags(flags), offset)),
        };

        let items = self.read_vec(
            crate::limits::MAX_WASM_TABLE_ENTRIES,
            "table entries",
            Self::read_func_idx,
        )?;

        Ok(Element { mode, items })
    }

    pub fn read_data(&mut self) -> crate::Result<Data> {
        let offset = self.original_position();
        let flags = self.read_var_u32()?;

        let mode = match flags {
            0 => DataMode::Active {
                memory: MemIdx::from_u32(0),
                offset: self.read_expr_until_end()?,
            },
            1 => DataMode::Passive,
            2 => DataMode::Active {
                memory: self.read_mem_idx()?,
                offset: self.read_expr_until_end()?,
            },
            _ => return Err(Self::error_at(ErrorKind::MalformedDataFlags(flags), offset)),
        };

        let len = self.read_var_u32()? as usize;
        let init = self.read_bytes(len)?.to_vec();

        Ok(Data { mode, init })
    }

    pub fn read_custom_section(&mut self) -> crate::Result<CustomSection> {
        let name = self.read_name()?;
        let data = self.read_bytes(self.bytes_remaining())?.to_vec();
        Ok(CustomSection { name, data })
    }

    /// Reads locals and code from a reader spanning exactly one body.
    fn read_sized_function_body(&mut self) -> crate::Result<FunctionBody> {
        let locals_offset = self.original_position();
        let mut total = 0u64;
        let locals = self.read_vec(MAX_WASM_FUNCTION_LOCALS, "locals", |r| {
            let count = r.read_var_u32()?;
            let ty = r.read_val_type()?;
            Ok(Locals { count, ty })
        })?;
        for l in &locals {
            total += u64::from(l.count);
            if total > MAX_WASM_FUNCTION_LOCALS as u64 {
                return Err(Self::error_at(ErrorKind::TooManyLocals, locals_offset));
            }
        }

        let body = self.read_expr_until_end()?;
        if !self.eof() {
            return Err(self.error(ErrorKind::FunctionBodySizeMismatch));
        }

        Ok(FunctionBody { locals, body })
    }

    pub fn read_function_body(&mut self) -> crate::Result<FunctionBody> {
        let offset = self.original_position();
        let size = self.read_var_u32()? as usize;
        if size > MAX_WASM_FUNCTION_SIZE {
            return Err(Self::error_at(ErrorKind::FunctionTooLarge, offset));
        }
        let mut reader = self.sub_reader(size)?;
        reader.read_sized_function_body().map_err(|err| {
            if *err.kind() == ErrorKind::UnexpectedEof {
                reader.error(ErrorKind::FunctionBodySizeMismatch)
            } else {
                err
            }
        })
    }

    /// Reads a top level instruction sequence, which must end with `end`.
    ///
    /// Used for function bodies and initializer expressions alike. Nested
    /// blocks are tracked on an explicit stack so adversarial nesting costs
    /// heap rather than native stack, bounded by `max_nesting_depth`.
    pub fn read_expr_until_end(&mut self) -> crate::Result<Expr> {
        let mut open: Vec<OpenBlock> = Vec::new();
        let mut instrs = Vec::new();

        loop {
            let offset = self.original_position();
            let instr = match self.read_operator()? {
                Operator::Open { op, ty } => {
                    if open.len() >= self.max_nesting_depth {
                        return Err(Self::error_at(ErrorKind::NestingTooDeep, offset));
                    }
                    open.push(OpenBlock {
                        op,
                        ty,
                        then: None,
                        outer: core::mem::take(&mut instrs),
                    });
                    continue;
                }
                Operator::Instr(instr) => instr,
            };

            let terminator = match &instr {
                Instruction::Plain(op) if op.is_terminator() => *op,
                _ => {
                    instrs.push(instr);
                    continue;
                }
            };
            instrs.push(instr);
            let body = Expr::new(core::mem::take(&mut instrs));

            let Some(mut block) = open.pop() else {
                if terminator == Opcode::Else {
                    return Err(self.error_before(ErrorKind::UnexpectedElse));
                }
                return Ok(body);
            };

            let closed = match (block.op, terminator, block.then.take()) {
                (Opcode::If, Opcode::Else, None) => {
                    // the else-arm sits at the same depth as the then-arm
                    block.then = Some(body);
                    open.push(block);
                    continue;
                }
                (Opcode::If, Opcode::End, then) => {
                    let (then, otherwise) = match then {
                        Some(then) => (then, Some(body)),
                        None => (body, None),
                    };
                    Instruction::If {
                        ty: block.ty,
                        then,
                        otherwise,
                    }
                }
                (op, Opcode::End, _) => Instruction::Block {
                    op,
                    ty: block.ty,
                    body,
                },
                _ => return Err(self.error_before(ErrorKind::UnexpectedElse)),
            };

            instrs = block.outer;
            instrs.push(closed);
        }
    }

    fn error_before(&self, kind: ErrorKind) -> DecodeError {
        Self::error_at(kind, self.original_position().saturating_sub(1))
    }

    /// Reads one instruction together with its immediates. Structured
    /// instructions only yield their header, the caller collects the body.
    fn read_operator(&mut self) -> crate::Result<Operator> {
        let offset = self.original_position();
        let byte = self.read_u8()?;

        if byte == TRUNC_SAT_PREFIX {
            let selector = self.read_var_u32()?;
            return TruncSatOp::from_selector(selector)
                .map(|op| Operator::Instr(Instruction::TruncSat(op)))
                .ok_or_else(|| {
                    Self::error_at(ErrorKind::UnknownPrefixedOpcode(byte, selector), offset)
                });
        }

        let op = Opcode::from_u8(byte)
            .ok_or_else(|| Self::error_at(ErrorKind::UnknownOpcode(byte), offset))?;

        let instr = match op {
            Opcode::Block | Opcode::Loop | Opcode::If => {
                return Ok(Operator::Open {
                    op,
                    ty: self.read_block_type()?,
                });
            }
            Opcode::BrTable => {
                let labels =
                    self.read_vec(MAX_WASM_BR_TABLE_SIZE, "br_table targets", Self::read_var_u32)?;
                let default = self.read_var_u32()?;
                Instruction::BrTable {
                    labels: labels.into_boxed_slice(),
                    default,
                }
            }
            Opcode::Br
            | Opcode::BrIf
            | Opcode::Call
            | Opcode::LocalGet
            | Opcode::LocalSet
            | Opcode::LocalTee
            | Opcode::GlobalGet
            | Opcode::GlobalSet => Instruction::Index {
                op,
                index: self.read_var_u32()?,
            },
            Opcode::CallIndirect => {
                let ty = self.read_type_idx()?;
                // table index, only table 0 exists
                self.read_zero_byte()?;
                Instruction::CallIndirect { ty }
            }
            Opcode::MemorySize | Opcode::MemoryGrow => {
                self.read_zero_byte()?;
                Instruction::Plain(op)
            }
            Opcode::I32Const => Instruction::I32Const(self.read_var_s32()?),
            Opcode::I64Const => Instruction::I64Const(self.read_var_s64()?),
            Opcode::F32Const => Instruction::F32Const(self.read_f32()?),
            Opcode::F64Const => Instruction::F64Const(self.read_f64()?),
            op if op.is_load() || op.is_store() => Instruction::Memory {
                op,
                memarg: self.read_memarg()?,
            },
            op => Instruction::Plain(op),
        };
        Ok(Operator::Instr(instr))
    }
}

enum Operator {
    /// `block`, `loop` or `if` with its block type.
    Open { op: Opcode, ty: BlockType },
    Instr(Instruction),
}

/// A structured instruction whose body is still being read.
struct OpenBlock {
    op: Opcode,
    ty: BlockType,
    /// The finished then-arm once an `if` has seen its `else`.
    then: Option<Expr>,
    /// Instructions of the enclosing sequence read before this block.
    outer: Vec<Instruction>,
}

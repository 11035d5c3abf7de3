// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::indices::TypeIdx;
use crate::opcode::{Opcode, TruncSatOp};
use crate::types::ValType;
use core::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BlockType {
    Empty,
    Value(ValType),
    FuncType(TypeIdx),
}

/// The immediate of a load or store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MemArg {
    /// Alignment hint as a power of two.
    pub align: u32,
    pub offset: u32,
}

impl MemArg {
    /// The alignment `op` has when the hint is omitted in the text format.
    #[must_use]
    pub fn natural_alignment(op: Opcode) -> Option<u32> {
        op.access_width().map(u32::trailing_zeros)
    }
}

/// Raw bit pattern of an `f32` constant.
///
/// Kept as bits so that NaN payloads survive decoding and comparisons are
/// bitwise.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct Ieee32(pub(crate) u32);

impl Ieee32 {
    #[must_use]
    pub const fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    #[must_use]
    pub const fn bits(self) -> u32 {
        self.0
    }

    #[must_use]
    pub fn as_f32(self) -> f32 {
        f32::from_bits(self.0)
    }
}

/// Raw bit pattern of an `f64` constant.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct Ieee64(pub(crate) u64);

impl Ieee64 {
    #[must_use]
    pub const fn from_bits(bits: u64) -> Self {
        Self(bits)
    }

    #[must_use]
    pub const fn bits(self) -> u64 {
        self.0
    }

    #[must_use]
    pub fn as_f64(self) -> f64 {
        f64::from_bits(self.0)
    }
}

/// A single decoded instruction.
///
/// Structured control instructions own their nested bodies, so a function
/// body is a tree rather than a flat opcode stream.
#[derive(Debug, Clone, PartialEq)]
pub enum Instruction {
    /// An instruction without immediates, including `end`, `else`,
    /// `memory.size` and `memory.grow`.
    Plain(Opcode),
    /// `br`, `br_if`, `call` and the local and global accessors.
    Index { op: Opcode, index: u32 },
    CallIndirect { ty: TypeIdx },
    I32Const(i32),
    I64Const(i64),
    F32Const(Ieee32),
    F64Const(Ieee64),
    Memory { op: Opcode, memarg: MemArg },
    TruncSat(TruncSatOp),
    /// `block` or `loop`, `body` ends with `end`.
    Block {
        op: Opcode,
        ty: BlockType,
        body: Expr,
    },
    /// `then` ends with `else` when `otherwise` is present and with `end`
    /// otherwise.
    If {
        ty: BlockType,
        then: Expr,
        otherwise: Option<Expr>,
    },
    BrTable { labels: Box<[u32]>, default: u32 },
}

impl Instruction {
    /// The leading opcode byte, `None` for prefixed instructions.
    #[must_use]
    pub fn opcode(&self) -> Option<Opcode> {
        Some(match self {
            Self::Plain(op) | Self::Index { op, .. } | Self::Memory { op, .. } | Self::Block { op, .. } => *op,
            Self::CallIndirect { .. } => Opcode::CallIndirect,
            Self::I32Const(_) => Opcode::I32Const,
            Self::I64Const(_) => Opcode::I64Const,
            Self::F32Const(_) => Opcode::F32Const,
            Self::F64Const(_) => Opcode::F64Const,
            Self::If { .. } => Opcode::If,
            Self::BrTable { .. } => Opcode::BrTable,
            Self::TruncSat(_) => return None,
        })
    }

    #[must_use]
    pub fn mnemonic(&self) -> &'static str {
        match self {
            Self::TruncSat(op) => op.mnemonic(),
            other => other.opcode().map_or("<unknown>", Opcode::mnemonic),
        }
    }

    #[must_use]
    pub fn is_terminator(&self) -> bool {
        matches!(self, Self::Plain(op) if op.is_terminator())
    }
}

/// An instruction sequence, always closed by its terminator (`end`, or `else`
/// for the then-arm of an `if`).
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Expr {
    instrs: Vec<Instruction>,
}

impl Expr {
    pub(crate) fn new(instrs: Vec<Instruction>) -> Self {
        debug_assert!(instrs.last().is_some_and(Instruction::is_terminator));
        Self { instrs }
    }

    #[must_use]
    pub fn instructions(&self) -> &[Instruction] {
        &self.instrs
    }

    pub fn iter(&self) -> core::slice::Iter<'_, Instruction> {
        self.instrs.iter()
    }

    /// The closing `end` or `else`.
    #[must_use]
    pub fn terminator(&self) -> Option<&Instruction> {
        self.instrs.last()
    }

    /// Number of instructions including those of nested bodies and every
    /// terminator.
    #[must_use]
    pub fn instruction_count(&self) -> usize {
        self.instrs
            .iter()
            .map(|instr| match instr {
                Instruction::Block { body, .. } => 1 + body.instruction_count(),
                Instruction::If {
                    then, otherwise, ..
                } => 1 + then.instruction_count() + otherwise.as_ref().map_or(0, Expr::instruction_count),
                _ => 1,
            })
            .sum()
    }

    fn fmt_nested(&self, f: &mut fmt::Formatter<'_>, depth: usize) -> fmt::Result {
        for instr in &self.instrs {
            // terminators are printed one level out, aligned with their opener
            let indent = if instr.is_terminator() { depth.saturating_sub(1) } else { depth };
            write!(f, "{:width$}", "", width = indent * 2)?;

            match instr {
                Instruction::Plain(op) => writeln!(f, "{op}")?,
                Instruction::Index { op, index } => writeln!(f, "{op} {index}")?,
                Instruction::CallIndirect { ty } => writeln!(f, "call_indirect (type {})", ty.as_u32())?,
                Instruction::I32Const(v) => writeln!(f, "i32.const {v}")?,
                Instruction::I64Const(v) => writeln!(f, "i64.const {v}")?,
                Instruction::F32Const(v) => writeln!(f, "f32.const {}", v.as_f32())?,
                Instruction::F64Const(v) => writeln!(f, "f64.const {}", v.as_f64())?,
                Instruction::Memory { op, memarg } => {
                    writeln!(f, "{op} offset={} align={}", memarg.offset, 1u64 << memarg.align.min(63))?;
                }
                Instruction::TruncSat(op) => writeln!(f, "{}", op.mnemonic())?,
                Instruction::Block { op, ty, body } => {
                    writeln!(f, "{op}{}", BlockTypeSuffix(*ty))?;
                    body.fmt_nested(f, depth + 1)?;
                }
                Instruction::If {
                    ty,
                    then,
                    otherwise,
                } => {
                    writeln!(f, "if{}", BlockTypeSuffix(*ty))?;
                    then.fmt_nested(f, depth + 1)?;
                    if let Some(otherwise) = otherwise {
                        otherwise.fmt_nested(f, depth + 1)?;
                    }
                }
                Instruction::BrTable { labels, default } => {
                    write!(f, "br_table")?;
                    for label in labels {
                        write!(f, " {label}")?;
                    }
                    writeln!(f, " {default}")?;
                }
            }
        }

        Ok(())
    }
}

impl<'a> IntoIterator for &'a Expr {
    type Item = &'a Instruction;
    type IntoIter = core::slice::Iter<'a, Instruction>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

/// Renders the sequence as indented text-format disassembly, one instruction
/// per line.
impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.fmt_nested(f, 1)
    }
}

struct BlockTypeSuffix(BlockType);

impl fmt::Display for BlockTypeSuffix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            BlockType::Empty => Ok(()),
            BlockType::Value(ty) => write!(f, " (result {ty})"),
            BlockType::FuncType(idx) => write!(f, " (type {})", idx.as_u32()),
        }
    }
}

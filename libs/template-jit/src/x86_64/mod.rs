// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The x86-64 backend.
//!
//! # Frame layout
//!
//! ```text
//!  rbp + 8      return address
//!  rbp          saved rbp
//!  rbp - 8      saved rbx
//!  rbp - 16     local 0
//!  ...          local n - 1, one 8-byte slot each (parameters first)
//!  ...          padding so rsp is 16-byte aligned with an empty operand stack
//!  rsp          top of the operand stack
//! ```
//!
//! Every wasm value occupies one 8-byte slot on the native stack. `rax`, `rcx`
//! and `rdx` are scratch registers, `rbx` holds the [`VMContext`] for the
//! whole function. Since the padding makes an empty operand stack aligned, the
//! stack is ready for a call whenever it holds an even number of values.
//!
//! [`VMContext`]: crate::VMContext

mod enc;

use crate::builtins::Builtin;
use crate::config::CompilerConfig;
use crate::control::{ControlStack, Frame, FrameKind, Label};
use crate::error::{Error, invalid};
use crate::trap::TrapKind;
use crate::vmctx::{
    FUNCTIONS, GLOBALS, MEMORY_BASE, MEMORY_LEN, RUNTIME_CALL, RuntimeCall, TRAP_CODE,
    TRAP_HANDLER,
};
use crate::{Function, TemplateCompiler};
use code_memory::{Assembler, CodeArena, CodeBlob};
use core::mem;
use enc::{Alu, Cc, Emit, Reg, Rm, Shift, Size, Sse, Unary, Xmm};
use wasm_decode::{
    BlockType, Expr, FuncIdx, GlobalIdx, Instruction, MemArg, Module, Mutability, Opcode,
    TruncSatOp, TypeIdx,
};

/// Prologue, epilogue and trap stubs, on top of the per-instruction estimate.
const FIXED_CODE_ESTIMATE: usize = 64;

/// Offset of local 0 from `rbp`.
const LOCALS_BASE: i32 = -16;

/// Compiles functions for the System V x86-64 ABI.
#[derive(Debug, Default, Clone)]
pub struct X86_64Compiler {
    config: CompilerConfig,
}

impl X86_64Compiler {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_config(config: CompilerConfig) -> Self {
        Self { config }
    }

    #[must_use]
    pub fn config(&self) -> &CompilerConfig {
        &self.config
    }
}

impl TemplateCompiler for X86_64Compiler {
    fn compile(&self, func: &Function<'_>, arena: &CodeArena) -> Result<CodeBlob, Error> {
        if func.ty().results().len() > 1 {
            return Err(Error::Unsupported("functions returning more than one value"));
        }

        let count = func.instruction_count();
        let size_hint = count
            .saturating_mul(self.config.bytes_per_instruction)
            .saturating_add(FIXED_CODE_ESTIMATE);

        let mut compiler = FuncCompiler::new(Assembler::new(arena, size_hint)?, func)?;
        compiler.compile_body(func.body().body())?;

        let len = compiler.asm.offset();
        let blob = compiler.asm.finish();
        log::debug!(
            "compiled {} ({count} instructions) into {len} bytes at {:p}",
            func.index(),
            blob.as_ptr()
        );

        Ok(blob)
    }
}

/// `8 * count` as an immediate or displacement.
fn slots(count: usize) -> Result<i32, Error> {
    count
        .checked_mul(8)
        .and_then(|bytes| i32::try_from(bytes).ok())
        .ok_or(Error::Unsupported("frame or index space too large"))
}

const fn float_size(double: bool) -> Size {
    if double { Size::S64 } else { Size::S32 }
}

const fn sign_mask(double: bool) -> u64 {
    if double { 1 << 63 } else { 1 << 31 }
}

#[derive(Debug, Copy, Clone)]
enum IntOp {
    Alu(Alu),
    Mul,
    Shift(Shift),
}

#[derive(Debug, Copy, Clone)]
enum FloatCmp {
    Eq,
    Ne,
    Lt,
    Gt,
    Le,
    Ge,
}

#[derive(Debug, Copy, Clone)]
enum Callee {
    /// An entry in [`VMContext::functions`](crate::VMContext::functions).
    Direct(i32),
    /// Already loaded into `rax`.
    InRax,
}

#[derive(Debug, Copy, Clone)]
enum TrapExit {
    /// The trap still needs to be reported to the trap handler.
    Raise,
    /// A callee already reported it, just return.
    Unwind,
}

struct FuncCompiler<'a, 'm> {
    asm: Assembler<'a>,
    module: &'m Module,
    num_params: usize,
    /// Parameters plus declared locals.
    num_locals: usize,
    results: usize,
    /// Bytes between the saved `rbx` and an empty operand stack.
    frame_size: i32,
    /// Current operand stack height in values.
    height: usize,
    /// Cleared after an unconditional transfer until the enclosing block ends.
    reachable: bool,
    control: ControlStack,
    /// Jumps to the stub of each trap kind, indexed by [`TrapKind::slot`].
    traps: [Vec<usize>; 8],
    indirect_failed: Vec<usize>,
    raise: Vec<usize>,
    unwind: Vec<usize>,
}

impl<'a, 'm> FuncCompiler<'a, 'm> {
    fn new(asm: Assembler<'a>, func: &Function<'m>) -> Result<Self, Error> {
        let num_params = func.ty().params().len();
        let num_locals = usize::try_from(func.body().num_locals())
            .ok()
            .and_then(|declared| declared.checked_add(num_params))
            .ok_or(Error::Unsupported("too many locals"))?;

        // rounded so that saved rbx plus the frame is a multiple of 16
        let frame_size = slots(num_locals | 1)?;
        // the deepest local and the frame bottom must be addressable
        slots(num_locals + 2)?;

        Ok(Self {
            asm,
            module: func.module(),
            num_params,
            num_locals,
            results: func.ty().results().len(),
            frame_size,
            height: 0,
            reachable: true,
            control: ControlStack::default(),
            traps: [const { Vec::new() }; 8],
            indirect_failed: Vec::new(),
            raise: Vec::new(),
            unwind: Vec::new(),
        })
    }

    fn compile_body(&mut self, body: &'m Expr) -> Result<(), Error> {
        self.prologue()?;

        self.control
            .push(Frame::new(FrameKind::Function, 0, self.results, 0));
        self.compile_expr(body)?;
        self.end_frame()?;

        if self.results == 1 {
            self.asm.load(Size::S64, Reg::Rax, Reg::Rsp, 0)?;
        } else {
            self.asm.alu_rr(Alu::Xor, Size::S32, Reg::Rax, Reg::Rax)?;
        }
        self.return_sequence()?;

        self.emit_stubs()
    }

    fn prologue(&mut self) -> Result<(), Error> {
        let num_params = self.num_params;
        self.asm.push(Reg::Rbp)?;
        self.asm.mov_rr(Size::S64, Reg::Rbp, Reg::Rsp)?;
        self.asm.push(Reg::Rbx)?;
        self.asm.mov_rr(Size::S64, Reg::Rbx, Reg::Rdi)?;
        self.asm
            .alu_ri(Alu::Sub, Size::S64, Rm::Reg(Reg::Rsp), self.frame_size)?;

        for i in 0..num_params {
            let disp = self.local_disp(i)?;
            self.asm.load(Size::S64, Reg::Rax, Reg::Rsi, slots(i)?)?;
            self.asm.store(Size::S64, Reg::Rbp, disp, Reg::Rax)?;
        }

        let declared = self.num_locals - num_params;
        if declared == 0 {
            return Ok(());
        }
        self.asm.alu_rr(Alu::Xor, Size::S32, Reg::Rax, Reg::Rax)?;
        if declared <= 4 {
            for i in num_params..self.num_locals {
                let disp = self.local_disp(i)?;
                self.asm.store(Size::S64, Reg::Rbp, disp, Reg::Rax)?;
            }
        } else {
            // the last local has the lowest address
            let lowest = self.local_disp(self.num_locals - 1)?;
            self.asm.lea(Reg::Rdi, Reg::Rbp, lowest)?;
            self.asm.mov_ri(Reg::Rcx, declared as u64)?;
            self.asm.rep_stosq()?;
        }
        Ok(())
    }

    fn return_sequence(&mut self) -> Result<(), Error> {
        self.asm.lea(Reg::Rsp, Reg::Rbp, -8)?;
        self.asm.pop(Reg::Rbx)?;
        self.asm.pop(Reg::Rbp)?;
        self.asm.ret()?;
        Ok(())
    }

    fn local_disp(&self, index: usize) -> Result<i32, Error> {
        LOCALS_BASE
            .checked_sub(slots(index)?)
            .ok_or(Error::Unsupported("too many locals"))
    }

    /// Compiles `expr` up to, but excluding, its terminator.
    fn compile_expr(&mut self, expr: &'m Expr) -> Result<(), Error> {
        for instr in expr {
            if instr.is_terminator() {
                break;
            }
            // nothing after an unconditional transfer can execute
            if self.reachable {
                self.instruction(instr)?;
            }
        }
        Ok(())
    }

    fn instruction(&mut self, instr: &'m Instruction) -> Result<(), Error> {
        match instr {
            Instruction::Plain(op) => self.plain(*op),
            Instruction::Index { op, index } => self.indexed(*op, *index),
            Instruction::CallIndirect { ty } => self.call_indirect(*ty),
            Instruction::I32Const(val) => self.constant(u64::from(val.cast_unsigned())),
            Instruction::I64Const(val) => self.constant(val.cast_unsigned()),
            Instruction::F32Const(val) => self.constant(u64::from(val.bits())),
            Instruction::F64Const(val) => self.constant(val.bits()),
            Instruction::Memory { op, memarg } if op.is_load() => self.load(*op, *memarg),
            Instruction::Memory { op, memarg } if op.is_store() => self.store(*op, *memarg),
            Instruction::Memory { op, .. } => Err(Error::BadOpcode(*op)),
            Instruction::TruncSat(op) => self.call_builtin(trunc_sat_builtin(*op), 1),
            Instruction::Block { op, ty, body } => self.block(*op, *ty, body),
            Instruction::If {
                ty,
                then,
                otherwise,
            } => self.if_else(*ty, then, otherwise.as_ref()),
            Instruction::BrTable { labels, default } => self.br_table(labels, *default),
        }
    }

    fn plain(&mut self, op: Opcode) -> Result<(), Error> {
        use Opcode as O;

        match op {
            O::Unreachable => {
                self.trap(TrapKind::UnreachableCodeReached)?;
                self.reachable = false;
            }
            O::Nop => {}
            O::Return => {
                let depth = self.control.outermost()?;
                self.branch(depth)?;
                self.reachable = false;
            }
            O::Drop => {
                self.pop_values(1)?;
                self.asm.alu_ri(Alu::Add, Size::S64, Rm::Reg(Reg::Rsp), 8)?;
            }
            O::Select => self.select()?,
            O::MemorySize => self.memory_size()?,
            O::MemoryGrow => self.memory_grow()?,

            O::I32Eqz => self.eqz(Size::S32)?,
            O::I32Eq => self.compare(Size::S32, Cc::E)?,
            O::I32Ne => self.compare(Size::S32, Cc::Ne)?,
            O::I32LtS => self.compare(Size::S32, Cc::L)?,
            O::I32LtU => self.compare(Size::S32, Cc::B)?,
            O::I32GtS => self.compare(Size::S32, Cc::G)?,
            O::I32GtU => self.compare(Size::S32, Cc::A)?,
            O::I32LeS => self.compare(Size::S32, Cc::Le)?,
            O::I32LeU => self.compare(Size::S32, Cc::Be)?,
            O::I32GeS => self.compare(Size::S32, Cc::Ge)?,
            O::I32GeU => self.compare(Size::S32, Cc::Ae)?,
            O::I64Eqz => self.eqz(Size::S64)?,
            O::I64Eq => self.compare(Size::S64, Cc::E)?,
            O::I64Ne => self.compare(Size::S64, Cc::Ne)?,
            O::I64LtS => self.compare(Size::S64, Cc::L)?,
            O::I64LtU => self.compare(Size::S64, Cc::B)?,
            O::I64GtS => self.compare(Size::S64, Cc::G)?,
            O::I64GtU => self.compare(Size::S64, Cc::A)?,
            O::I64LeS => self.compare(Size::S64, Cc::Le)?,
            O::I64LeU => self.compare(Size::S64, Cc::Be)?,
            O::I64GeS => self.compare(Size::S64, Cc::Ge)?,
            O::I64GeU => self.compare(Size::S64, Cc::Ae)?,

            O::F32Eq => self.float_compare(false, FloatCmp::Eq)?,
            O::F32Ne => self.float_compare(false, FloatCmp::Ne)?,
            O::F32Lt => self.float_compare(false, FloatCmp::Lt)?,
            O::F32Gt => self.float_compare(false, FloatCmp::Gt)?,
            O::F32Le => self.float_compare(false, FloatCmp::Le)?,
            O::F32Ge => self.float_compare(false, FloatCmp::Ge)?,
            O::F64Eq => self.float_compare(true, FloatCmp::Eq)?,
            O::F64Ne => self.float_compare(true, FloatCmp::Ne)?,
            O::F64Lt => self.float_compare(true, FloatCmp::Lt)?,
            O::F64Gt => self.float_compare(true, FloatCmp::Gt)?,
            O::F64Le => self.float_compare(true, FloatCmp::Le)?,
            O::F64Ge => self.float_compare(true, FloatCmp::Ge)?,

            O::I32Clz => self.call_builtin(Builtin::I32Clz, 1)?,
            O::I32Ctz => self.call_builtin(Builtin::I32Ctz, 1)?,
            O::I32Popcnt => self.call_builtin(Builtin::I32Popcnt, 1)?,
            O::I32Add => self.binop(Size::S32, IntOp::Alu(Alu::Add))?,
            O::I32Sub => self.binop(Size::S32, IntOp::Alu(Alu::Sub))?,
            O::I32Mul => self.binop(Size::S32, IntOp::Mul)?,
            O::I32DivS => self.division(Size::S32, true, false)?,
            O::I32DivU => self.division(Size::S32, false, false)?,
            O::I32RemS => self.division(Size::S32, true, true)?,
            O::I32RemU => self.division(Size::S32, false, true)?,
            O::I32And => self.binop(Size::S32, IntOp::Alu(Alu::And))?,
            O::I32Or => self.binop(Size::S32, IntOp::Alu(Alu::Or))?,
            O::I32Xor => self.binop(Size::S32, IntOp::Alu(Alu::Xor))?,
            O::I32Shl => self.binop(Size::S32, IntOp::Shift(Shift::Shl))?,
            O::I32ShrS => self.binop(Size::S32, IntOp::Shift(Shift::Sar))?,
            O::I32ShrU => self.binop(Size::S32, IntOp::Shift(Shift::Shr))?,
            O::I32Rotl => self.binop(Size::S32, IntOp::Shift(Shift::Rol))?,
            O::I32Rotr => self.binop(Size::S32, IntOp::Shift(Shift::Ror))?,

            O::I64Clz => self.call_builtin(Builtin::I64Clz, 1)?,
            O::I64Ctz => self.call_builtin(Builtin::I64Ctz, 1)?,
            O::I64Popcnt => self.call_builtin(Builtin::I64Popcnt, 1)?,
            O::I64Add => self.binop(Size::S64, IntOp::Alu(Alu::Add))?,
            O::I64Sub => self.binop(Size::S64, IntOp::Alu(Alu::Sub))?,
            O::I64Mul => self.binop(Size::S64, IntOp::Mul)?,
            O::I64DivS => self.division(Size::S64, true, false)?,
            O::I64DivU => self.division(Size::S64, false, false)?,
            O::I64RemS => self.division(Size::S64, true, true)?,
            O::I64RemU => self.division(Size::S64, false, true)?,
            O::I64And => self.binop(Size::S64, IntOp::Alu(Alu::And))?,
            O::I64Or => self.binop(Size::S64, IntOp::Alu(Alu::Or))?,
            O::I64Xor => self.binop(Size::S64, IntOp::Alu(Alu::Xor))?,
            O::I64Shl => self.binop(Size::S64, IntOp::Shift(Shift::Shl))?,
            O::I64ShrS => self.binop(Size::S64, IntOp::Shift(Shift::Sar))?,
            O::I64ShrU => self.binop(Size::S64, IntOp::Shift(Shift::Shr))?,
            O::I64Rotl => self.binop(Size::S64, IntOp::Shift(Shift::Rol))?,
            O::I64Rotr => self.binop(Size::S64, IntOp::Shift(Shift::Ror))?,

            O::F32Abs => self.float_abs(false)?,
            O::F32Neg => self.float_neg(false)?,
            O::F32Ceil => self.call_builtin(Builtin::F32Ceil, 1)?,
            O::F32Floor => self.call_builtin(Builtin::F32Floor, 1)?,
            O::F32Trunc => self.call_builtin(Builtin::F32Trunc, 1)?,
            O::F32Nearest => self.call_builtin(Builtin::F32Nearest, 1)?,
            O::F32Sqrt => self.float_sqrt(false)?,
            O::F32Add => self.float_binop(false, Sse::Add)?,
            O::F32Sub => self.float_binop(false, Sse::Sub)?,
            O::F32Mul => self.float_binop(false, Sse::Mul)?,
            O::F32Div => self.float_binop(false, Sse::Div)?,
            O::F32Min => self.call_builtin(Builtin::F32Min, 2)?,
            O::F32Max => self.call_builtin(Builtin::F32Max, 2)?,
            O::F32Copysign => self.copysign(false)?,
            O::F64Abs => self.float_abs(true)?,
            O::F64Neg => self.float_neg(true)?,
            O::F64Ceil => self.call_builtin(Builtin::F64Ceil, 1)?,
            O::F64Floor => self.call_builtin(Builtin::F64Floor, 1)?,
            O::F64Trunc => self.call_builtin(Builtin::F64Trunc, 1)?,
            O::F64Nearest => self.call_builtin(Builtin::F64Nearest, 1)?,
            O::F64Sqrt => self.float_sqrt(true)?,
            O::F64Add => self.float_binop(true, Sse::Add)?,
            O::F64Sub => self.float_binop(true, Sse::Sub)?,
            O::F64Mul => self.float_binop(true, Sse::Mul)?,
            O::F64Div => self.float_binop(true, Sse::Div)?,
            O::F64Min => self.call_builtin(Builtin::F64Min, 2)?,
            O::F64Max => self.call_builtin(Builtin::F64Max, 2)?,
            O::F64Copysign => self.copysign(true)?,

            O::I32WrapI64 => self.in_place(|asm| asm.mov_rr(Size::S32, Reg::Rax, Reg::Rax))?,
            O::I32TruncF32S => self.call_checked_builtin(Builtin::I32TruncF32S)?,
            O::I32TruncF32U => self.call_checked_builtin(Builtin::I32TruncF32U)?,
            O::I32TruncF64S => self.call_checked_builtin(Builtin::I32TruncF64S)?,
            O::I32TruncF64U => self.call_checked_builtin(Builtin::I32TruncF64U)?,
            O::I64ExtendI32S => self.in_place(|asm| asm.movsxd(Reg::Rax, Rm::Reg(Reg::Rax)))?,
            O::I64TruncF32S => self.call_checked_builtin(Builtin::I64TruncF32S)?,
            O::I64TruncF32U => self.call_checked_builtin(Builtin::I64TruncF32U)?,
            O::I64TruncF64S => self.call_checked_builtin(Builtin::I64TruncF64S)?,
            O::I64TruncF64U => self.call_checked_builtin(Builtin::I64TruncF64U)?,
            // unsigned i32s are zero extended, so the signed 64-bit conversion is exact
            O::F32ConvertI32S => self.int_to_float(false, Size::S32)?,
            O::F32ConvertI32U | O::F32ConvertI64S => self.int_to_float(false, Size::S64)?,
            O::F32ConvertI64U => self.call_builtin(Builtin::F32ConvertI64U, 1)?,
            O::F64ConvertI32S => self.int_to_float(true, Size::S32)?,
            O::F64ConvertI32U | O::F64ConvertI64S => self.int_to_float(true, Size::S64)?,
            O::F64ConvertI64U => self.call_builtin(Builtin::F64ConvertI64U, 1)?,
            O::F32DemoteF64 => self.in_place(|asm| {
                asm.movq_to_xmm(Size::S64, Xmm::Xmm0, Reg::Rax)?;
                asm.cvt_float(false, Xmm::Xmm0, Xmm::Xmm0)?;
                asm.movq_from_xmm(Size::S32, Reg::Rax, Xmm::Xmm0)
            })?,
            O::F64PromoteF32 => self.in_place(|asm| {
                asm.movq_to_xmm(Size::S32, Xmm::Xmm0, Reg::Rax)?;
                asm.cvt_float(true, Xmm::Xmm0, Xmm::Xmm0)?;
                asm.movq_from_xmm(Size::S64, Reg::Rax, Xmm::Xmm0)
            })?,
            // values are kept as raw bits with the upper half of 32-bit
            // values zeroed, so these don't change the slot
            O::I64ExtendI32U
            | O::I32ReinterpretF32
            | O::I64ReinterpretF64
            | O::F32ReinterpretI32
            | O::F64ReinterpretI64 => self.ensure_values(1)?,
            O::I32Extend8S => self.in_place(|asm| asm.movsx(8, Size::S32, Reg::Rax, Rm::Reg(Reg::Rax)))?,
            O::I32Extend16S => self.in_place(|asm| asm.movsx(16, Size::S32, Reg::Rax, Rm::Reg(Reg::Rax)))?,
            O::I64Extend8S => self.in_place(|asm| asm.movsx(8, Size::S64, Reg::Rax, Rm::Reg(Reg::Rax)))?,
            O::I64Extend16S => self.in_place(|asm| asm.movsx(16, Size::S64, Reg::Rax, Rm::Reg(Reg::Rax)))?,
            O::I64Extend32S => self.in_place(|asm| asm.movsxd(Reg::Rax, Rm::Reg(Reg::Rax)))?,

            _ => return Err(Error::BadOpcode(op)),
        }

        Ok(())
    }

    fn indexed(&mut self, op: Opcode, index: u32) -> Result<(), Error> {
        match op {
            Opcode::LocalGet => {
                let disp = self.local(index)?;
                self.asm.load(Size::S64, Reg::Rax, Reg::Rbp, disp)?;
                self.push_value(Reg::Rax)
            }
            Opcode::LocalSet => {
                let disp = self.local(index)?;
                self.pop_value(Reg::Rax)?;
                self.asm.store(Size::S64, Reg::Rbp, disp, Reg::Rax)?;
                Ok(())
            }
            Opcode::LocalTee => {
                let disp = self.local(index)?;
                self.ensure_values(1)?;
                self.asm.load(Size::S64, Reg::Rax, Reg::Rsp, 0)?;
                self.asm.store(Size::S64, Reg::Rbp, disp, Reg::Rax)?;
                Ok(())
            }
            Opcode::GlobalGet => {
                let disp = self.global(index, false)?;
                self.asm.load(Size::S64, Reg::Rax, Reg::Rbx, GLOBALS)?;
                self.asm.load(Size::S64, Reg::Rax, Reg::Rax, disp)?;
                self.push_value(Reg::Rax)
            }
            Opcode::GlobalSet => {
                let disp = self.global(index, true)?;
                self.pop_value(Reg::Rcx)?;
                self.asm.load(Size::S64, Reg::Rax, Reg::Rbx, GLOBALS)?;
                self.asm.store(Size::S64, Reg::Rax, disp, Reg::Rcx)?;
                Ok(())
            }
            Opcode::Br => {
                self.branch(index)?;
                self.reachable = false;
                Ok(())
            }
            Opcode::BrIf => {
                self.pop_value(Reg::Rax)?;
                self.asm.test_rr(Size::S32, Reg::Rax, Reg::Rax)?;
                if let Some(head) = self.plain_back_edge(index)? {
                    self.asm.jcc_back(Cc::Ne, head)?;
                    return Ok(());
                }
                let not_taken = self.asm.jcc_fixup(Cc::E)?;
                self.branch(index)?;
                self.asm.bind(not_taken);
                Ok(())
            }
            Opcode::Call => self.call(index),
            _ => Err(Error::BadOpcode(op)),
        }
    }

    // --- operand stack ---

    fn ensure_values(&self, count: usize) -> Result<(), Error> {
        let base = self.control.current()?.height;
        if self.height < base + count {
            return Err(invalid(format!(
                "operand stack underflow: need {count} values but the block holds {}",
                self.height.saturating_sub(base)
            )));
        }
        Ok(())
    }

    fn pop_values(&mut self, count: usize) -> Result<(), Error> {
        self.ensure_values(count)?;
        self.height -= count;
        Ok(())
    }

    fn pop_value(&mut self, reg: Reg) -> Result<(), Error> {
        self.pop_values(1)?;
        self.asm.pop(reg)?;
        Ok(())
    }

    fn push_value(&mut self, reg: Reg) -> Result<(), Error> {
        self.asm.push(reg)?;
        self.height += 1;
        Ok(())
    }

    fn constant(&mut self, bits: u64) -> Result<(), Error> {
        self.asm.mov_ri(Reg::Rax, bits)?;
        self.push_value(Reg::Rax)
    }

    /// Replaces the top value by running `f` on it in `rax`.
    fn in_place(
        &mut self,
        f: impl FnOnce(&mut Assembler<'a>) -> enc::EmitResult,
    ) -> Result<(), Error> {
        self.pop_value(Reg::Rax)?;
        f(&mut self.asm)?;
        self.push_value(Reg::Rax)
    }

    fn local(&self, index: u32) -> Result<i32, Error> {
        let index = usize::try_from(index)
            .ok()
            .filter(|index| *index < self.num_locals)
            .ok_or_else(|| {
                invalid(format!(
                    "local {index} out of range, the function has {} locals",
                    self.num_locals
                ))
            })?;
        self.local_disp(index)
    }

    fn global(&self, index: u32, write: bool) -> Result<i32, Error> {
        let ty = self
            .module
            .global_type(GlobalIdx::from_u32(index))
            .ok_or_else(|| invalid(format!("global {index} out of range")))?;
        if write && ty.mutability == Mutability::Const {
            return Err(invalid(format!("global {index} is immutable")));
        }
        slots(index as usize)
    }

    // --- calls ---

    /// Emits `sub rsp, 8` if the operand stack holds an odd number of values.
    fn align_for_call(&mut self) -> Result<bool, Error> {
        let misaligned = self.height % 2 == 1;
        if misaligned {
            self.asm.alu_ri(Alu::Sub, Size::S64, Rm::Reg(Reg::Rsp), 8)?;
        }
        Ok(misaligned)
    }

    fn undo_alignment(&mut self, misaligned: bool) -> Result<(), Error> {
        if misaligned {
            self.asm.alu_ri(Alu::Add, Size::S64, Rm::Reg(Reg::Rsp), 8)?;
        }
        Ok(())
    }

    fn check_trap(&mut self, exit: TrapExit) -> Result<(), Error> {
        self.asm
            .alu_ri(Alu::Cmp, Size::S32, Rm::Mem(Reg::Rbx, TRAP_CODE), 0)?;
        let fixup = self.asm.jcc_fixup(Cc::Ne)?;
        match exit {
            TrapExit::Raise => self.raise.push(fixup),
            TrapExit::Unwind => self.unwind.push(fixup),
        }
        Ok(())
    }

    fn call(&mut self, index: u32) -> Result<(), Error> {
        let ty = self
            .module
            .func_type(FuncIdx::from_u32(index))
            .ok_or_else(|| invalid(format!("call to unknown function {index}")))?;
        if ty.results().len() > 1 {
            return Err(Error::Unsupported("calls to functions returning more than one value"));
        }

        let disp = slots(index as usize)?;
        self.call_with_args(ty.params().len(), ty.results().len(), Callee::Direct(disp))
    }

    fn call_indirect(&mut self, ty: TypeIdx) -> Result<(), Error> {
        if !self.module.has_table() {
            return Err(invalid("call_indirect without a table"));
        }
        let sig = self
            .module
            .func_type_at(ty)
            .ok_or_else(|| invalid(format!("call_indirect with unknown type {ty}")))?;
        if sig.results().len() > 1 {
            return Err(Error::Unsupported("calls to functions returning more than one value"));
        }
        let (params, results) = (sig.params().len(), sig.results().len());

        self.pop_value(Reg::Rcx)?;
        self.ensure_values(params)?;

        // rax = runtime_call(vmctx, ResolveIndirect, type, element)
        self.asm.mov_ri(Reg::Rdx, u64::from(ty.as_u32()))?;
        self.asm
            .mov_ri(Reg::Rsi, u64::from(RuntimeCall::ResolveIndirect as u32))?;
        self.asm.mov_rr(Size::S64, Reg::Rdi, Reg::Rbx)?;
        let misaligned = self.align_for_call()?;
        self.asm.load(Size::S64, Reg::Rax, Reg::Rbx, RUNTIME_CALL)?;
        self.asm.call_r(Reg::Rax)?;
        self.undo_alignment(misaligned)?;

        self.asm.test_rr(Size::S64, Reg::Rax, Reg::Rax)?;
        let failed = self.asm.jcc_fixup(Cc::E)?;
        self.indirect_failed.push(failed);

        self.call_with_args(params, results, Callee::InRax)
    }

    /// Calls a compiled function with the top `params` values as arguments.
    ///
    /// The arguments are copied into a fresh array in declaration order,
    /// which also provides the padding needed to align the stack.
    fn call_with_args(&mut self, params: usize, results: usize, callee: Callee) -> Result<(), Error> {
        self.ensure_values(params)?;

        let pad = (self.height + params) % 2;
        let array = slots(params + pad)?;
        if array > 0 {
            self.asm.alu_ri(Alu::Sub, Size::S64, Rm::Reg(Reg::Rsp), array)?;
        }
        for i in 0..params {
            // argument `i` sits `params - 1 - i` slots below the old top
            let src = array + slots(params - 1 - i)?;
            self.asm.load(Size::S64, Reg::Rcx, Reg::Rsp, src)?;
            self.asm.store(Size::S64, Reg::Rsp, slots(i)?, Reg::Rcx)?;
        }

        if let Callee::Direct(disp) = callee {
            self.asm.load(Size::S64, Reg::Rax, Reg::Rbx, FUNCTIONS)?;
            self.asm.load(Size::S64, Reg::Rax, Reg::Rax, disp)?;
        }
        self.asm.mov_rr(Size::S64, Reg::Rsi, Reg::Rsp)?;
        self.asm.mov_rr(Size::S64, Reg::Rdi, Reg::Rbx)?;
        self.asm.call_r(Reg::Rax)?;

        let cleanup = slots(2 * params + pad)?;
        if cleanup > 0 {
            self.asm.alu_ri(Alu::Add, Size::S64, Rm::Reg(Reg::Rsp), cleanup)?;
        }
        self.pop_values(params)?;

        self.check_trap(TrapExit::Unwind)?;
        if results == 1 {
            self.push_value(Reg::Rax)?;
        }
        Ok(())
    }

    /// Calls `builtin` with the top `arity` values (one or two) and pushes
    /// its result.
    fn call_builtin(&mut self, builtin: Builtin, arity: usize) -> Result<(), Error> {
        if arity == 2 {
            self.pop_value(Reg::Rsi)?;
        }
        self.pop_value(Reg::Rdi)?;
        self.call_address(builtin)?;
        self.push_value(Reg::Rax)
    }

    /// Like [`Self::call_builtin`] for builtins that may trap. They take the
    /// context first and the operand second.
    fn call_checked_builtin(&mut self, builtin: Builtin) -> Result<(), Error> {
        self.pop_value(Reg::Rsi)?;
        self.asm.mov_rr(Size::S64, Reg::Rdi, Reg::Rbx)?;
        self.call_address(builtin)?;
        self.check_trap(TrapExit::Raise)?;
        self.push_value(Reg::Rax)
    }

    fn call_address(&mut self, builtin: Builtin) -> Result<(), Error> {
        log::trace!("call to builtin {}", builtin.name());
        let misaligned = self.align_for_call()?;
        self.asm.mov_ri(Reg::Rax, builtin.address() as u64)?;
        self.asm.call_r(Reg::Rax)?;
        self.undo_alignment(misaligned)
    }

    // --- memory ---

    fn require_memory(&self) -> Result<(), Error> {
        if self.module.has_memory() {
            Ok(())
        } else {
            Err(invalid("memory instruction without a memory"))
        }
    }

    /// Turns the wasm address in `rax` into a host address in `rdx`, trapping
    /// if `width` bytes at `offset` past it are out of bounds.
    fn effective_address(&mut self, width: u32, offset: u32) -> Result<(), Error> {
        // all of this is 64-bit so the sum of two u32s can't wrap
        self.asm.mov_ri(Reg::Rdx, u64::from(offset))?;
        self.asm.alu_rr(Alu::Add, Size::S64, Reg::Rdx, Reg::Rax)?;
        self.asm.lea(Reg::Rsi, Reg::Rdx, width.cast_signed())?;
        self.asm
            .alu_rm(Alu::Cmp, Size::S64, Reg::Rsi, Reg::Rbx, MEMORY_LEN)?;
        self.trap_if(Cc::A, TrapKind::MemoryOutOfBounds)?;
        self.asm
            .alu_rm(Alu::Add, Size::S64, Reg::Rdx, Reg::Rbx, MEMORY_BASE)?;
        Ok(())
    }

    fn load(&mut self, op: Opcode, memarg: MemArg) -> Result<(), Error> {
        let width = op.access_width().ok_or(Error::BadOpcode(op))?;
        self.require_memory()?;

        self.pop_value(Reg::Rax)?;
        self.effective_address(width, memarg.offset)?;

        let src = Rm::Mem(Reg::Rdx, 0);
        match op {
            Opcode::I32Load | Opcode::F32Load | Opcode::I64Load32U => {
                self.asm.load(Size::S32, Reg::Rax, Reg::Rdx, 0)?;
            }
            Opcode::I64Load | Opcode::F64Load => self.asm.load(Size::S64, Reg::Rax, Reg::Rdx, 0)?,
            Opcode::I32Load8S => self.asm.movsx(8, Size::S32, Reg::Rax, src)?,
            Opcode::I32Load16S => self.asm.movsx(16, Size::S32, Reg::Rax, src)?,
            Opcode::I64Load8S => self.asm.movsx(8, Size::S64, Reg::Rax, src)?,
            Opcode::I64Load16S => self.asm.movsx(16, Size::S64, Reg::Rax, src)?,
            Opcode::I32Load8U | Opcode::I64Load8U => self.asm.movzx(8, Reg::Rax, src)?,
            Opcode::I32Load16U | Opcode::I64Load16U => self.asm.movzx(16, Reg::Rax, src)?,
            Opcode::I64Load32S => self.asm.movsxd(Reg::Rax, src)?,
            _ => return Err(Error::BadOpcode(op)),
        }

        self.push_value(Reg::Rax)
    }

    fn store(&mut self, op: Opcode, memarg: MemArg) -> Result<(), Error> {
        let width = op.access_width().ok_or(Error::BadOpcode(op))?;
        self.require_memory()?;

        self.pop_value(Reg::Rcx)?;
        self.pop_value(Reg::Rax)?;
        self.effective_address(width, memarg.offset)?;

        match op {
            Opcode::I32Store | Opcode::F32Store | Opcode::I64Store32 => {
                self.asm.store(Size::S32, Reg::Rdx, 0, Reg::Rcx)?;
            }
            Opcode::I64Store | Opcode::F64Store => {
                self.asm.store(Size::S64, Reg::Rdx, 0, Reg::Rcx)?;
            }
            Opcode::I32Store8 | Opcode::I64Store8 => self.asm.store8(Reg::Rdx, 0, Reg::Rcx)?,
            Opcode::I32Store16 | Opcode::I64Store16 => self.asm.store16(Reg::Rdx, 0, Reg::Rcx)?,
            _ => return Err(Error::BadOpcode(op)),
        }
        Ok(())
    }

    fn memory_size(&mut self) -> Result<(), Error> {
        self.require_memory()?;
        self.asm.load(Size::S64, Reg::Rax, Reg::Rbx, MEMORY_LEN)?;
        self.asm.shift_imm(Shift::Shr, Size::S64, Reg::Rax, 16)?;
        self.push_value(Reg::Rax)
    }

    fn memory_grow(&mut self) -> Result<(), Error> {
        self.require_memory()?;

        // rax = runtime_call(vmctx, MemoryGrow, delta, 0)
        self.pop_value(Reg::Rdx)?;
        self.asm.mov_rr(Size::S64, Reg::Rdi, Reg::Rbx)?;
        self.asm
            .mov_ri(Reg::Rsi, u64::from(RuntimeCall::MemoryGrow as u32))?;
        self.asm.alu_rr(Alu::Xor, Size::S32, Reg::Rcx, Reg::Rcx)?;
        let misaligned = self.align_for_call()?;
        self.asm.load(Size::S64, Reg::Rax, Reg::Rbx, RUNTIME_CALL)?;
        self.asm.call_r(Reg::Rax)?;
        self.undo_alignment(misaligned)?;

        self.asm.mov_rr(Size::S32, Reg::Rax, Reg::Rax)?;
        self.push_value(Reg::Rax)
    }

    // --- numeric ---

    fn binop(&mut self, size: Size, op: IntOp) -> Result<(), Error> {
        self.pop_value(Reg::Rcx)?;
        self.pop_value(Reg::Rax)?;
        match op {
            IntOp::Alu(alu) => self.asm.alu_rr(alu, size, Reg::Rax, Reg::Rcx)?,
            IntOp::Mul => self.asm.imul_rr(size, Reg::Rax, Reg::Rcx)?,
            // x86 masks the count the same way wasm does
            IntOp::Shift(shift) => self.asm.shift_cl(shift, size, Reg::Rax)?,
        }
        self.push_value(Reg::Rax)
    }

    fn division(&mut self, size: Size, signed: bool, remainder: bool) -> Result<(), Error> {
        self.pop_value(Reg::Rcx)?;
        self.pop_value(Reg::Rax)?;

        self.asm.test_rr(size, Reg::Rcx, Reg::Rcx)?;
        self.trap_if(Cc::E, TrapKind::IntegerDivisionByZero)?;

        let mut done = None;
        if signed {
            // MIN / -1 overflows and faults in idiv
            self.asm.alu_ri(Alu::Cmp, size, Rm::Reg(Reg::Rcx), -1)?;
            let regular = self.asm.jcc_fixup(Cc::Ne)?;
            if remainder {
                self.asm.alu_rr(Alu::Xor, Size::S32, Reg::Rax, Reg::Rax)?;
                done = Some(self.asm.jmp_fixup()?);
            } else {
                match size {
                    Size::S32 => self.asm.alu_ri(Alu::Cmp, Size::S32, Rm::Reg(Reg::Rax), i32::MIN)?,
                    Size::S64 => {
                        self.asm.mov_ri(Reg::Rdx, i64::MIN.cast_unsigned())?;
                        self.asm.alu_rr(Alu::Cmp, Size::S64, Reg::Rax, Reg::Rdx)?;
                    }
                }
                self.trap_if(Cc::E, TrapKind::IntegerOverflow)?;
            }
            self.asm.bind(regular);
            self.asm.sign_extend_rax(size)?;
            self.asm.unary(Unary::Idiv, size, Reg::Rcx)?;
        } else {
            self.asm.alu_rr(Alu::Xor, Size::S32, Reg::Rdx, Reg::Rdx)?;
            self.asm.unary(Unary::Div, size, Reg::Rcx)?;
        }

        if remainder {
            self.asm.mov_rr(size, Reg::Rax, Reg::Rdx)?;
        }
        if let Some(done) = done {
            self.asm.bind(done);
        }
        self.push_value(Reg::Rax)
    }

    fn eqz(&mut self, size: Size) -> Result<(), Error> {
        self.pop_value(Reg::Rax)?;
        self.asm.test_rr(size, Reg::Rax, Reg::Rax)?;
        self.asm.setcc(Cc::E, Reg::Rax)?;
        self.asm.movzx(8, Reg::Rax, Rm::Reg(Reg::Rax))?;
        self.push_value(Reg::Rax)
    }

    fn compare(&mut self, size: Size, cc: Cc) -> Result<(), Error> {
        self.pop_value(Reg::Rcx)?;
        self.pop_value(Reg::Rax)?;
        self.asm.alu_rr(Alu::Cmp, size, Reg::Rax, Reg::Rcx)?;
        self.asm.setcc(cc, Reg::Rax)?;
        self.asm.movzx(8, Reg::Rax, Rm::Reg(Reg::Rax))?;
        self.push_value(Reg::Rax)
    }

    /// Pops two floats into `xmm0` (lhs) and `xmm1` (rhs).
    fn pop_float_operands(&mut self, double: bool) -> Result<(), Error> {
        self.pop_value(Reg::Rcx)?;
        self.pop_value(Reg::Rax)?;
        self.asm.movq_to_xmm(float_size(double), Xmm::Xmm0, Reg::Rax)?;
        self.asm.movq_to_xmm(float_size(double), Xmm::Xmm1, Reg::Rcx)?;
        Ok(())
    }

    fn float_binop(&mut self, double: bool, op: Sse) -> Result<(), Error> {
        self.pop_float_operands(double)?;
        self.asm.sse(op, double, Xmm::Xmm0, Xmm::Xmm1)?;
        self.asm.movq_from_xmm(float_size(double), Reg::Rax, Xmm::Xmm0)?;
        self.push_value(Reg::Rax)
    }

    fn float_sqrt(&mut self, double: bool) -> Result<(), Error> {
        self.in_place(|asm| {
            asm.movq_to_xmm(float_size(double), Xmm::Xmm0, Reg::Rax)?;
            asm.sse(Sse::Sqrt, double, Xmm::Xmm0, Xmm::Xmm0)?;
            asm.movq_from_xmm(float_size(double), Reg::Rax, Xmm::Xmm0)
        })
    }

    fn float_compare(&mut self, double: bool, cmp: FloatCmp) -> Result<(), Error> {
        self.pop_float_operands(double)?;

        // unordered operands set ZF, PF and CF, so `a`/`ae` are false for NaN
        match cmp {
            FloatCmp::Eq | FloatCmp::Ne => {
                let (ordered, parity) = if matches!(cmp, FloatCmp::Eq) {
                    (Cc::E, Cc::Np)
                } else {
                    (Cc::Ne, Cc::P)
                };
                let combine = if matches!(cmp, FloatCmp::Eq) { Alu::And } else { Alu::Or };
                self.asm.ucomis(double, Xmm::Xmm0, Xmm::Xmm1)?;
                self.asm.setcc(ordered, Reg::Rax)?;
                self.asm.setcc(parity, Reg::Rcx)?;
                self.asm.movzx(8, Reg::Rax, Rm::Reg(Reg::Rax))?;
                self.asm.movzx(8, Reg::Rcx, Rm::Reg(Reg::Rcx))?;
                self.asm.alu_rr(combine, Size::S32, Reg::Rax, Reg::Rcx)?;
            }
            FloatCmp::Lt | FloatCmp::Le => {
                self.asm.ucomis(double, Xmm::Xmm1, Xmm::Xmm0)?;
                let cc = if matches!(cmp, FloatCmp::Lt) { Cc::A } else { Cc::Ae };
                self.asm.setcc(cc, Reg::Rax)?;
                self.asm.movzx(8, Reg::Rax, Rm::Reg(Reg::Rax))?;
            }
            FloatCmp::Gt | FloatCmp::Ge => {
                self.asm.ucomis(double, Xmm::Xmm0, Xmm::Xmm1)?;
                let cc = if matches!(cmp, FloatCmp::Gt) { Cc::A } else { Cc::Ae };
                self.asm.setcc(cc, Reg::Rax)?;
                self.asm.movzx(8, Reg::Rax, Rm::Reg(Reg::Rax))?;
            }
        }

        self.push_value(Reg::Rax)
    }

    fn float_neg(&mut self, double: bool) -> Result<(), Error> {
        self.in_place(|asm| {
            asm.mov_ri(Reg::Rcx, sign_mask(double))?;
            asm.alu_rr(Alu::Xor, Size::S64, Reg::Rax, Reg::Rcx)
        })
    }

    fn float_abs(&mut self, double: bool) -> Result<(), Error> {
        let magnitude = sign_mask(double) - 1;
        self.in_place(|asm| {
            asm.mov_ri(Reg::Rcx, magnitude)?;
            asm.alu_rr(Alu::And, Size::S64, Reg::Rax, Reg::Rcx)
        })
    }

    fn copysign(&mut self, double: bool) -> Result<(), Error> {
        let sign = sign_mask(double);
        self.pop_value(Reg::Rcx)?;
        self.pop_value(Reg::Rax)?;
        self.asm.mov_ri(Reg::Rdx, sign - 1)?;
        self.asm.alu_rr(Alu::And, Size::S64, Reg::Rax, Reg::Rdx)?;
        self.asm.mov_ri(Reg::Rdx, sign)?;
        self.asm.alu_rr(Alu::And, Size::S64, Reg::Rcx, Reg::Rdx)?;
        self.asm.alu_rr(Alu::Or, Size::S64, Reg::Rax, Reg::Rcx)?;
        self.push_value(Reg::Rax)
    }

    fn int_to_float(&mut self, double: bool, src: Size) -> Result<(), Error> {
        self.in_place(|asm| {
            asm.cvt_int_to_float(double, src, Xmm::Xmm0, Reg::Rax)?;
            asm.movq_from_xmm(float_size(double), Reg::Rax, Xmm::Xmm0)
        })
    }

    fn select(&mut self) -> Result<(), Error> {
        self.pop_value(Reg::Rcx)?;
        self.pop_value(Reg::Rdx)?;
        self.pop_value(Reg::Rax)?;
        self.asm.test_rr(Size::S32, Reg::Rcx, Reg::Rcx)?;
        self.asm.cmov(Cc::E, Size::S64, Reg::Rax, Reg::Rdx)?;
        self.push_value(Reg::Rax)
    }

    // --- control flow ---

    fn block_signature(&self, ty: BlockType) -> Result<(usize, usize), Error> {
        self.module
            .block_signature(ty)
            .map(|(params, results)| (params.len(), results.len()))
            .ok_or_else(|| invalid(format!("unknown block type {ty:?}")))
    }

    fn block(&mut self, op: Opcode, ty: BlockType, body: &'m Expr) -> Result<(), Error> {
        let (params, results) = self.block_signature(ty)?;
        self.ensure_values(params)?;
        let height = self.height - params;

        let frame = match op {
            Opcode::Block => Frame::new(FrameKind::Block, params, results, height),
            Opcode::Loop => Frame::new_loop(params, results, height, self.asm.offset()),
            _ => return Err(Error::BadOpcode(op)),
        };
        self.control.push(frame);
        self.compile_expr(body)?;
        self.end_frame()?;
        Ok(())
    }

    fn if_else(
        &mut self,
        ty: BlockType,
        then: &'m Expr,
        otherwise: Option<&'m Expr>,
    ) -> Result<(), Error> {
        let (params, results) = self.block_signature(ty)?;
        if otherwise.is_none() && params != results {
            return Err(invalid(
                "`if` without `else` must produce the values it consumes",
            ));
        }

        self.pop_value(Reg::Rax)?;
        self.ensure_values(params)?;
        self.asm.test_rr(Size::S32, Reg::Rax, Reg::Rax)?;
        let else_fixup = self.asm.jcc_fixup(Cc::E)?;

        let mut frame = Frame::new(FrameKind::If, params, results, self.height - params);
        frame.else_fixup = Some(else_fixup);
        self.control.push(frame);
        self.compile_expr(then)?;

        if let Some(otherwise) = otherwise {
            if self.reachable {
                self.check_block_end()?;
                let to_end = self.asm.jmp_fixup()?;
                if let Label::Forward(fixups) = &mut self.control.current_mut()?.label {
                    fixups.push(to_end);
                }
            }

            let frame = self.control.current_mut()?;
            if let Some(fixup) = frame.else_fixup.take() {
                self.asm.bind(fixup);
            }
            self.height = frame.height + frame.params;
            self.reachable = true;
            self.compile_expr(otherwise)?;
        }

        self.end_frame()?;
        Ok(())
    }

    fn check_block_end(&self) -> Result<(), Error> {
        let frame = self.control.current()?;
        let expected = frame.height + frame.results;
        if self.height != expected {
            return Err(invalid(format!(
                "{:?} block ends with {} values, expected {}",
                frame.kind,
                self.height.saturating_sub(frame.height),
                frame.results
            )));
        }
        Ok(())
    }

    fn end_frame(&mut self) -> Result<(), Error> {
        if self.reachable {
            self.check_block_end()?;
        }

        let frame = self.control.pop()?;
        if let Some(fixup) = frame.else_fixup {
            self.asm.bind(fixup);
        }
        if let Label::Forward(fixups) = &frame.label {
            for fixup in fixups {
                self.asm.bind(*fixup);
            }
        }

        self.height = frame.height + frame.results;
        self.reachable = true;
        log::trace!(
            "end {:?} at {:#x}, height {}",
            frame.kind,
            self.asm.offset(),
            self.height
        );
        Ok(())
    }

    /// Jumps to the label `depth` frames out, carrying its branch values.
    ///
    /// The compile-time height is left alone since the fall-through path of a
    /// conditional branch still sees the full stack.
    fn branch(&mut self, depth: u32) -> Result<(), Error> {
        let (arity, target, head) = {
            let frame = self.control.resolve(depth)?;
            let head = match frame.label {
                Label::Bound(head) => Some(head),
                Label::Forward(_) => None,
            };
            (frame.branch_arity(), frame.height, head)
        };
        self.ensure_values(arity)?;

        // slide the branch values down over everything the target discards
        let discard = self.height - arity - target;
        if discard > 0 {
            let gap = slots(discard)?;
            for i in (0..arity).rev() {
                self.asm.load(Size::S64, Reg::Rax, Reg::Rsp, slots(i)?)?;
                self.asm
                    .store(Size::S64, Reg::Rsp, slots(i + discard)?, Reg::Rax)?;
            }
            self.asm.alu_ri(Alu::Add, Size::S64, Rm::Reg(Reg::Rsp), gap)?;
        }

        match head {
            Some(head) => self.asm.jmp_back(head)?,
            None => {
                let fixup = self.asm.jmp_fixup()?;
                if let Label::Forward(fixups) = &mut self.control.resolve(depth)?.label {
                    fixups.push(fixup);
                }
            }
        }
        Ok(())
    }

    /// The loop head a branch to `depth` can jump to without moving any
    /// values, if there is one.
    fn plain_back_edge(&mut self, depth: u32) -> Result<Option<usize>, Error> {
        let frame = self.control.resolve(depth)?;
        let (arity, target) = (frame.branch_arity(), frame.height);
        let Label::Bound(head) = frame.label else {
            return Ok(None);
        };
        self.ensure_values(arity)?;
        Ok((self.height - arity == target).then_some(head))
    }

    fn br_table(&mut self, labels: &[u32], default: u32) -> Result<(), Error> {
        self.pop_value(Reg::Rcx)?;
        for (i, label) in labels.iter().enumerate() {
            let i = i32::try_from(i).map_err(|_| Error::Unsupported("br_table too large"))?;
            self.asm.alu_ri(Alu::Cmp, Size::S32, Rm::Reg(Reg::Rcx), i)?;
            let next = self.asm.jcc_fixup(Cc::Ne)?;
            self.branch(*label)?;
            self.asm.bind(next);
        }
        self.branch(default)?;
        self.reachable = false;
        Ok(())
    }

    // --- traps ---

    fn trap(&mut self, kind: TrapKind) -> Result<(), Error> {
        let fixup = self.asm.jmp_fixup()?;
        self.traps[kind.slot()].push(fixup);
        Ok(())
    }

    fn trap_if(&mut self, cc: Cc, kind: TrapKind) -> Result<(), Error> {
        let fixup = self.asm.jcc_fixup(cc)?;
        self.traps[kind.slot()].push(fixup);
        Ok(())
    }

    /// Emits the out-of-line trap paths after the function body.
    fn emit_stubs(&mut self) -> Result<(), Error> {
        for kind in TrapKind::ALL {
            let fixups = mem::take(&mut self.traps[kind.slot()]);
            if fixups.is_empty() {
                continue;
            }
            for fixup in fixups {
                self.asm.bind(fixup);
            }
            self.asm.store_imm32(Reg::Rbx, TRAP_CODE, kind.code())?;
            let raise = self.asm.jmp_fixup()?;
            self.raise.push(raise);
        }

        let mut need_raise = !self.raise.is_empty();
        if !self.indirect_failed.is_empty() {
            for fixup in mem::take(&mut self.indirect_failed) {
                self.asm.bind(fixup);
            }
            // the runtime should have said why, otherwise blame the signature
            self.check_trap(TrapExit::Raise)?;
            self.asm
                .store_imm32(Reg::Rbx, TRAP_CODE, TrapKind::BadSignature.code())?;
            need_raise = true;
            // falls through into the raise path
        }

        if need_raise {
            for fixup in mem::take(&mut self.raise) {
                self.asm.bind(fixup);
            }
            let frame_bottom = -8 - self.frame_size;
            self.asm.lea(Reg::Rsp, Reg::Rbp, frame_bottom)?;
            self.asm.mov_rr(Size::S64, Reg::Rdi, Reg::Rbx)?;
            self.asm.load(Size::S64, Reg::Rax, Reg::Rbx, TRAP_HANDLER)?;
            self.asm.call_r(Reg::Rax)?;
        }

        if need_raise || !self.unwind.is_empty() {
            for fixup in mem::take(&mut self.unwind) {
                self.asm.bind(fixup);
            }
            self.asm.alu_rr(Alu::Xor, Size::S32, Reg::Rax, Reg::Rax)?;
            self.return_sequence()?;
        }

        Ok(())
    }
}

fn trunc_sat_builtin(op: TruncSatOp) -> Builtin {
    match op {
        TruncSatOp::I32TruncSatF32S => Builtin::I32TruncSatF32S,
        TruncSatOp::I32TruncSatF32U => Builtin::I32TruncSatF32U,
        TruncSatOp::I32TruncSatF64S => Builtin::I32TruncSatF64S,
        TruncSatOp::I32TruncSatF64U => Builtin::I32TruncSatF64U,
        TruncSatOp::I64TruncSatF32S => Builtin::I64TruncSatF32S,
        TruncSatOp::I64TruncSatF32U => Builtin::I64TruncSatF32U,
        TruncSatOp::I64TruncSatF64S => Builtin::I64TruncSatF64S,
        TruncSatOp::I64TruncSatF64U => Builtin::I64TruncSatF64U,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cranelift_entity::EntityRef;
    use wasm_decode::test_utils::{FuncBody, ModuleBuilder};
    use wasm_decode::{DefinedFuncIdx, FuncType, GlobalType, Limits, ValType};

    fn sig(params: &[ValType], results: &[ValType]) -> FuncType {
        FuncType::new(params.iter().copied(), results.iter().copied())
    }

    fn build_module(params: &[ValType], results: &[ValType], body: FuncBody) -> Module {
        let bytes = ModuleBuilder::new()
            .types(&[sig(params, results)])
            .functions(&[0])
            .code(&[body])
            .finish();
        wasm_decode::decode(&bytes).unwrap()
    }

    fn compile_with(compiler: &X86_64Compiler, module: &Module) -> Result<Vec<u8>, Error> {
        let arena = CodeArena::new();
        let func = Function::new(module, DefinedFuncIdx::new(0)).unwrap();
        let result = compiler.compile(&func, &arena).map(|blob| {
            let code = arena.read(&blob);
            arena.free(blob);
            code
        });
        assert_eq!(arena.live_regions(), 0);
        result
    }

    fn compile(module: &Module) -> Result<Vec<u8>, Error> {
        compile_with(&X86_64Compiler::new(), module)
    }

    fn assert_invalid(result: Result<Vec<u8>, Error>) {
        match result {
            Err(Error::InvalidFunction(msg)) => log::debug!("rejected: {msg}"),
            other => panic!("expected InvalidFunction, got {other:?}"),
        }
    }

    #[test_log::test]
    fn prologue() {
        let module = build_module(
            &[],
            &[ValType::I32],
            FuncBody::new()
                .i32_const(2)
                .i32_const(3)
                .op(Opcode::I32Add)
                .end(),
        );
        let code = compile(&module).unwrap();
        assert_eq!(
            code[..12],
            [
                0x55, // push rbp
                0x48, 0x89, 0xE5, // mov rbp, rsp
                0x53, // push rbx
                0x48, 0x89, 0xFB, // mov rbx, rdi
                0x48, 0x83, 0xEC, 0x08, // sub rsp, 8
            ]
        );
    }

    #[test]
    fn frame_keeps_stack_aligned() {
        let module = build_module(
            &[ValType::I32, ValType::I64],
            &[],
            FuncBody::with_locals(&[(5, ValType::F64)]).end(),
        );
        let code = compile(&module).unwrap();
        // seven locals, rounded up to an odd slot count
        assert_eq!(code[8..12], [0x48, 0x83, 0xEC, 0x38]);
        // five declared locals are cleared with `rep stosq`
        assert!(code.windows(3).any(|w| w == [0xF3, 0x48, 0xAB]));
    }

    #[test]
    fn opcodes_without_template() {
        let block = Instruction::Plain(Opcode::Block);
        let indexed_add = Instruction::Index {
            op: Opcode::I32Add,
            index: 0,
        };
        let module = build_module(&[], &[], FuncBody::new().end());

        let arena = CodeArena::new();
        let func = Function::new(&module, DefinedFuncIdx::new(0)).unwrap();
        let mut compiler = FuncCompiler::new(Assembler::new(&arena, 64).unwrap(), &func).unwrap();
        compiler
            .control
            .push(Frame::new(FrameKind::Function, 0, 0, 0));

        assert!(matches!(
            compiler.instruction(&block),
            Err(Error::BadOpcode(Opcode::Block))
        ));
        assert!(matches!(
            compiler.instruction(&indexed_add),
            Err(Error::BadOpcode(Opcode::I32Add))
        ));

        drop(compiler);
        assert_eq!(arena.live_regions(), 0);
    }

    #[test]
    fn operand_stack_underflow() {
        let module = build_module(&[], &[], FuncBody::new().op(Opcode::I32Add).end());
        assert_invalid(compile(&module));

        // values outside a block are not visible inside it
        let module = build_module(
            &[],
            &[],
            FuncBody::new()
                .i32_const(1)
                .block(Opcode::Block, BlockType::Empty)
                .op(Opcode::Drop)
                .end()
                .op(Opcode::Drop)
                .end(),
        );
        assert_invalid(compile(&module));
    }

    #[test]
    fn out_of_range_indices() {
        let module = build_module(&[ValType::I32], &[ValType::I32], FuncBody::new().local_get(1).end());
        assert_invalid(compile(&module));

        let module = build_module(&[], &[], FuncBody::new().index(Opcode::Br, 1).end());
        assert_invalid(compile(&module));

        let module = build_module(&[], &[], FuncBody::new().index(Opcode::Call, 1).end());
        assert_invalid(compile(&module));

        let module = build_module(&[], &[], FuncBody::new().index(Opcode::GlobalGet, 0).op(Opcode::Drop).end());
        assert_invalid(compile(&module));
    }

    #[test]
    fn wrong_block_arity() {
        let module = build_module(&[], &[ValType::I32], FuncBody::new().end());
        assert_invalid(compile(&module));

        let module = build_module(
            &[],
            &[],
            FuncBody::new()
                .block(Opcode::Block, BlockType::Value(ValType::I64))
                .i64_const(1)
                .i64_const(2)
                .end()
                .op(Opcode::Drop)
                .end(),
        );
        assert_invalid(compile(&module));

        // without an else arm the if must leave the stack unchanged
        let module = build_module(
            &[],
            &[ValType::I32],
            FuncBody::new()
                .i32_const(1)
                .block(Opcode::If, BlockType::Value(ValType::I32))
                .i32_const(2)
                .end()
                .end(),
        );
        assert_invalid(compile(&module));
    }

    #[test]
    fn memory_and_tables_are_required() {
        let module = build_module(
            &[],
            &[ValType::I32],
            FuncBody::new().i32_const(0).memarg(Opcode::I32Load, 2, 0).end(),
        );
        assert_invalid(compile(&module));

        let module = build_module(&[], &[ValType::I32], FuncBody::new().memory_op(Opcode::MemorySize).end());
        assert_invalid(compile(&module));

        let module = build_module(&[], &[], FuncBody::new().i32_const(0).call_indirect(0).end());
        assert_invalid(compile(&module));
    }

    #[test]
    fn immutable_globals() {
        let bytes = ModuleBuilder::new()
            .types(&[sig(&[], &[])])
            .functions(&[0])
            .globals(&[(
                GlobalType {
                    ty: ValType::I32,
                    mutability: Mutability::Const,
                },
                1,
            )])
            .code(&[FuncBody::new().i32_const(5).index(Opcode::GlobalSet, 0).end()])
            .finish();
        let module = wasm_decode::decode(&bytes).unwrap();
        assert_invalid(compile(&module));
    }

    #[test]
    fn multiple_results_are_unsupported() {
        let module = build_module(
            &[],
            &[ValType::I32, ValType::I32],
            FuncBody::new().i32_const(1).i32_const(2).end(),
        );
        assert!(matches!(compile(&module), Err(Error::Unsupported(_))));
    }

    #[test]
    fn dead_code_is_skipped() {
        // the add would underflow if it were compiled
        let module = build_module(
            &[],
            &[ValType::I32],
            FuncBody::new()
                .op(Opcode::Unreachable)
                .op(Opcode::I32Add)
                .end(),
        );
        compile(&module).unwrap();

        let module = build_module(
            &[],
            &[ValType::I64],
            FuncBody::new()
                .block(Opcode::Block, BlockType::Value(ValType::I64))
                .i64_const(7)
                .index(Opcode::Br, 0)
                .op(Opcode::Drop)
                .op(Opcode::Drop)
                .end()
                .end(),
        );
        compile(&module).unwrap();
    }

    #[test_log::test]
    fn small_size_hint_grows_the_region() {
        let mut body = FuncBody::new().i64_const(0);
        for i in 0..2000 {
            body = body.i64_const(i).op(Opcode::I64Add);
        }
        let module = build_module(&[], &[ValType::I64], body.end());

        let compiler = X86_64Compiler::with_config(CompilerConfig {
            bytes_per_instruction: 1,
        });
        let code = compile_with(&compiler, &module).unwrap();
        assert!(code.len() > code_memory::page_size());
    }

    #[test]
    fn compile_module_frees_on_error() {
        let bytes = ModuleBuilder::new()
            .types(&[sig(&[], &[])])
            .functions(&[0, 0, 0])
            .table(Limits { min: 1, max: None })
            .code(&[
                FuncBody::new().end(),
                FuncBody::new().index(Opcode::Call, 0).end(),
                FuncBody::new().op(Opcode::Drop).end(),
            ])
            .finish();
        let module = wasm_decode::decode(&bytes).unwrap();

        let arena = CodeArena::new();
        let err = X86_64Compiler::new()
            .compile_module(&module, &arena)
            .unwrap_err();
        assert!(matches!(err, Error::InvalidFunction(_)));
        assert_eq!(arena.live_regions(), 0);
    }
}

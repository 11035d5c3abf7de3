// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Encodings for the handful of x86-64 instructions the templates use.
//!
//! Only the eight legacy general purpose registers and `xmm0`/`xmm1` are ever
//! named, so the only REX bit we need is `W`.

use code_memory::{AllocError, Assembler};

pub(crate) type EmitResult = Result<(), AllocError>;

const REX_W: u8 = 0x48;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub(crate) enum Reg {
    Rax = 0,
    Rcx = 1,
    Rdx = 2,
    Rbx = 3,
    Rsp = 4,
    Rbp = 5,
    Rsi = 6,
    Rdi = 7,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub(crate) enum Xmm {
    Xmm0 = 0,
    Xmm1 = 1,
}

/// Operand size of an integer instruction. 32-bit writes zero the upper half
/// of the destination register.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Size {
    S32,
    S64,
}

impl Size {
    fn rex_w(self) -> bool {
        self == Self::S64
    }
}

/// Either a register or a `[base + disp]` memory operand.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Rm {
    Reg(Reg),
    Mem(Reg, i32),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub(crate) enum Cc {
    B = 0x2,
    Ae = 0x3,
    E = 0x4,
    Ne = 0x5,
    Be = 0x6,
    A = 0x7,
    P = 0xA,
    Np = 0xB,
    L = 0xC,
    Ge = 0xD,
    Le = 0xE,
    G = 0xF,
}

/// The classic two-operand ALU group. The value is the `/digit` used with the
/// immediate forms, the `r/m, r` opcode is `digit * 8 + 1`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub(crate) enum Alu {
    Add = 0,
    Or = 1,
    And = 4,
    Sub = 5,
    Xor = 6,
    Cmp = 7,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub(crate) enum Shift {
    Rol = 0,
    Ror = 1,
    Shl = 4,
    Shr = 5,
    Sar = 7,
}

/// Group 3 unary instructions, `F7 /digit`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub(crate) enum Unary {
    Div = 6,
    Idiv = 7,
}

/// Scalar SSE arithmetic, `F3 0F op` for single and `F2 0F op` for double
/// precision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub(crate) enum Sse {
    Sqrt = 0x51,
    Add = 0x58,
    Mul = 0x59,
    Sub = 0x5C,
    Div = 0x5E,
}

/// Signed 32-bit displacement from `from` to `target`.
#[expect(
    clippy::cast_possible_truncation,
    reason = "displacements are taken modulo 2^32, code blobs are far smaller than 2 GiB"
)]
pub(crate) fn rel32(from: usize, target: usize) -> u32 {
    target.wrapping_sub(from) as u32
}

pub(crate) trait Emit {
    fn op(
        &mut self,
        prefix: Option<u8>,
        size: Size,
        opcode: &[u8],
        reg: u8,
        rm: Rm,
    ) -> EmitResult;

    fn push(&mut self, reg: Reg) -> EmitResult;
    fn pop(&mut self, reg: Reg) -> EmitResult;

    fn mov_rr(&mut self, size: Size, dst: Reg, src: Reg) -> EmitResult {
        self.op(None, size, &[0x89], src as u8, Rm::Reg(dst))
    }
    fn load(&mut self, size: Size, dst: Reg, base: Reg, disp: i32) -> EmitResult {
        self.op(None, size, &[0x8B], dst as u8, Rm::Mem(base, disp))
    }
    fn store(&mut self, size: Size, base: Reg, disp: i32, src: Reg) -> EmitResult {
        self.op(None, size, &[0x89], src as u8, Rm::Mem(base, disp))
    }
    fn store8(&mut self, base: Reg, disp: i32, src: Reg) -> EmitResult {
        debug_assert!(matches!(src, Reg::Rax | Reg::Rcx | Reg::Rdx | Reg::Rbx));
        self.op(None, Size::S32, &[0x88], src as u8, Rm::Mem(base, disp))
    }
    fn store16(&mut self, base: Reg, disp: i32, src: Reg) -> EmitResult {
        self.op(Some(0x66), Size::S32, &[0x89], src as u8, Rm::Mem(base, disp))
    }
    /// `mov dword [base + disp], imm`
    fn store_imm32(&mut self, base: Reg, disp: i32, imm: u32) -> EmitResult;
    /// Loads an immediate using the shortest encoding.
    fn mov_ri(&mut self, dst: Reg, imm: u64) -> EmitResult;
    fn lea(&mut self, dst: Reg, base: Reg, disp: i32) -> EmitResult {
        self.op(None, Size::S64, &[0x8D], dst as u8, Rm::Mem(base, disp))
    }

    fn alu_rr(&mut self, alu: Alu, size: Size, dst: Reg, src: Reg) -> EmitResult {
        self.op(None, size, &[alu as u8 * 8 + 1], src as u8, Rm::Reg(dst))
    }
    /// `alu dst, [base + disp]`
    fn alu_rm(&mut self, alu: Alu, size: Size, dst: Reg, base: Reg, disp: i32) -> EmitResult {
        self.op(None, size, &[alu as u8 * 8 + 3], dst as u8, Rm::Mem(base, disp))
    }
    fn alu_ri(&mut self, alu: Alu, size: Size, dst: Rm, imm: i32) -> EmitResult;

    fn imul_rr(&mut self, size: Size, dst: Reg, src: Reg) -> EmitResult {
        self.op(None, size, &[0x0F, 0xAF], dst as u8, Rm::Reg(src))
    }
    fn unary(&mut self, op: Unary, size: Size, reg: Reg) -> EmitResult {
        self.op(None, size, &[0xF7], op as u8, Rm::Reg(reg))
    }
    /// Shifts or rotates `reg` by `cl`.
    fn shift_cl(&mut self, op: Shift, size: Size, reg: Reg) -> EmitResult {
        self.op(None, size, &[0xD3], op as u8, Rm::Reg(reg))
    }
    fn shift_imm(&mut self, op: Shift, size: Size, reg: Reg, imm: u8) -> EmitResult;
    fn test_rr(&mut self, size: Size, a: Reg, b: Reg) -> EmitResult {
        self.op(None, size, &[0x85], b as u8, Rm::Reg(a))
    }
    fn setcc(&mut self, cc: Cc, dst: Reg) -> EmitResult {
        debug_assert!(matches!(dst, Reg::Rax | Reg::Rcx | Reg::Rdx | Reg::Rbx));
        self.op(None, Size::S32, &[0x0F, 0x90 | cc as u8], 0, Rm::Reg(dst))
    }
    fn cmov(&mut self, cc: Cc, size: Size, dst: Reg, src: Reg) -> EmitResult {
        self.op(None, size, &[0x0F, 0x40 | cc as u8], dst as u8, Rm::Reg(src))
    }
    /// `movzx dst, byte/word src`, zero extending into the full 64-bit register.
    fn movzx(&mut self, bits: u8, dst: Reg, src: Rm) -> EmitResult {
        let opcode = if bits == 8 { 0xB6 } else { 0xB7 };
        self.op(None, Size::S32, &[0x0F, opcode], dst as u8, src)
    }
    /// `movsx dst, byte/word src`.
    fn movsx(&mut self, bits: u8, size: Size, dst: Reg, src: Rm) -> EmitResult {
        let opcode = if bits == 8 { 0xBE } else { 0xBF };
        self.op(None, size, &[0x0F, opcode], dst as u8, src)
    }
    fn movsxd(&mut self, dst: Reg, src: Rm) -> EmitResult {
        self.op(None, Size::S64, &[0x63], dst as u8, src)
    }
    /// `cdq` or `cqo`
    fn sign_extend_rax(&mut self, size: Size) -> EmitResult;

    fn call_r(&mut self, reg: Reg) -> EmitResult {
        self.op(None, Size::S32, &[0xFF], 2, Rm::Reg(reg))
    }
    fn ret(&mut self) -> EmitResult;
    /// Fills `rcx` quadwords at `rdi` with `rax`.
    fn rep_stosq(&mut self) -> EmitResult;

    /// Emits `jmp rel32` with a zero displacement and returns the offset of
    /// the displacement for later patching.
    fn jmp_fixup(&mut self) -> Result<usize, AllocError>;
    fn jcc_fixup(&mut self, cc: Cc) -> Result<usize, AllocError>;
    /// A jump to an already emitted offset.
    fn jmp_back(&mut self, target: usize) -> EmitResult;
    fn jcc_back(&mut self, cc: Cc, target: usize) -> EmitResult;
    /// Points the displacement at `fixup` to the current offset.
    fn bind(&mut self, fixup: usize);

    fn movq_to_xmm(&mut self, size: Size, dst: Xmm, src: Reg) -> EmitResult {
        self.op(Some(0x66), size, &[0x0F, 0x6E], dst as u8, Rm::Reg(src))
    }
    fn movq_from_xmm(&mut self, size: Size, dst: Reg, src: Xmm) -> EmitResult {
        self.op(Some(0x66), size, &[0x0F, 0x7E], src as u8, Rm::Reg(dst))
    }
    fn sse(&mut self, op: Sse, double: bool, dst: Xmm, src: Xmm) -> EmitResult {
        let prefix = if double { 0xF2 } else { 0xF3 };
        self.op(
            Some(prefix),
            Size::S32,
            &[0x0F, op as u8],
            dst as u8,
            Rm::Reg(xmm_as_rm(src)),
        )
    }
    /// `ucomiss`/`ucomisd a, b`
    fn ucomis(&mut self, double: bool, a: Xmm, b: Xmm) -> EmitResult {
        let prefix = double.then_some(0x66);
        self.op(prefix, Size::S32, &[0x0F, 0x2E], a as u8, Rm::Reg(xmm_as_rm(b)))
    }
    /// `cvtsi2ss`/`cvtsi2sd`, `size` is the width of the signed integer source.
    fn cvt_int_to_float(&mut self, double: bool, size: Size, dst: Xmm, src: Reg) -> EmitResult {
        let prefix = if double { 0xF2 } else { 0xF3 };
        self.op(Some(prefix), size, &[0x0F, 0x2A], dst as u8, Rm::Reg(src))
    }
    /// `cvtss2sd` when `to_double`, `cvtsd2ss` otherwise.
    fn cvt_float(&mut self, to_double: bool, dst: Xmm, src: Xmm) -> EmitResult {
        let prefix = if to_double { 0xF3 } else { 0xF2 };
        self.op(
            Some(prefix),
            Size::S32,
            &[0x0F, 0x5A],
            dst as u8,
            Rm::Reg(xmm_as_rm(src)),
        )
    }
}

/// Register fields of xmm operands use the same numbering as the GPRs.
fn xmm_as_rm(xmm: Xmm) -> Reg {
    match xmm {
        Xmm::Xmm0 => Reg::Rax,
        Xmm::Xmm1 => Reg::Rcx,
    }
}

fn modrm(asm: &mut Assembler<'_>, reg: u8, rm: Rm) -> EmitResult {
    debug_assert!(reg < 8);
    match rm {
        Rm::Reg(r) => asm.emit_u8(0xC0 | (reg << 3) | r as u8),
        Rm::Mem(base, disp) => {
            // [rbp] with mod 00 means rip-relative, so rbp always gets a displacement
            let disp8 = i8::try_from(disp).ok();
            let mode = match disp8 {
                Some(0) if base != Reg::Rbp => 0b00,
                Some(_) => 0b01,
                None => 0b10,
            };
            asm.emit_u8((mode << 6) | (reg << 3) | base as u8)?;
            if base == Reg::Rsp {
                // SIB with no index and rsp as base
                asm.emit_u8(0x24)?;
            }
            match (mode, disp8) {
                (0b01, Some(disp8)) => asm.emit_u8(disp8.cast_unsigned()),
                (0b10, _) => asm.emit_u32(disp.cast_unsigned()),
                _ => Ok(()),
            }
        }
    }
}

impl Emit for Assembler<'_> {
    fn op(
        &mut self,
        prefix: Option<u8>,
        size: Size,
        opcode: &[u8],
        reg: u8,
        rm: Rm,
    ) -> EmitResult {
        if let Some(prefix) = prefix {
            self.emit_u8(prefix)?;
        }
        if size.rex_w() {
            self.emit_u8(REX_W)?;
        }
        self.emit_bytes(opcode)?;
        modrm(self, reg, rm)
    }

    fn push(&mut self, reg: Reg) -> EmitResult {
        self.emit_u8(0x50 | reg as u8)
    }

    fn pop(&mut self, reg: Reg) -> EmitResult {
        self.emit_u8(0x58 | reg as u8)
    }

    fn store_imm32(&mut self, base: Reg, disp: i32, imm: u32) -> EmitResult {
        self.op(None, Size::S32, &[0xC7], 0, Rm::Mem(base, disp))?;
        self.emit_u32(imm)
    }

    fn mov_ri(&mut self, dst: Reg, imm: u64) -> EmitResult {
        if let Ok(imm) = u32::try_from(imm) {
            // mov r32, imm32 zero extends
            self.emit_u8(0xB8 | dst as u8)?;
            self.emit_u32(imm)
        } else if let Ok(imm) = i32::try_from(imm.cast_signed()) {
            // mov r/m64, imm32 sign extends
            self.op(None, Size::S64, &[0xC7], 0, Rm::Reg(dst))?;
            self.emit_u32(imm.cast_unsigned())
        } else {
            self.emit_u8(REX_W)?;
            self.emit_u8(0xB8 | dst as u8)?;
            self.emit_u64(imm)
        }
    }

    fn alu_ri(&mut self, alu: Alu, size: Size, dst: Rm, imm: i32) -> EmitResult {
        if let Ok(imm8) = i8::try_from(imm) {
            self.op(None, size, &[0x83], alu as u8, dst)?;
            self.emit_u8(imm8.cast_unsigned())
        } else {
            self.op(None, size, &[0x81], alu as u8, dst)?;
            self.emit_u32(imm.cast_unsigned())
        }
    }

    fn sign_extend_rax(&mut self, size: Size) -> EmitResult {
        if size.rex_w() {
            self.emit_u8(REX_W)?;
        }
        self.emit_u8(0x99)
    }

    fn shift_imm(&mut self, op: Shift, size: Size, reg: Reg, imm: u8) -> EmitResult {
        self.op(None, size, &[0xC1], op as u8, Rm::Reg(reg))?;
        self.emit_u8(imm)
    }

    fn ret(&mut self) -> EmitResult {
        self.emit_u8(0xC3)
    }

    fn rep_stosq(&mut self) -> EmitResult {
        self.emit_bytes(&[0xF3, REX_W, 0xAB])
    }

    fn jmp_fixup(&mut self) -> Result<usize, AllocError> {
        self.emit_u8(0xE9)?;
        let fixup = self.offset();
        self.emit_u32(0)?;
        Ok(fixup)
    }

    fn jcc_fixup(&mut self, cc: Cc) -> Result<usize, AllocError> {
        self.emit_bytes(&[0x0F, 0x80 | cc as u8])?;
        let fixup = self.offset();
        self.emit_u32(0)?;
        Ok(fixup)
    }

    fn jmp_back(&mut self, target: usize) -> EmitResult {
        self.emit_u8(0xE9)?;
        let end = self.offset() + 4;
        self.emit_u32(rel32(end, target))
    }

    fn jcc_back(&mut self, cc: Cc, target: usize) -> EmitResult {
        self.emit_bytes(&[0x0F, 0x80 | cc as u8])?;
        let end = self.offset() + 4;
        self.emit_u32(rel32(end, target))
    }

    fn bind(&mut self, fixup: usize) {
        let target = self.offset();
        self.patch_u32(fixup, rel32(fixup + 4, target));
    }
}

// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The closed set of single-byte opcodes understood by the decoder.

use core::fmt;

/// Invokes `$mac` with one `@proposal Name = byte "mnemonic"` entry per
/// single-byte opcode.
macro_rules! for_each_opcode {
    ($mac:ident) => {
        $mac! {
            @mvp Unreachable = 0x00 "unreachable"
            @mvp Nop = 0x01 "nop"
            @mvp Block = 0x02 "block"
            @mvp Loop = 0x03 "loop"
            @mvp If = 0x04 "if"
            @mvp Else = 0x05 "else"
            @mvp End = 0x0B "end"
            @mvp Br = 0x0C "br"
            @mvp BrIf = 0x0D "br_if"
            @mvp BrTable = 0x0E "br_table"
            @mvp Return = 0x0F "return"
            @mvp Call = 0x10 "call"
            @mvp CallIndirect = 0x11 "call_indirect"
            @mvp Drop = 0x1A "drop"
            @mvp Select = 0x1B "select"
            @mvp LocalGet = 0x20 "local.get"
            @mvp LocalSet = 0x21 "local.set"
            @mvp LocalTee = 0x22 "local.tee"
            @mvp GlobalGet = 0x23 "global.get"
            @mvp GlobalSet = 0x24 "global.set"
            @mvp I32Load = 0x28 "i32.load"
            @mvp I64Load = 0x29 "i64.load"
            @mvp F32Load = 0x2A "f32.load"
            @mvp F64Load = 0x2B "f64.load"
            @mvp I32Load8S = 0x2C "i32.load8_s"
            @mvp I32Load8U = 0x2D "i32.load8_u"
            @mvp I32Load16S = 0x2E "i32.load16_s"
            @mvp I32Load16U = 0x2F "i32.load16_u"
            @mvp I64Load8S = 0x30 "i64.load8_s"
            @mvp I64Load8U = 0x31 "i64.load8_u"
            @mvp I64Load16S = 0x32 "i64.load16_s"
            @mvp I64Load16U = 0x33 "i64.load16_u"
            @mvp I64Load32S = 0x34 "i64.load32_s"
            @mvp I64Load32U = 0x35 "i64.load32_u"
            @mvp I32Store = 0x36 "i32.store"
            @mvp I64Store = 0x37 "i64.store"
            @mvp F32Store = 0x38 "f32.store"
            @mvp F64Store = 0x39 "f64.store"
            @mvp I32Store8 = 0x3A "i32.store8"
            @mvp I32Store16 = 0x3B "i32.store16"
            @mvp I64Store8 = 0x3C "i64.store8"
            @mvp I64Store16 = 0x3D "i64.store16"
            @mvp I64Store32 = 0x3E "i64.store32"
            @mvp MemorySize = 0x3F "memory.size"
            @mvp MemoryGrow = 0x40 "memory.grow"
            @mvp I32Const = 0x41 "i32.const"
            @mvp I64Const = 0x42 "i64.const"
            @mvp F32Const = 0x43 "f32.const"
            @mvp F64Const = 0x44 "f64.const"
            @mvp I32Eqz = 0x45 "i32.eqz"
            @mvp I32Eq = 0x46 "i32.eq"
            @mvp I32Ne = 0x47 "i32.ne"
            @mvp I32LtS = 0x48 "i32.lt_s"
            @mvp I32LtU = 0x49 "i32.lt_u"
            @mvp I32GtS = 0x4A "i32.gt_s"
            @mvp I32GtU = 0x4B "i32.gt_u"
            @mvp I32LeS = 0x4C "i32.le_s"
            @mvp I32LeU = 0x4D "i32.le_u"
            @mvp I32GeS = 0x4E "i32.ge_s"
            @mvp I32GeU = 0x4F "i32.ge_u"
            @mvp I64Eqz = 0x50 "i64.eqz"
            @mvp I64Eq = 0x51 "i64.eq"
            @mvp I64Ne = 0x52 "i64.ne"
            @mvp I64LtS = 0x53 "i64.lt_s"
            @mvp I64LtU = 0x54 "i64.lt_u"
            @mvp I64GtS = 0x55 "i64.gt_s"
            @mvp I64GtU = 0x56 "i64.gt_u"
            @mvp I64LeS = 0x57 "i64.le_s"
            @mvp I64LeU = 0x58 "i64.le_u"
            @mvp I64GeS = 0x59 "i64.ge_s"
            @mvp I64GeU = 0x5A "i64.ge_u"
            @mvp F32Eq = 0x5B "f32.eq"
            @mvp F32Ne = 0x5C "f32.ne"
            @mvp F32Lt = 0x5D "f32.lt"
            @mvp F32Gt = 0x5E "f32.gt"
            @mvp F32Le = 0x5F "f32.le"
            @mvp F32Ge = 0x60 "f32.ge"
            @mvp F64Eq = 0x61 "f64.eq"
            @mvp F64Ne = 0x62 "f64.ne"
            @mvp F64Lt = 0x63 "f64.lt"
            @mvp F64Gt = 0x64 "f64.gt"
            @mvp F64Le = 0x65 "f64.le"
            @mvp F64Ge = 0x66 "f64.ge"
            @mvp I32Clz = 0x67 "i32.clz"
            @mvp I32Ctz = 0x68 "i32.ctz"
            @mvp I32Popcnt = 0x69 "i32.popcnt"
            @mvp I32Add = 0x6A "i32.add"
            @mvp I32Sub = 0x6B "i32.sub"
            @mvp I32Mul = 0x6C "i32.mul"
            @mvp I32DivS = 0x6D "i32.div_s"
            @mvp I32DivU = 0x6E "i32.div_u"
            @mvp I32RemS = 0x6F "i32.rem_s"
            @mvp I32RemU = 0x70 "i32.rem_u"
            @mvp I32And = 0x71 "i32.and"
            @mvp I32Or = 0x72 "i32.or"
            @mvp I32Xor = 0x73 "i32.xor"
            @mvp I32Shl = 0x74 "i32.shl"
            @mvp I32ShrS = 0x75 "i32.shr_s"
            @mvp I32ShrU = 0x76 "i32.shr_u"
            @mvp I32Rotl = 0x77 "i32.rotl"
            @mvp I32Rotr = 0x78 "i32.rotr"
            @mvp I64Clz = 0x79 "i64.clz"
            @mvp I64Ctz = 0x7A "i64.ctz"
            @mvp I64Popcnt = 0x7B "i64.popcnt"
            @mvp I64Add = 0x7C "i64.add"
            @mvp I64Sub = 0x7D "i64.sub"
            @mvp I64Mul = 0x7E "i64.mul"
            @mvp I64DivS = 0x7F "i64.div_s"
            @mvp I64DivU = 0x80 "i64.div_u"
            @mvp I64RemS = 0x81 "i64.rem_s"
            @mvp I64RemU = 0x82 "i64.rem_u"
            @mvp I64And = 0x83 "i64.and"
            @mvp I64Or = 0x84 "i64.or"
            @mvp I64Xor = 0x85 "i64.xor"
            @mvp I64Shl = 0x86 "i64.shl"
            @mvp I64ShrS = 0x87 "i64.shr_s"
            @mvp I64ShrU = 0x88 "i64.shr_u"
            @mvp I64Rotl = 0x89 "i64.rotl"
            @mvp I64Rotr = 0x8A "i64.rotr"
            @mvp F32Abs = 0x8B "f32.abs"
            @mvp F32Neg = 0x8C "f32.neg"
            @mvp F32Ceil = 0x8D "f32.ceil"
            @mvp F32Floor = 0x8E "f32.floor"
            @mvp F32Trunc = 0x8F "f32.trunc"
            @mvp F32Nearest = 0x90 "f32.nearest"
            @mvp F32Sqrt = 0x91 "f32.sqrt"
            @mvp F32Add = 0x92 "f32.add"
            @mvp F32Sub = 0x93 "f32.sub"
            @mvp F32Mul = 0x94 "f32.mul"
            @mvp F32Div = 0x95 "f32.div"
            @mvp F32Min = 0x96 "f32.min"
            @mvp F32Max = 0x97 "f32.max"
            @mvp F32Copysign = 0x98 "f32.copysign"
            @mvp F64Abs = 0x99 "f64.abs"
            @mvp F64Neg = 0x9A "f64.neg"
            @mvp F64Ceil = 0x9B "f64.ceil"
            @mvp F64Floor = 0x9C "f64.floor"
            @mvp F64Trunc = 0x9D "f64.trunc"
            @mvp F64Nearest = 0x9E "f64.nearest"
            @mvp F64Sqrt = 0x9F "f64.sqrt"
            @mvp F64Add = 0xA0 "f64.add"
            @mvp F64Sub = 0xA1 "f64.sub"
            @mvp F64Mul = 0xA2 "f64.mul"
            @mvp F64Div = 0xA3 "f64.div"
            @mvp F64Min = 0xA4 "f64.min"
            @mvp F64Max = 0xA5 "f64.max"
            @mvp F64Copysign = 0xA6 "f64.copysign"
            @mvp I32WrapI64 = 0xA7 "i32.wrap_i64"
            @mvp I32TruncF32S = 0xA8 "i32.trunc_f32_s"
            @mvp I32TruncF32U = 0xA9 "i32.trunc_f32_u"
            @mvp I32TruncF64S = 0xAA "i32.trunc_f64_s"
            @mvp I32TruncF64U = 0xAB "i32.trunc_f64_u"
            @mvp I64ExtendI32S = 0xAC "i64.extend_i32_s"
            @mvp I64ExtendI32U = 0xAD "i64.extend_i32_u"
            @mvp I64TruncF32S = 0xAE "i64.trunc_f32_s"
            @mvp I64TruncF32U = 0xAF "i64.trunc_f32_u"
            @mvp I64TruncF64S = 0xB0 "i64.trunc_f64_s"
            @mvp I64TruncF64U = 0xB1 "i64.trunc_f64_u"
            @mvp F32ConvertI32S = 0xB2 "f32.convert_i32_s"
            @mvp F32ConvertI32U = 0xB3 "f32.convert_i32_u"
            @mvp F32ConvertI64S = 0xB4 "f32.convert_i64_s"
            @mvp F32ConvertI64U = 0xB5 "f32.convert_i64_u"
            @mvp F32DemoteF64 = 0xB6 "f32.demote_f64"
            @mvp F64ConvertI32S = 0xB7 "f64.convert_i32_s"
            @mvp F64ConvertI32U = 0xB8 "f64.convert_i32_u"
            @mvp F64ConvertI64S = 0xB9 "f64.convert_i64_s"
            @mvp F64ConvertI64U = 0xBA "f64.convert_i64_u"
            @mvp F64PromoteF32 = 0xBB "f64.promote_f32"
            @mvp I32ReinterpretF32 = 0xBC "i32.reinterpret_f32"
            @mvp I64ReinterpretF64 = 0xBD "i64.reinterpret_f64"
            @mvp F32ReinterpretI32 = 0xBE "f32.reinterpret_i32"
            @mvp F64ReinterpretI64 = 0xBF "f64.reinterpret_i64"
            @sign_extension I32Extend8S = 0xC0 "i32.extend8_s"
            @sign_extension I32Extend16S = 0xC1 "i32.extend16_s"
            @sign_extension I64Extend8S = 0xC2 "i64.extend8_s"
            @sign_extension I64Extend16S = 0xC3 "i64.extend16_s"
            @sign_extension I64Extend32S = 0xC4 "i64.extend32_s"
        }
    };
}

macro_rules! define_opcode {
    ($(@$proposal:ident $name:ident = $byte:literal $mnemonic:literal)*) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        #[repr(u8)]
        pub enum Opcode {
            $($name = $byte,)*
        }

        impl Opcode {
            /// Every opcode, in encoding order.
            pub const ALL: &[Opcode] = &[$(Opcode::$name,)*];

            #[must_use]
            pub const fn from_u8(byte: u8) -> Option<Self> {
                match byte {
                    $($byte => Some(Self::$name),)*
                    _ => None,
                }
            }

            /// The text-format name of this opcode, e.g. `i32.add`.
            #[must_use]
            pub const fn mnemonic(self) -> &'static str {
                match self {
                    $(Self::$name => $mnemonic,)*
                }
            }
        }
    };
}

for_each_opcode!(define_opcode);

/// The byte introducing the saturating truncation family.
pub const TRUNC_SAT_PREFIX: u8 = 0xFC;

impl Opcode {
    #[must_use]
    pub const fn as_u8(self) -> u8 {
        self as u8
    }

    #[must_use]
    pub const fn is_load(self) -> bool {
        matches!(self.as_u8(), 0x28..=0x35)
    }

    #[must_use]
    pub const fn is_store(self) -> bool {
        matches!(self.as_u8(), 0x36..=0x3E)
    }

    /// `end` and `else` close an instruction sequence.
    #[must_use]
    pub const fn is_terminator(self) -> bool {
        matches!(self, Self::End | Self::Else)
    }

    /// Number of bytes a load or store accesses, `None` for other opcodes.
    #[must_use]
    pub const fn access_width(self) -> Option<u32> {
        Some(match self {
            Self::I32Load8S
            | Self::I32Load8U
            | Self::I64Load8S
            | Self::I64Load8U
            | Self::I32Store8
            | Self::I64Store8 => 1,
            Self::I32Load16S
            | Self::I32Load16U
            | Self::I64Load16S
            | Self::I64Load16U
            | Self::I32Store16
            | Self::I64Store16 => 2,
            Self::I32Load
            | Self::F32Load
            | Self::I64Load32S
            | Self::I64Load32U
            | Self::I32Store
            | Self::F32Store
            | Self::I64Store32 => 4,
            Self::I64Load | Self::F64Load | Self::I64Store | Self::F64Store => 8,
            _ => return None,
        })
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.mnemonic())
    }
}

/// The saturating float to integer truncations, encoded as `0xFC` followed by
/// a LEB128 selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TruncSatOp {
    I32TruncSatF32S,
    I32TruncSatF32U,
    I32TruncSatF64S,
    I32TruncSatF64U,
    I64TruncSatF32S,
    I64TruncSatF32U,
    I64TruncSatF64S,
    I64TruncSatF64U,
}

impl TruncSatOp {
    #[must_use]
    pub const fn from_selector(selector: u32) -> Option<Self> {
        Some(match selector {
            0 => Self::I32TruncSatF32S,
            1 => Self::I32TruncSatF32U,
            2 => Self::I32TruncSatF64S,
            3 => Self::I32TruncSatF64U,
            4 => Self::I64TruncSatF32S,
            5 => Self::I64TruncSatF32U,
            6 => Self::I64TruncSatF64S,
            7 => Self::I64TruncSatF64U,
            _ => return None,
        })
    }

    #[must_use]
    pub const fn selector(self) -> u32 {
        self as u32
    }

    #[must_use]
    pub const fn mnemonic(self) -> &'static str {
        match self {
            Self::I32TruncSatF32S => "i32.trunc_sat_f32_s",
            Self::I32TruncSatF32U => "i32.trunc_sat_f32_u",
            Self::I32TruncSatF64S => "i32.trunc_sat_f64_s",
            Self::I32TruncSatF64U => "i32.trunc_sat_f64_u",
            Self::I64TruncSatF32S => "i64.trunc_sat_f32_s",
            Self::I64TruncSatF32U => "i64.trunc_sat_f32_u",
            Self::I64TruncSatF64S => "i64.trunc_sat_f64_s",
            Self::I64TruncSatF64U => "i64.trunc_sat_f64_u",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn byte_mapping_is_consistent() {
        for op in Opcode::ALL {
            assert_eq!(Opcode::from_u8(op.as_u8()), Some(*op));
        }
        assert_eq!(Opcode::from_u8(0x06), None);
        assert_eq!(Opcode::from_u8(0xC5), None);
        assert_eq!(Opcode::from_u8(TRUNC_SAT_PREFIX), None);
    }

    #[test]
    fn mnemonics() {
        assert_eq!(Opcode::I32Add.mnemonic(), "i32.add");
        assert_eq!(Opcode::F64ReinterpretI64.to_string(), "f64.reinterpret_i64");
        assert_eq!(TruncSatOp::from_selector(5).map(TruncSatOp::mnemonic), Some("i64.trunc_sat_f32_u"));
        assert_eq!(TruncSatOp::from_selector(8), None);
    }

    #[test]
    fn memory_classes() {
        assert!(Opcode::I32Load.is_load());
        assert!(Opcode::I64Load32U.is_load());
        assert!(!Opcode::I32Store.is_load());
        assert!(Opcode::I64Store32.is_store());
        assert!(!Opcode::MemorySize.is_store());
        assert_eq!(Opcode::I64Load16S.access_width(), Some(2));
        assert_eq!(Opcode::I32Add.access_width(), None);
    }
}

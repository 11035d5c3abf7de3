// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::fmt;

/// Size of one linear memory page in bytes.
pub const PAGE_SIZE: u32 = 65536;
/// Maximum number of pages a 32-bit linear memory can have.
pub const MAX_PAGES: u32 = 65536;

#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum ValType {
    I32,
    I64,
    F32,
    F64,
}

impl ValType {
    /// Decodes the single-byte value type encoding.
    #[must_use]
    pub const fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x7F => Some(Self::I32),
            0x7E => Some(Self::I64),
            0x7D => Some(Self::F32),
            0x7C => Some(Self::F64),
            _ => None,
        }
    }

    #[must_use]
    pub const fn as_byte(self) -> u8 {
        match self {
            Self::I32 => 0x7F,
            Self::I64 => 0x7E,
            Self::F32 => 0x7D,
            Self::F64 => 0x7C,
        }
    }

    #[must_use]
    pub const fn is_float(self) -> bool {
        matches!(self, Self::F32 | Self::F64)
    }

    /// Width of the value in bytes.
    #[must_use]
    pub const fn byte_width(self) -> u32 {
        match self {
            Self::I32 | Self::F32 => 4,
            Self::I64 | Self::F64 => 8,
        }
    }
}

impl fmt::Display for ValType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::I32 => "i32",
            Self::I64 => "i64",
            Self::F32 => "f32",
            Self::F64 => "f64",
        })
    }
}

/// A function signature.
///
/// Two function types are equal exactly when their parameter lists and their
/// result lists are element-wise equal.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct FuncType {
    params: Box<[ValType]>,
    results: Box<[ValType]>,
}

impl FuncType {
    pub fn new(
        params: impl IntoIterator<Item = ValType>,
        results: impl IntoIterator<Item = ValType>,
    ) -> Self {
        Self {
            params: params.into_iter().collect(),
            results: results.into_iter().collect(),
        }
    }

    #[must_use]
    pub fn params(&self) -> &[ValType] {
        &self.params
    }

    #[must_use]
    pub fn results(&self) -> &[ValType] {
        &self.results
    }
}

/// Formats as a signature, e.g. `(i32, i64) -> (f32)`.
impl fmt::Display for FuncType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn list(f: &mut fmt::Formatter<'_>, tys: &[ValType]) -> fmt::Result {
            f.write_str("(")?;
            for (i, ty) in tys.iter().enumerate() {
                if i > 0 {
                    f.write_str(", ")?;
                }
                write!(f, "{ty}")?;
            }
            f.write_str(")")
        }

        list(f, &self.params)?;
        f.write_str(" -> ")?;
        list(f, &self.results)
    }
}

/// Size bounds of a memory (in pages) or a table (in elements).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Limits {
    pub min: u32,
    pub max: Option<u32>,
}

impl Limits {
    /// The binary tag this limit is encoded with, `0` without a maximum and
    /// `1` with one.
    #[must_use]
    pub const fn tag(&self) -> u8 {
        match self.max {
            None => 0x00,
            Some(_) => 0x01,
        }
    }
}

impl fmt::Display for Limits {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.max {
            Some(max) => write!(f, "{{min: {}, max: {max}}}", self.min),
            None => write!(f, "{{min: {}}}", self.min),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RefType {
    FuncRef,
}

impl fmt::Display for RefType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::FuncRef => f.write_str("funcref"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TableType {
    pub element: RefType,
    pub limits: Limits,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MemoryType {
    pub limits: Limits,
}

impl MemoryType {
    /// Initial size of the memory in bytes.
    #[must_use]
    pub fn initial_byte_size(&self) -> u64 {
        u64::from(self.limits.min) * u64::from(PAGE_SIZE)
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub enum Mutability {
    Const,
    Var,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub struct GlobalType {
    pub ty: ValType,
    pub mutability: Mutability,
}

impl fmt::Display for GlobalType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{{type: {}, mut: {}}}",
            self.ty,
            self.mutability == Mutability::Var
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn func_type_equality_is_elementwise() {
        let a = FuncType::new([ValType::I32, ValType::I64], [ValType::F32]);
        let b = FuncType::new([ValType::I32, ValType::I64], [ValType::F32]);
        let c = FuncType::new([ValType::I32], [ValType::I64, ValType::F32]);

        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_ne!(a, FuncType::default());
    }

    #[test]
    fn display() {
        let ty = FuncType::new([ValType::I32, ValType::I64], [ValType::F32]);
        assert_eq!(ty.to_string(), "(i32, i64) -> (f32)");
        assert_eq!(FuncType::default().to_string(), "() -> ()");

        let limits = Limits {
            min: 1,
            max: Some(2),
        };
        assert_eq!(limits.to_string(), "{min: 1, max: 2}");
        assert_eq!(limits.tag(), 1);

        let global = GlobalType {
            ty: ValType::F64,
            mutability: Mutability::Var,
        };
        assert_eq!(global.to_string(), "{type: f64, mut: true}");
    }

    #[test]
    fn val_type_bytes() {
        for ty in [ValType::I32, ValType::I64, ValType::F32, ValType::F64] {
            assert_eq!(ValType::from_byte(ty.as_byte()), Some(ty));
        }
        assert_eq!(ValType::from_byte(0x7B), None);
    }
}

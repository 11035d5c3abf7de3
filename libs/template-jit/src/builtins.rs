// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Out-of-line helpers for operations that have no short native template.
//!
//! Every helper works on raw value bits: `f32` and `i32` values arrive in the
//! low half of a `u64` and are returned the same way. The checked conversions
//! additionally take the context so they can record a trap, in which case they
//! return `0` and the caller checks [`VMContext::trap_code`].

#![allow(
    clippy::cast_possible_truncation,
    clippy::cast_possible_wrap,
    clippy::cast_sign_loss,
    clippy::cast_precision_loss,
    clippy::float_arithmetic,
    clippy::float_cmp,
    reason = "bit-level value conversions follow the wasm semantics exactly"
)]

use crate::trap::TrapKind;
use crate::vmctx::VMContext;

macro_rules! define_builtins {
    ($($variant:ident => $func:ident,)*) => {
        #[derive(Debug, Copy, Clone, PartialEq, Eq)]
        pub(crate) enum Builtin {
            $($variant,)*
        }

        impl Builtin {
            /// The absolute address compiled code calls.
            pub(crate) fn address(self) -> usize {
                match self {
                    $(Self::$variant => $func as usize,)*
                }
            }

            pub(crate) fn name(self) -> &'static str {
                match self {
                    $(Self::$variant => stringify!($func),)*
                }
            }
        }
    };
}

define_builtins! {
    F32Ceil => f32_ceil,
    F32Floor => f32_floor,
    F32Trunc => f32_trunc,
    F32Nearest => f32_nearest,
    F64Ceil => f64_ceil,
    F64Floor => f64_floor,
    F64Trunc => f64_trunc,
    F64Nearest => f64_nearest,
    F32Min => f32_min,
    F32Max => f32_max,
    F64Min => f64_min,
    F64Max => f64_max,
    I32Clz => i32_clz,
    I32Ctz => i32_ctz,
    I32Popcnt => i32_popcnt,
    I64Clz => i64_clz,
    I64Ctz => i64_ctz,
    I64Popcnt => i64_popcnt,
    F32ConvertI64U => f32_convert_i64_u,
    F64ConvertI64U => f64_convert_i64_u,
    I32TruncF32S => i32_trunc_f32_s,
    I32TruncF32U => i32_trunc_f32_u,
    I32TruncF64S => i32_trunc_f64_s,
    I32TruncF64U => i32_trunc_f64_u,
    I64TruncF32S => i64_trunc_f32_s,
    I64TruncF32U => i64_trunc_f32_u,
    I64TruncF64S => i64_trunc_f64_s,
    I64TruncF64U => i64_trunc_f64_u,
    I32TruncSatF32S => i32_trunc_sat_f32_s,
    I32TruncSatF32U => i32_trunc_sat_f32_u,
    I32TruncSatF64S => i32_trunc_sat_f64_s,
    I32TruncSatF64U => i32_trunc_sat_f64_u,
    I64TruncSatF32S => i64_trunc_sat_f32_s,
    I64TruncSatF32U => i64_trunc_sat_f32_u,
    I64TruncSatF64S => i64_trunc_sat_f64_s,
    I64TruncSatF64U => i64_trunc_sat_f64_u,
}

#[inline]
fn f32_of(bits: u64) -> f32 {
    f32::from_bits(bits as u32)
}

#[inline]
fn f32_bits(x: f32) -> u64 {
    u64::from(x.to_bits())
}

#[inline]
fn f64_bits(x: f64) -> u64 {
    x.to_bits()
}

/// Truncates `x` towards zero and checks that the result lies in `min..max`,
/// recording the matching trap if it doesn't.
fn trunc_checked(vmctx: *mut VMContext, x: f64, min: f64, max: f64) -> Option<f64> {
    let kind = if x.is_nan() {
        TrapKind::BadConversionToInteger
    } else {
        let t = x.trunc();
        if t >= min && t < max {
            return Some(t);
        }
        TrapKind::IntegerOverflow
    };

    // Safety: only ever called by compiled code with its own context
    unsafe { VMContext::record_trap(vmctx, kind) };
    None
}

const I32_MIN: f64 = -2_147_483_648.0;
const I32_END: f64 = 2_147_483_648.0;
const U32_END: f64 = 4_294_967_296.0;
const I64_MIN: f64 = -9_223_372_036_854_775_808.0;
const I64_END: f64 = 9_223_372_036_854_775_808.0;
const U64_END: f64 = 18_446_744_073_709_551_616.0;

jit_abi! {
    fn f32_ceil(x: u64) -> u64 {
        f32_bits(f32_of(x).ceil())
    }

    fn f32_floor(x: u64) -> u64 {
        f32_bits(f32_of(x).floor())
    }

    fn f32_trunc(x: u64) -> u64 {
        f32_bits(f32_of(x).trunc())
    }

    fn f32_nearest(x: u64) -> u64 {
        f32_bits(f32_of(x).round_ties_even())
    }

    fn f64_ceil(x: u64) -> u64 {
        f64_bits(f64::from_bits(x).ceil())
    }

    fn f64_floor(x: u64) -> u64 {
        f64_bits(f64::from_bits(x).floor())
    }

    fn f64_trunc(x: u64) -> u64 {
        f64_bits(f64::from_bits(x).trunc())
    }

    fn f64_nearest(x: u64) -> u64 {
        f64_bits(f64::from_bits(x).round_ties_even())
    }

    // `min` and `max` propagate NaN and order -0.0 below +0.0, unlike the
    // SSE instructions.
    fn f32_min(a: u64, b: u64) -> u64 {
        let (a, b) = (f32_of(a), f32_of(b));
        f32_bits(if a.is_nan() || b.is_nan() {
            f32::NAN
        } else if a == b {
            f32::from_bits(a.to_bits() | b.to_bits())
        } else {
            a.min(b)
        })
    }

    fn f32_max(a: u64, b: u64) -> u64 {
        let (a, b) = (f32_of(a), f32_of(b));
        f32_bits(if a.is_nan() || b.is_nan() {
            f32::NAN
        } else if a == b {
            f32::from_bits(a.to_bits() & b.to_bits())
        } else {
            a.max(b)
        })
    }

    fn f64_min(a: u64, b: u64) -> u64 {
        let (a, b) = (f64::from_bits(a), f64::from_bits(b));
        f64_bits(if a.is_nan() || b.is_nan() {
            f64::NAN
        } else if a == b {
            f64::from_bits(a.to_bits() | b.to_bits())
        } else {
            a.min(b)
        })
    }

    fn f64_max(a: u64, b: u64) -> u64 {
        let (a, b) = (f64::from_bits(a), f64::from_bits(b));
        f64_bits(if a.is_nan() || b.is_nan() {
            f64::NAN
        } else if a == b {
            f64::from_bits(a.to_bits() & b.to_bits())
        } else {
            a.max(b)
        })
    }

    fn i32_clz(x: u64) -> u64 {
        u64::from((x as u32).leading_zeros())
    }

    fn i32_ctz(x: u64) -> u64 {
        u64::from((x as u32).trailing_zeros())
    }

    fn i32_popcnt(x: u64) -> u64 {
        u64::from((x as u32).count_ones())
    }

    fn i64_clz(x: u64) -> u64 {
        u64::from(x.leading_zeros())
    }

    fn i64_ctz(x: u64) -> u64 {
        u64::from(x.trailing_zeros())
    }

    fn i64_popcnt(x: u64) -> u64 {
        u64::from(x.count_ones())
    }

    fn f32_convert_i64_u(x: u64) -> u64 {
        f32_bits(x as f32)
    }

    fn f64_convert_i64_u(x: u64) -> u64 {
        f64_bits(x as f64)
    }

    fn i32_trunc_f32_s(vmctx: *mut VMContext, x: u64) -> u64 {
        trunc_checked(vmctx, f64::from(f32_of(x)), I32_MIN, I32_END)
            .map_or(0, |t| u64::from((t as i32).cast_unsigned()))
    }

    fn i32_trunc_f32_u(vmctx: *mut VMContext, x: u64) -> u64 {
        trunc_checked(vmctx, f64::from(f32_of(x)), 0.0, U32_END).map_or(0, |t| u64::from(t as u32))
    }

    fn i32_trunc_f64_s(vmctx: *mut VMContext, x: u64) -> u64 {
        trunc_checked(vmctx, f64::from_bits(x), I32_MIN, I32_END)
            .map_or(0, |t| u64::from((t as i32).cast_unsigned()))
    }

    fn i32_trunc_f64_u(vmctx: *mut VMContext, x: u64) -> u64 {
        trunc_checked(vmctx, f64::from_bits(x), 0.0, U32_END).map_or(0, |t| u64::from(t as u32))
    }

    fn i64_trunc_f32_s(vmctx: *mut VMContext, x: u64) -> u64 {
        trunc_checked(vmctx, f64::from(f32_of(x)), I64_MIN, I64_END)
            .map_or(0, |t| (t as i64).cast_unsigned())
    }

    fn i64_trunc_f32_u(vmctx: *mut VMContext, x: u64) -> u64 {
        trunc_checked(vmctx, f64::from(f32_of(x)), 0.0, U64_END).map_or(0, |t| t as u64)
    }

    fn i64_trunc_f64_s(vmctx: *mut VMContext, x: u64) -> u64 {
        trunc_checked(vmctx, f64::from_bits(x), I64_MIN, I64_END)
            .map_or(0, |t| (t as i64).cast_unsigned())
    }

    fn i64_trunc_f64_u(vmctx: *mut VMContext, x: u64) -> u64 {
        trunc_checked(vmctx, f64::from_bits(x), 0.0, U64_END).map_or(0, |t| t as u64)
    }

    // `as` casts from float to int already saturate and map NaN to zero.
    fn i32_trunc_sat_f32_s(x: u64) -> u64 {
        u64::from((f32_of(x) as i32).cast_unsigned())
    }

    fn i32_trunc_sat_f32_u(x: u64) -> u64 {
        u64::from(f32_of(x) as u32)
    }

    fn i32_trunc_sat_f64_s(x: u64) -> u64 {
        u64::from((f64::from_bits(x) as i32).cast_unsigned())
    }

    fn i32_trunc_sat_f64_u(x: u64) -> u64 {
        u64::from(f64::from_bits(x) as u32)
    }

    fn i64_trunc_sat_f32_s(x: u64) -> u64 {
        (f32_of(x) as i64).cast_unsigned()
    }

    fn i64_trunc_sat_f32_u(x: u64) -> u64 {
        f32_of(x) as u64
    }

    fn i64_trunc_sat_f64_s(x: u64) -> u64 {
        (f64::from_bits(x) as i64).cast_unsigned()
    }

    fn i64_trunc_sat_f64_u(x: u64) -> u64 {
        f64::from_bits(x) as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn f32b(x: f32) -> u64 {
        f32_bits(x)
    }

    #[test]
    fn min_max_zero_signs() {
        assert_eq!(f32_of(f32_min(f32b(-0.0), f32b(0.0))).to_bits(), (-0.0f32).to_bits());
        assert_eq!(f32_of(f32_max(f32b(-0.0), f32b(0.0))).to_bits(), 0.0f32.to_bits());
        assert_eq!(
            f64::from_bits(f64_min(0.0f64.to_bits(), (-0.0f64).to_bits())).to_bits(),
            (-0.0f64).to_bits()
        );
        assert_eq!(f64::from_bits(f64_max(1.5f64.to_bits(), (-3.0f64).to_bits())), 1.5);
    }

    #[test]
    fn min_max_propagate_nan() {
        assert!(f32_of(f32_min(f32b(f32::NAN), f32b(1.0))).is_nan());
        assert!(f32_of(f32_max(f32b(1.0), f32b(f32::NAN))).is_nan());
        assert!(f64::from_bits(f64_min(f64::NAN.to_bits(), 0)).is_nan());
    }

    #[test]
    fn rounding() {
        assert_eq!(f32_of(f32_nearest(f32b(2.5))), 2.0);
        assert_eq!(f32_of(f32_nearest(f32b(3.5))), 4.0);
        assert_eq!(f32_of(f32_nearest(f32b(-0.5))).to_bits(), (-0.0f32).to_bits());
        assert_eq!(f64::from_bits(f64_ceil(1.1f64.to_bits())), 2.0);
        assert_eq!(f64::from_bits(f64_floor((-1.1f64).to_bits())), -2.0);
        assert_eq!(f32_of(f32_trunc(f32b(-1.9))), -1.0);
    }

    #[test]
    fn bit_counting() {
        assert_eq!(i32_clz(1), 31);
        assert_eq!(i32_clz(0), 32);
        // only the low half is an i32
        assert_eq!(i32_ctz(0xFFFF_FFFF_0000_0000), 32);
        assert_eq!(i32_popcnt(0xFFFF_FFFF_0000_00FF), 8);
        assert_eq!(i64_clz(0), 64);
        assert_eq!(i64_ctz(1 << 40), 40);
        assert_eq!(i64_popcnt(u64::MAX), 64);
    }

    #[test]
    fn unsigned_conversions() {
        assert_eq!(f64::from_bits(f64_convert_i64_u(u64::MAX)), 18_446_744_073_709_551_616.0);
        assert_eq!(f32_of(f32_convert_i64_u(1 << 63)), 9_223_372_036_854_775_808.0);
    }

    #[test]
    fn checked_truncation() {
        let mut vmctx = VMContext::new();
        let ctx = &raw mut vmctx;

        assert_eq!(i32_trunc_f32_s(ctx, f32b(-1.9)), u64::from((-1i32).cast_unsigned()));
        assert_eq!(i32_trunc_f64_s(ctx, (-2_147_483_648.9f64).to_bits()), 0x8000_0000);
        assert_eq!(i32_trunc_f64_u(ctx, (-0.9f64).to_bits()), 0);
        assert_eq!(i64_trunc_f64_u(ctx, 1e19f64.to_bits()), 10_000_000_000_000_000_000);
        assert_eq!(vmctx.trap(), None);

        assert_eq!(i32_trunc_f32_u(&raw mut vmctx, f32b(-1.0)), 0);
        assert_eq!(vmctx.trap(), Some(TrapKind::IntegerOverflow));
        vmctx.clear_trap();

        assert_eq!(i32_trunc_f64_s(&raw mut vmctx, 2_147_483_648.0f64.to_bits()), 0);
        assert_eq!(vmctx.trap(), Some(TrapKind::IntegerOverflow));
        vmctx.clear_trap();

        assert_eq!(i64_trunc_f32_s(&raw mut vmctx, f32b(f32::NAN)), 0);
        assert_eq!(vmctx.trap(), Some(TrapKind::BadConversionToInteger));
        vmctx.clear_trap();

        assert_eq!(i64_trunc_f64_s(&raw mut vmctx, 9_223_372_036_854_775_808.0f64.to_bits()), 0);
        assert_eq!(vmctx.trap(), Some(TrapKind::IntegerOverflow));
    }

    #[test]
    fn saturating_truncation() {
        assert_eq!(i32_trunc_sat_f32_s(f32b(f32::NAN)), 0);
        assert_eq!(i32_trunc_sat_f32_s(f32b(3e10)), 0x7FFF_FFFF);
        assert_eq!(i32_trunc_sat_f64_u((-5.0f64).to_bits()), 0);
        assert_eq!(i64_trunc_sat_f64_s(f64::NEG_INFINITY.to_bits()), 0x8000_0000_0000_0000);
        assert_eq!(i64_trunc_sat_f32_u(f32b(f32::INFINITY)), u64::MAX);
    }

    #[test]
    fn addresses_are_distinct() {
        let all = [Builtin::F32Ceil, Builtin::F64Ceil, Builtin::I32TruncF32S, Builtin::I64Popcnt];
        for (i, a) in all.iter().enumerate() {
            assert_ne!(a.address(), 0);
            for b in &all[i + 1..] {
                assert_ne!(a.address(), b.address(), "{} and {}", a.name(), b.name());
            }
        }
    }
}

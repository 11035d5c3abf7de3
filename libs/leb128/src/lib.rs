// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Strict reading and writing of the "Little Endian Base 128" (LEB128)
//! variable length integer encoding, as used by the WebAssembly binary format.
//!
//! Unlike a general purpose LEB128 decoder, every read is parameterised by the
//! bit width `N` of the target integer and only accepts *bounded* encodings:
//!
//! - at most `ceil(N / 7)` bytes may be used, a longer encoding is rejected with
//!   [`Error::TooLong`],
//! - in the last permitted byte all payload bits above `N` must be zero
//!   (unsigned) or a copy of the sign bit (signed), otherwise the value is
//!   rejected with [`Error::Overflow`].
//!
//! ```
//! use leb128::{Leb128Read, Leb128Write};
//!
//! let mut buf = [0; 16];
//! {
//!     let mut writable = &mut buf[..];
//!     writable.write_sleb128(-12345).expect("Should write number");
//! }
//!
//! let mut readable = &buf[..];
//! let val = readable.read_var_s(32).expect("Should read number");
//! assert_eq!(val, -12345);
//! ```
//!
//! ```
//! use leb128::Leb128Read;
//!
//! // five bytes is the maximum for a 32-bit integer
//! let mut readable = &[0x80, 0x80, 0x80, 0x80, 0x80, 0x00][..];
//! assert!(matches!(readable.read_var_u(32), Err(leb128::Error::TooLong)));
//! ```
#![cfg_attr(not(test), no_std)]

extern crate alloc;

use alloc::vec::Vec;
use core::mem;

#[derive(Debug, PartialEq, Eq, onlyerror::Error)]
pub enum Error {
    /// The input ended in the middle of an integer.
    #[error("unexpected end of input")]
    UnexpectedEof,
    /// The last permitted byte carried bits that do not fit the target width.
    #[error("integer too large")]
    Overflow,
    /// The encoding used more bytes than the target width permits.
    #[error("integer representation too long")]
    TooLong,
    /// The output buffer is too small for the encoded value.
    #[error("not enough space in output buffer")]
    NotEnoughSpace,
}

type Result<T> = core::result::Result<T, Error>;

const CONTINUATION_BIT: u8 = 1 << 7;
const SIGN_BIT: u8 = 1 << 6;
const PAYLOAD_BITS: u32 = 7;

/// Maximum number of bytes an `N`-bit integer may occupy.
#[inline]
#[must_use]
pub const fn max_encoded_len(bits: u32) -> u32 {
    bits.div_ceil(PAYLOAD_BITS)
}

pub trait Leb128Read {
    #[doc(hidden)]
    fn read_byte(&mut self) -> Result<u8>;

    /// Reads an unsigned integer of `bits` width (`1..=64`).
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnexpectedEof`] when the input runs out, [`Error::TooLong`]
    /// when more than `ceil(bits / 7)` bytes are used and [`Error::Overflow`] when
    /// the value does not fit in `bits`.
    fn read_var_u(&mut self, bits: u32) -> Result<u64> {
        debug_assert!((1..=64).contains(&bits));

        let max_bytes = max_encoded_len(bits);
        let mut result = 0u64;

        for i in 0..max_bytes {
            let byte = self.read_byte()?;
            let payload = low_bits_of_byte(byte);
            let shift = i * PAYLOAD_BITS;

            if i == max_bytes - 1 {
                if byte & CONTINUATION_BIT != 0 {
                    return Err(Error::TooLong);
                }
                // bits of the last byte that still belong to the value
                let used = bits - shift;
                if u32::from(payload) >> used != 0 {
                    return Err(Error::Overflow);
                }
            }

            result |= u64::from(payload) << shift;

            if byte & CONTINUATION_BIT == 0 {
                return Ok(result);
            }
        }

        unreachable!("the last permitted byte always terminates the loop")
    }

    /// Reads a two's complement signed integer of `bits` width (`1..=64`).
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnexpectedEof`] when the input runs out, [`Error::TooLong`]
    /// when more than `ceil(bits / 7)` bytes are used and [`Error::Overflow`] when
    /// the unused bits of the last byte are not a sign extension.
    fn read_var_s(&mut self, bits: u32) -> Result<i64> {
        debug_assert!((1..=64).contains(&bits));

        let max_bytes = max_encoded_len(bits);
        let mut result = 0i64;
        let mut shift = 0;

        for i in 0..max_bytes {
            let byte = self.read_byte()?;
            let payload = low_bits_of_byte(byte);

            if i == max_bytes - 1 {
                if byte & CONTINUATION_BIT != 0 {
                    return Err(Error::TooLong);
                }
                // the sign bit of the value and every bit above it must agree
                let used = bits - shift;
                let sign_and_unused = (0x7f_u8 << (used - 1)) & 0x7f;
                let tail = payload & sign_and_unused;
                if tail != 0 && tail != sign_and_unused {
                    return Err(Error::Overflow);
                }
            }

            result |= i64::from(payload) << shift;
            shift += PAYLOAD_BITS;

            if byte & CONTINUATION_BIT == 0 {
                if shift < i64::BITS && payload & SIGN_BIT == SIGN_BIT {
                    // Sign extend the result.
                    result |= !0 << shift;
                }
                return Ok(result);
            }
        }

        unreachable!("the last permitted byte always terminates the loop")
    }

    /// Reads an unsigned 64-bit integer.
    ///
    /// # Errors
    ///
    /// See [`Leb128Read::read_var_u`].
    fn read_uleb128(&mut self) -> Result<u64> {
        self.read_var_u(64)
    }

    /// Reads a signed 64-bit integer.
    ///
    /// # Errors
    ///
    /// See [`Leb128Read::read_var_s`].
    fn read_sleb128(&mut self) -> Result<i64> {
        self.read_var_s(64)
    }
}

impl Leb128Read for &[u8] {
    fn read_byte(&mut self) -> Result<u8> {
        let (byte, rest) = self.split_first().ok_or(Error::UnexpectedEof)?;
        *self = rest;
        Ok(*byte)
    }
}

pub trait Leb128Write {
    /// Writes a single raw byte.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotEnoughSpace`] when the destination is full.
    fn write_byte(&mut self, val: u8) -> Result<()>;

    /// Writes `val` using the shortest unsigned encoding and returns the number
    /// of bytes written.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotEnoughSpace`] when the destination is full.
    fn write_uleb128(&mut self, mut val: u64) -> Result<usize> {
        let mut bytes_written = 0;
        loop {
            let mut byte = low_bits_of_u64(val);
            val >>= 7;
            if val != 0 {
                // More bytes to come, so set the continuation bit.
                byte |= CONTINUATION_BIT;
            }

            self.write_byte(byte)?;
            bytes_written += 1;

            if val == 0 {
                return Ok(bytes_written);
            }
        }
    }

    /// Writes `val` using the shortest signed encoding and returns the number
    /// of bytes written.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotEnoughSpace`] when the destination is full.
    fn write_sleb128(&mut self, mut val: i64) -> Result<usize> {
        let mut bytes_written = 0;
        loop {
            let mut byte = low_bits_of_u64(val.cast_unsigned());
            // Keep the sign bit for testing
            val >>= 6;
            let done = val == 0 || val == -1;
            if done {
                byte &= !CONTINUATION_BIT;
            } else {
                // Remove the sign bit
                val >>= 1;
                // More bytes to come, so set the continuation bit.
                byte |= CONTINUATION_BIT;
            }

            self.write_byte(byte)?;
            bytes_written += 1;

            if done {
                return Ok(bytes_written);
            }
        }
    }
}

impl Leb128Write for &mut [u8] {
    #[inline]
    fn write_byte(&mut self, val: u8) -> Result<()> {
        let (a, b) = mem::take(self)
            .split_first_mut()
            .ok_or(Error::NotEnoughSpace)?;
        *a = val;
        *self = b;
        Ok(())
    }
}

impl Leb128Write for Vec<u8> {
    #[inline]
    fn write_byte(&mut self, val: u8) -> Result<()> {
        self.push(val);
        Ok(())
    }
}

#[inline]
fn low_bits_of_byte(byte: u8) -> u8 {
    byte & !CONTINUATION_BIT
}

#[inline]
fn low_bits_of_u64(val: u64) -> u8 {
    let byte = val & u64::from(u8::MAX);
    #[expect(clippy::cast_possible_truncation, reason = "masked to a byte above")]
    low_bits_of_byte(byte as u8)
}

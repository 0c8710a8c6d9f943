//! Byte-cursor encoding of the integers and floats stored in pages.
//!
//! Integers use the variable-length byte encoding ("vbyte") of [commonware_codec::varint]:
//! 7 bits of the value per byte, least significant group first, with the high bit set on every
//! byte but the last.
//!
//! Floats are stored with a reduced, caller-selected precision: one byte holds the binary
//! exponent (with the sign of the exponent folded into its lowest bit) and `ceil((p + 1) / 8)`
//! little-endian bytes hold `p` bits of the fraction followed by the sign of the value in the
//! lowest bit.
//!
//! Every read reports exhaustion of the underlying buffer as [Error::EndOfBuffer] so that
//! callers can detect the end of a page.

use bytes::{Buf, BufMut};
use commonware_codec::{varint::UInt, EncodeSize, Read, Write};
use thiserror::Error;

const BITS_PER_BYTE: usize = 8;

/// Largest number of bytes a vbyte-encoded `u64` may occupy.
pub const MAX_VBYTE_SIZE: usize = 10;

/// Errors that can occur when decoding from a buffer.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("unexpected end of buffer")]
    EndOfBuffer,
    #[error("invalid vbyte")]
    InvalidVbyte,
    #[error("invalid data: {0}")]
    InvalidData(&'static str),
}

impl From<commonware_codec::Error> for Error {
    fn from(err: commonware_codec::Error) -> Self {
        match err {
            commonware_codec::Error::EndOfBuffer => Self::EndOfBuffer,
            commonware_codec::Error::InvalidVarint(_) => Self::InvalidVbyte,
            _ => Self::InvalidData("unexpected varint error"),
        }
    }
}

/// Encodes an unsigned integer as a vbyte.
pub fn write_vbyte(value: u64, buf: &mut impl BufMut) {
    UInt(value).write(buf);
}

/// Decodes an unsigned integer from a vbyte.
pub fn read_vbyte(buf: &mut impl Buf) -> Result<u64, Error> {
    Ok(UInt::<u64>::read_cfg(buf, &())?.0)
}

/// Decodes a vbyte that must fit in a `u32`.
pub fn read_vbyte_u32(buf: &mut impl Buf) -> Result<u32, Error> {
    Ok(UInt::<u32>::read_cfg(buf, &())?.0)
}

/// Returns the number of bytes `value` occupies once vbyte-encoded.
pub fn vbyte_size(value: u64) -> usize {
    UInt(value).encode_size()
}

/// Splits `len` bytes off the front of `buf` without copying.
pub fn read_slice<'a>(buf: &mut &'a [u8], len: usize) -> Result<&'a [u8], Error> {
    if buf.len() < len {
        return Err(Error::EndOfBuffer);
    }
    let (head, tail) = buf.split_at(len);
    *buf = tail;
    Ok(head)
}

/// Returns the number of bytes a float encoded with `precision` fraction bits occupies.
pub const fn float_size(precision: u32) -> usize {
    1 + (precision as usize + 1).div_ceil(BITS_PER_BYTE)
}

// The exponent byte stores `|exp| << 1 | (exp < 0)`, so only exponents within this range fit.
const MAX_EXPONENT: i32 = 127;

fn fraction_mask(precision: u32) -> u64 {
    (1u64 << precision) - 1
}

/// Splits a finite float into a fraction in `[0.5, 1)` (carrying the sign) and a power of two.
fn frexp(value: f32) -> (f32, i32) {
    if value == 0.0 || !value.is_finite() {
        return (value, 0);
    }
    let bits = value.to_bits();
    let biased = ((bits >> 23) & 0xff) as i32;
    if biased == 0 {
        // Subnormal: scale into the normal range first.
        let (frac, exp) = frexp(value * f32::from_bits(0x5f80_0000)); // 2^64
        return (frac, exp - 64);
    }
    let frac = f32::from_bits((bits & 0x807f_ffff) | (126 << 23));
    (frac, biased - 126)
}

/// Quantizes `value` into an exponent byte and a signed fraction.
fn split(value: f32, precision: u32) -> (u8, u64) {
    let mask = fraction_mask(precision);
    let (frac, mut exp) = frexp(value);
    if frac == 0.0 || exp < -MAX_EXPONENT {
        return (0, 0);
    }

    // Round to nearest, but never up to `mask` itself: a fraction of exactly 1.0 would
    // renormalize into the next exponent when re-encoded.
    let mut quant = ((frac.abs() as f64) * (mask as f64)).round() as u64;
    quant = quant.min(mask - 1);
    if exp > MAX_EXPONENT {
        exp = MAX_EXPONENT;
        quant = mask - 1;
    }

    let exp_byte = if exp >= 0 {
        (exp as u8) << 1
    } else {
        ((-exp) as u8) << 1 | 1
    };
    (exp_byte, quant << 1 | (frac < 0.0) as u64)
}

/// Encodes `value` with `precision` bits of fraction.
///
/// Non-finite values encode as zero; callers reject them before reaching the codec.
pub fn write_float(value: f32, precision: u32, buf: &mut impl BufMut) {
    let (exp_byte, mut quant) = split(value, precision);
    buf.put_u8(exp_byte);
    for _ in 1..float_size(precision) {
        buf.put_u8(quant as u8);
        quant >>= BITS_PER_BYTE;
    }
}

/// Decodes a float encoded with `precision` bits of fraction.
pub fn read_float(buf: &mut impl Buf, precision: u32) -> Result<f32, Error> {
    let size = float_size(precision);
    if buf.remaining() < size {
        return Err(Error::EndOfBuffer);
    }
    let exp_byte = buf.get_u8();
    let mut quant = 0u64;
    for i in 0..size - 1 {
        quant |= (buf.get_u8() as u64) << (i * BITS_PER_BYTE);
    }
    Ok(join(exp_byte, quant, precision))
}

fn join(exp_byte: u8, quant: u64, precision: u32) -> f32 {
    let exp = if exp_byte & 1 == 1 {
        -((exp_byte >> 1) as i32)
    } else {
        (exp_byte >> 1) as i32
    };
    let mut frac = ((quant >> 1) & fraction_mask(precision)) as f64 / fraction_mask(precision) as f64;
    if quant & 1 == 1 {
        frac = -frac;
    }
    (frac * 2f64.powi(exp)) as f32
}

/// Returns the value `value` decodes to after being encoded with `precision` bits.
pub fn quantize(value: f32, precision: u32) -> f32 {
    let (exp_byte, quant) = split(value, precision);
    join(exp_byte, quant, precision)
}

//! Operand and operator encodings shared by DICT data and Type 2 charstrings.
//!
//! Refer to Table 3 (Operand Encoding) and Table 5 (Nibble Definitions) of Technical Note #5176
//! and section 3.2 of Technical Note #5177.

use std::convert::TryFrom;

use tinyvec::TinyVec;

use crate::binary::read::ReadCtxt;
use crate::binary::write::{WriteBinary, WriteContext};
use crate::binary::{I16Be, I32Be, U8};
use crate::error::{ParseError, WriteError};

pub const TWO_BYTE_OPERATOR_MARK: u8 = 12;
pub const SHORT_INT: u8 = 28;
pub const LONG_INT: u8 = 29;
pub const REAL: u8 = 30;
pub const FIXED_16_16: u8 = 255;

/// Two byte operators are given the logical code `ESCAPE_BASE + second byte`.
pub const ESCAPE_BASE: u16 = 1200;

pub(crate) const END_OF_FLOAT_FLAG: u8 = 0xf;
const FLOAT_BUF_LEN: usize = 64;

// On a corpus of 23945 CFF fonts real values were encountered as follows:
//     572 2 bytes
//     776 3 bytes
//    1602 4 bytes
//   14037 5 bytes
//    3491 6 bytes
//      36 7 bytes
// Using 7 bytes for the tiny vec covers all these and allows Operand to be 8 bytes on 64-bit
// systems.

/// A real number, held as the packed nibbles that follow the `30` prefix byte, up to and
/// including the byte holding the end of number nibble.
///
/// To parse the value into `f64` use the `TryFrom`/`TryInto` impl.
#[derive(Debug, PartialEq, Clone)]
pub struct Real(pub(crate) TinyVec<[u8; 7]>);

impl Real {
    pub fn nibbles(&self) -> &[u8] {
        &self.0
    }
}

/// Read an integer in any of the five integer encodings.
pub fn read_int(ctxt: &mut ReadCtxt<'_>) -> Result<i32, ParseError> {
    let b0 = ctxt.read_u8()?;
    int_operand(ctxt, b0)
}

/// Decode the remainder of an integer whose first byte, `b0`, has already been read.
pub fn int_operand(ctxt: &mut ReadCtxt<'_>, b0: u8) -> Result<i32, ParseError> {
    match b0 {
        SHORT_INT => Ok(i32::from(ctxt.read_i16be()?)),
        LONG_INT => Ok(ctxt.read_i32be()?),
        32..=246 => Ok(i32::from(b0) - 139),
        247..=250 => {
            let b1 = ctxt.read_u8()?;
            Ok((i32::from(b0) - 247) * 256 + i32::from(b1) + 108)
        }
        251..=254 => {
            let b1 = ctxt.read_u8()?;
            Ok(-(i32::from(b0) - 251) * 256 - i32::from(b1) - 108)
        }
        _ => Err(ParseError::BadPrimitive),
    }
}

/// Read a 16.16 fixed point number including its `255` prefix.
pub fn read_fixed(ctxt: &mut ReadCtxt<'_>) -> Result<i32, ParseError> {
    match ctxt.read_u8()? {
        FIXED_16_16 => fixed_operand(ctxt),
        _ => Err(ParseError::BadPrimitive),
    }
}

/// Decode the 32-bit body of a fixed point number after its prefix has been read.
pub fn fixed_operand(ctxt: &mut ReadCtxt<'_>) -> Result<i32, ParseError> {
    Ok(ctxt.read_i32be()?)
}

/// Read a real number including its `30` prefix.
pub fn read_real(ctxt: &mut ReadCtxt<'_>) -> Result<Real, ParseError> {
    match ctxt.read_u8()? {
        REAL => real_operand(ctxt),
        _ => Err(ParseError::BadPrimitive),
    }
}

/// Decode the nibbles of a real number after its prefix has been read.
///
/// The nibbles are validated so that a `Real` always converts to `f64`.
pub fn real_operand(ctxt: &mut ReadCtxt<'_>) -> Result<Real, ParseError> {
    let nibbles = ctxt.read_until_nibble(END_OF_FLOAT_FLAG)?;
    let real = Real(TinyVec::from(nibbles));
    f64::try_from(real.clone())?;
    Ok(real)
}

/// Read a one or two byte operator.
pub fn read_operator(ctxt: &mut ReadCtxt<'_>) -> Result<u16, ParseError> {
    let b0 = ctxt.read_u8()?;
    operator(ctxt, b0)
}

/// Decode an operator whose first byte, `b0`, has already been read.
///
/// Two byte operators map to `1200 + second byte`.
pub fn operator(ctxt: &mut ReadCtxt<'_>, b0: u8) -> Result<u16, ParseError> {
    match b0 {
        TWO_BYTE_OPERATOR_MARK => Ok(ESCAPE_BASE + u16::from(ctxt.read_u8()?)),
        SHORT_INT => Err(ParseError::BadPrimitive),
        0..=31 => Ok(u16::from(b0)),
        _ => Err(ParseError::BadPrimitive),
    }
}

/// Write `val` using the shortest integer encoding that holds it.
pub fn write_int<C: WriteContext>(ctxt: &mut C, val: i32) -> Result<(), WriteError> {
    match val {
        // NOTE: Casts are safe due to patterns limiting range
        -107..=107 => U8::write(ctxt, (val + 139) as u8),
        108..=1131 => {
            let val = val - 108;
            U8::write(ctxt, ((val >> 8) + 247) as u8)?;
            U8::write(ctxt, val as u8)
        }
        -1131..=-108 => {
            let val = -val - 108;
            U8::write(ctxt, ((val >> 8) + 251) as u8)?;
            U8::write(ctxt, val as u8)
        }
        -32768..=32767 => write_short_int(ctxt, val as i16),
        _ => write_full_int(ctxt, val),
    }
}

/// Write `val` in the three byte form.
pub fn write_short_int<C: WriteContext>(ctxt: &mut C, val: i16) -> Result<(), WriteError> {
    U8::write(ctxt, SHORT_INT)?;
    I16Be::write(ctxt, val)
}

/// Write `val` in the five byte form.
///
/// The size of this form does not depend on `val`, which makes it suitable for offsets that
/// are only known once everything around them has been laid out.
pub fn write_full_int<C: WriteContext>(ctxt: &mut C, val: i32) -> Result<(), WriteError> {
    U8::write(ctxt, LONG_INT)?;
    I32Be::write(ctxt, val)
}

pub fn write_fixed<C: WriteContext>(ctxt: &mut C, val: i32) -> Result<(), WriteError> {
    U8::write(ctxt, FIXED_16_16)?;
    I32Be::write(ctxt, val)
}

pub fn write_real<C: WriteContext>(ctxt: &mut C, real: &Real) -> Result<(), WriteError> {
    U8::write(ctxt, REAL)?;
    ctxt.write_bytes(&real.0)
}

pub fn write_operator<C: WriteContext>(ctxt: &mut C, op: u16) -> Result<(), WriteError> {
    if op >= ESCAPE_BASE {
        let op2 = u8::try_from(op - ESCAPE_BASE)?;
        U8::write(ctxt, TWO_BYTE_OPERATOR_MARK)?;
        U8::write(ctxt, op2)
    } else if op <= 31 && op != u16::from(SHORT_INT) && op != u16::from(TWO_BYTE_OPERATOR_MARK) {
        U8::write(ctxt, op as u8)
    } else {
        Err(WriteError::BadValue)
    }
}

// Portions of this try_from impl derived from ttf-parser, licenced under Apache-2.0.
// https://github.com/RazrFalcon/ttf-parser/blob/ba2d9c8b9a207951b7b07e9481bc74688762bd21/src/tables/cff/dict.rs#L188
impl TryFrom<Real> for f64 {
    type Error = ParseError;

    /// Try to parse this `Real` into an `f64`.
    fn try_from(real: Real) -> Result<Self, Self::Error> {
        let mut buf = [0u8; FLOAT_BUF_LEN];
        let mut used = 0;

        for byte in real.0 {
            let nibble1 = byte >> 4;
            let nibble2 = byte & 0xF;

            if nibble1 == END_OF_FLOAT_FLAG {
                break;
            }
            parse_float_nibble(nibble1, &mut used, &mut buf)?;
            if nibble2 == END_OF_FLOAT_FLAG {
                break;
            }
            parse_float_nibble(nibble2, &mut used, &mut buf)?;
        }

        let s = core::str::from_utf8(&buf[..used]).map_err(|_| ParseError::BadPrimitive)?;
        s.parse().map_err(|_| ParseError::BadPrimitive)
    }
}

impl TryFrom<f64> for Real {
    type Error = WriteError;

    /// Encode `value` as packed nibbles, padding with an end of number nibble.
    ///
    /// The shorter of the positional and exponent forms is used so very large and very small
    /// values stay within what `read_real` accepts.
    fn try_from(value: f64) -> Result<Self, Self::Error> {
        if !value.is_finite() {
            return Err(WriteError::BadValue);
        }

        let positional = float_nibbles(&format!("{}", value))?;
        let exponent = float_nibbles(&format!("{:e}", value))?;
        let mut nibbles = if exponent.len() < positional.len() {
            exponent
        } else {
            positional
        };
        nibbles.push(END_OF_FLOAT_FLAG);
        if nibbles.len() % 2 == 1 {
            nibbles.push(END_OF_FLOAT_FLAG);
        }

        Ok(Real(
            nibbles
                .chunks(2)
                .map(|pair| (pair[0] << 4) | pair[1])
                .collect(),
        ))
    }
}

fn float_nibbles(text: &str) -> Result<Vec<u8>, WriteError> {
    let mut nibbles = Vec::with_capacity(text.len() + 2);
    let mut chars = text.bytes().peekable();
    while let Some(c) = chars.next() {
        let nibble = match c {
            b'0'..=b'9' => c - b'0',
            b'.' => 0xa,
            b'e' | b'E' if chars.peek() == Some(&b'-') => {
                chars.next();
                0xc
            }
            b'e' | b'E' => 0xb,
            b'-' => 0xe,
            _ => return Err(WriteError::BadValue),
        };
        nibbles.push(nibble);
    }
    Ok(nibbles)
}

// Adobe Technical Note #5176, Table 5 Nibble Definitions
fn parse_float_nibble(nibble: u8, idx: &mut usize, data: &mut [u8]) -> Result<(), ParseError> {
    if *idx == FLOAT_BUF_LEN {
        return Err(ParseError::LimitExceeded);
    }

    match nibble {
        0..=9 => {
            data[*idx] = b'0' + nibble;
        }
        10 => {
            data[*idx] = b'.';
        }
        11 => {
            data[*idx] = b'E';
        }
        12 => {
            if *idx + 1 == FLOAT_BUF_LEN {
                return Err(ParseError::LimitExceeded);
            }

            data[*idx] = b'E';
            *idx += 1;
            data[*idx] = b'-';
        }
        14 => {
            data[*idx] = b'-';
        }
        _ => return Err(ParseError::BadPrimitive),
    }

    *idx += 1;
    Ok(())
}

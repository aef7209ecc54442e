//! Tokenising of Type 2 charstrings.
//!
//! Refer to Adobe Technical Note #5177, The Type 2 Charstring Format. Charstrings are only
//! tokenised here, not executed. The tokens are enough to find subroutine calls and rewrite the
//! operands that select the subroutine.

use std::convert::TryFrom;

use tinyvec::TinyVec;

use crate::binary::read::ReadScope;
use crate::binary::write::{WriteBinary, WriteBuffer, WriteContext};
use crate::error::{ParseError, WriteError};

use super::primitive;
use super::SubroutineKind;

/// Operators defined in Adobe Technical Note #5177, The Type 2 Charstring Format.
pub mod operator {
    pub const HORIZONTAL_STEM: u16 = 1;
    pub const VERTICAL_STEM: u16 = 3;
    pub const CALL_LOCAL_SUBROUTINE: u16 = 10;
    pub const RETURN: u16 = 11;
    pub const ENDCHAR: u16 = 14;
    pub const HORIZONTAL_STEM_HINT_MASK: u16 = 18;
    pub const HINT_MASK: u16 = 19;
    pub const COUNTER_MASK: u16 = 20;
    pub const MOVE_TO: u16 = 21;
    pub const VERTICAL_STEM_HINT_MASK: u16 = 23;
    pub const CALL_GLOBAL_SUBROUTINE: u16 = 29;
}

/// One lexeme of a charstring.
#[derive(Debug, Clone, PartialEq)]
pub enum Token {
    /// One or two byte operator. Two byte operators are `1200 + second byte`.
    Operator(u16),
    /// `hintmask` or `cntrmask` with the mask bytes that follow it.
    Mask(u16, TinyVec<[u8; 4]>),
    /// Integer in one of the compact one or two byte encodings, or a rewritten operand.
    Integer(i32),
    /// Integer that was encoded with the `28` prefix.
    ShortInt(i16),
    /// 16.16 fixed point number.
    Fixed(i32),
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct CharString {
    tokens: Vec<Token>,
}

/// A call to a subroutine found in a charstring.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct SubroutineCall {
    pub kind: SubroutineKind,
    /// Token position and value of the integer immediately preceding the call operator.
    ///
    /// `None` when the subroutine number is not a literal integer.
    pub operand: Option<(usize, i32)>,
}

// Adobe Technical Note #5176, Chapter 16 "Local / Global Subrs INDEXes"
/// Calculate the bias added to subroutine numbers for an INDEX holding `count` subroutines.
pub fn subr_bias(count: usize) -> i32 {
    if count < 1240 {
        107
    } else if count < 33900 {
        1131
    } else {
        32768
    }
}

fn mask_len(stems: usize) -> usize {
    ((stems + 7) / 8).max(1)
}

impl Token {
    /// The value of this token if it is an integer.
    pub fn integer(&self) -> Option<i32> {
        match *self {
            Token::Integer(val) => Some(val),
            Token::ShortInt(val) => Some(i32::from(val)),
            _ => None,
        }
    }
}

impl CharString {
    /// Split `data` into tokens.
    ///
    /// The number of mask bytes following `hintmask` and `cntrmask` is derived from every stem
    /// operator that precedes it in `data`.
    pub fn parse(data: &[u8]) -> Result<CharString, ParseError> {
        let mut ctxt = ReadScope::new(data).ctxt();
        let mut tokens = Vec::new();
        let mut stems = 0;

        while ctxt.bytes_available() {
            let b0 = ctxt.read_u8()?;
            let token = match b0 {
                primitive::SHORT_INT => Token::ShortInt(ctxt.read_i16be()?),
                32..=254 => Token::Integer(primitive::int_operand(&mut ctxt, b0)?),
                primitive::FIXED_16_16 => Token::Fixed(primitive::fixed_operand(&mut ctxt)?),
                _ => match primitive::operator(&mut ctxt, b0)? {
                    op @ (operator::HORIZONTAL_STEM
                    | operator::VERTICAL_STEM
                    | operator::HORIZONTAL_STEM_HINT_MASK
                    | operator::VERTICAL_STEM_HINT_MASK) => {
                        stems += 1;
                        Token::Operator(op)
                    }
                    op @ (operator::HINT_MASK | operator::COUNTER_MASK) => {
                        let mask = ctxt.read_slice(mask_len(stems))?;
                        Token::Mask(op, TinyVec::from(mask))
                    }
                    op => Token::Operator(op),
                },
            };
            tokens.push(token);
        }

        Ok(CharString { tokens })
    }

    pub fn tokens(&self) -> &[Token] {
        &self.tokens
    }

    /// Iterate over the `callsubr` and `callgsubr` operators in this charstring.
    pub fn subroutine_calls(&self) -> impl Iterator<Item = SubroutineCall> + '_ {
        self.tokens
            .iter()
            .enumerate()
            .filter_map(move |(position, token)| {
                let kind = match token {
                    Token::Operator(operator::CALL_LOCAL_SUBROUTINE) => SubroutineKind::Local,
                    Token::Operator(operator::CALL_GLOBAL_SUBROUTINE) => SubroutineKind::Global,
                    _ => return None,
                };
                let operand = position.checked_sub(1).and_then(|prev| {
                    self.tokens[prev].integer().map(|value| (prev, value))
                });
                Some(SubroutineCall { kind, operand })
            })
    }

    /// Replace the integer token at `position` with `value`.
    ///
    /// The token keeps its original encoding when `value` is unchanged.
    pub fn set_operand(&mut self, position: usize, value: i32) -> Result<(), WriteError> {
        let token = self.tokens.get_mut(position).ok_or(WriteError::BadValue)?;
        match token.integer() {
            Some(current) if current == value => Ok(()),
            Some(_) => {
                i16::try_from(value)?;
                *token = Token::Integer(value);
                Ok(())
            }
            None => Err(WriteError::BadValue),
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, WriteError> {
        let mut buffer = WriteBuffer::new();
        CharString::write(&mut buffer, self)?;
        Ok(buffer.into_inner())
    }
}

impl WriteBinary<&Self> for Token {
    type Output = ();

    fn write<C: WriteContext>(ctxt: &mut C, token: &Token) -> Result<(), WriteError> {
        match token {
            Token::Operator(op) => primitive::write_operator(ctxt, *op),
            Token::Mask(op, mask) => {
                primitive::write_operator(ctxt, *op)?;
                ctxt.write_bytes(mask)
            }
            // Charstrings have no five byte integer encoding, byte 29 is callgsubr
            Token::Integer(val) => {
                i16::try_from(*val)?;
                primitive::write_int(ctxt, *val)
            }
            Token::ShortInt(val) => primitive::write_short_int(ctxt, *val),
            Token::Fixed(val) => primitive::write_fixed(ctxt, *val),
        }
    }
}

impl WriteBinary<&Self> for CharString {
    type Output = ();

    fn write<C: WriteContext>(ctxt: &mut C, charstring: &CharString) -> Result<(), WriteError> {
        for token in &charstring.tokens {
            Token::write(ctxt, token)?;
        }
        Ok(())
    }
}

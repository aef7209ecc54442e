//! CFF font handling.
//!
//! Refer to [Technical Note #5176](http://wwwimages.adobe.com/content/dam/Adobe/en/devnet/font/pdfs/5176.CFF.pdf)
//! for more information.

use std::convert::TryFrom;
use std::fmt;
use std::iter;

use byteorder::{BigEndian, ByteOrder};
use itertools::Itertools;
use log::warn;

use crate::binary::read::{ReadBinary, ReadBinaryDep, ReadCtxt, ReadScope};
use crate::binary::write::{self, WriteBinary, WriteBinaryDep, WriteBuffer, WriteContext};
use crate::binary::{long_align, U16Be, U24Be, U32Be, U8};
use crate::error::{ParseError, WriteError};

pub mod charstring;
pub mod primitive;
mod subset;

pub use primitive::Real;
pub use subset::{subset_cff, SubsetCFF};

// CFF Spec: An operator may be preceded by up to a maximum of 48 operands.
const MAX_OPERANDS: usize = 48;

/// A parsed CFF font program, typically read from a PDF `FontFile3` stream or an OpenType `CFF `
/// table.
///
/// Only the structures needed to subset the font are decoded. Everything else is carried through
/// untouched.
#[derive(Clone, Debug, PartialEq)]
pub struct CFF {
    pub header: Header,
    pub name_index: Index,
    pub top_dict: TopDict,
    pub string_index: Index,
    pub global_subr_index: Index,
    pub char_strings_index: Option<Index>,
    pub charset: Option<Charset>,
    /// Present only in CID-keyed fonts.
    pub fd_select: Option<FDSelect>,
    /// Present only in CID-keyed fonts.
    pub font_dicts: Option<Vec<FontDict>>,
    /// One slot per Font DICT for CID-keyed fonts, otherwise a single slot for the Top DICT's
    /// Private DICT.
    pub privates: Vec<Option<Private>>,
}

/// CFF Font Header described in Section 6 of Technical Note #5176
#[derive(Clone, Debug, PartialEq)]
pub struct Header {
    pub major: u8,
    pub minor: u8,
    pub hdr_size: u8,
    pub off_size: u8,
}

/// A CFF INDEX described in Section 5 of Technical Note #5176
#[derive(Clone, Debug, PartialEq, Default)]
pub struct Index {
    data: Vec<Vec<u8>>,
}

/// A CFF DICT described in Section 4 of Technical Note #5176
///
/// Entries are kept in the order they were read or inserted.
#[derive(Clone, Debug, PartialEq, Default)]
pub struct Dict {
    dict: Vec<(Operator, Vec<Operand>)>,
}

pub type TopDict = Dict;

pub type FontDict = Dict;

pub type PrivateDict = Dict;

/// A collection of offset changes to a `Dict`
///
/// `DictDelta` only accepts Operators with offsets as operands.
#[derive(Clone, Debug, PartialEq, Default)]
pub struct DictDelta {
    dict: Vec<(Operator, Vec<Operand>)>,
    omit: Vec<Operator>,
}

/// A Private DICT and the Local Subr INDEX it refers to.
#[derive(Clone, Debug, PartialEq, Default)]
pub struct Private {
    pub dict: PrivateDict,
    pub local_subr_index: Option<Index>,
}

type SID = u16;

/// A Range from `first` to `first + n_left`
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct Range<F, N> {
    pub first: F,
    pub n_left: N,
}

/// A format 2 charset described in Section 13 of Technical Note #5176
///
/// Maps glyph ids to SIDs (name-keyed fonts) or CIDs (CID-keyed fonts). Glyph 0 is implicitly
/// mapped to 0 and not stored.
#[derive(Clone, Debug, PartialEq)]
pub struct Charset {
    ranges: Vec<Range<SID, u16>>,
}

/// Font DICT select as described in Section 19 of Technical Note #5176
///
/// Only format 3 is supported.
#[derive(Clone, Debug, PartialEq)]
pub struct FDSelect {
    ranges: Vec<FDRange>,
    sentinel: u16,
}

/// The first glyph of a run of glyphs using the same Font DICT.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct FDRange {
    pub first: u16,
    pub font_dict_index: u8,
}

/// CFF DICT operator
#[derive(Debug, PartialEq)]
enum Op {
    Operator(Operator),
    Operand(Operand),
}

/// CFF operand to an operator
#[derive(Debug, PartialEq, Clone)]
pub enum Operand {
    Integer(i32),
    /// An integer that holds an offset. Always written in the five byte form.
    Offset(i32),
    Real(Real),
}

/// CFF DICT operator.
///
/// Two byte operators have the value `1200 + second byte`.
#[derive(Debug, PartialEq, Eq, Copy, Clone, Hash)]
pub struct Operator(pub u16);

const fn op2(value: u8) -> Operator {
    Operator(primitive::ESCAPE_BASE + value as u16)
}

impl Operator {
    pub const VERSION: Operator = Operator(0);
    pub const NOTICE: Operator = Operator(1);
    pub const FULL_NAME: Operator = Operator(2);
    pub const FAMILY_NAME: Operator = Operator(3);
    pub const WEIGHT: Operator = Operator(4);
    pub const FONT_BBOX: Operator = Operator(5);
    pub const BLUE_VALUES: Operator = Operator(6);
    pub const STD_HW: Operator = Operator(10);
    pub const STD_VW: Operator = Operator(11);
    pub const CHARSET: Operator = Operator(15);
    pub const ENCODING: Operator = Operator(16);
    pub const CHAR_STRINGS: Operator = Operator(17);
    pub const PRIVATE: Operator = Operator(18);
    pub const SUBRS: Operator = Operator(19);
    pub const DEFAULT_WIDTH_X: Operator = Operator(20);
    pub const NOMINAL_WIDTH_X: Operator = Operator(21);
    pub const IS_FIXED_PITCH: Operator = op2(1);
    pub const FONT_MATRIX: Operator = op2(7);
    pub const SYNTHETIC_BASE: Operator = op2(20);
    pub const ROS: Operator = op2(30);
    pub const CID_COUNT: Operator = op2(34);
    pub const FD_ARRAY: Operator = op2(36);
    pub const FD_SELECT: Operator = op2(37);
    pub const FONT_NAME: Operator = op2(38);
}

/// Errors that can occur when reading, subsetting, or writing a CFF font.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CFFError {
    /// Bytes in `table` are not a valid operand, operator, or real number encoding.
    MalformedPrimitive { table: Table, offset: usize },
    /// `table` violates the structure of a CFF font.
    MalformedFont {
        table: Table,
        offset: usize,
        cause: ParseError,
    },
    /// The font is valid CFF but uses a feature that is not handled.
    UnsupportedFeature(Unsupported),
    /// A subroutine call refers to a subroutine that does not exist.
    ReferenceIntegrity {
        table: Table,
        kind: SubroutineKind,
        /// The biased subroutine number, `None` if the call is not preceded by an integer.
        operand: Option<i32>,
        /// The number of subroutines available to the call.
        count: usize,
    },
    /// A glyph id beyond the number of glyphs in the font was requested.
    InvalidGlyphId { glyph_id: u16, num_glyphs: usize },
    /// A global subroutine calls local subroutines and is used by glyphs with different Font
    /// DICTs whose local subroutines are renumbered differently.
    SharedLocalCall { global_subr: usize },
    Write(WriteError),
}

/// The structure of a CFF font in which an error occurred.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Table {
    Header,
    NameIndex,
    TopDictIndex,
    TopDict,
    StringIndex,
    GlobalSubrIndex,
    CharStrings,
    Charset,
    FDSelect,
    FDArray,
    /// Private DICT of the Font DICT with this index.
    PrivateDict(usize),
    /// Local Subr INDEX of the Font DICT with this index.
    LocalSubrIndex(usize),
    CharString(u16),
    /// Font DICT index, subroutine index.
    LocalSubr(usize, usize),
    GlobalSubr(usize),
}

/// Valid CFF features that are not supported.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Unsupported {
    /// ISOAdobe (0), Expert (1), or ExpertSubset (2)
    PredefinedCharset(i32),
    CharsetFormat(u8),
    FDSelectFormat(u8),
    CustomEncoding,
    CFF2,
    SyntheticFont,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum SubroutineKind {
    Local,
    Global,
}

impl CFFError {
    fn parse(table: Table, offset: usize, error: ParseError) -> CFFError {
        match error {
            ParseError::BadPrimitive => CFFError::MalformedPrimitive { table, offset },
            cause => CFFError::MalformedFont {
                table,
                offset,
                cause,
            },
        }
    }
}

fn malformed(table: Table, offset: usize) -> impl FnOnce(ParseError) -> CFFError {
    move |error| CFFError::parse(table, offset, error)
}

impl From<WriteError> for CFFError {
    fn from(error: WriteError) -> CFFError {
        CFFError::Write(error)
    }
}

impl fmt::Display for CFFError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CFFError::MalformedPrimitive { table, offset } => write!(
                f,
                "invalid operand or operator encoding in {} at offset {}",
                table, offset
            ),
            CFFError::MalformedFont {
                table,
                offset,
                cause,
            } => write!(f, "malformed {} at offset {}: {}", table, offset, cause),
            CFFError::UnsupportedFeature(unsupported) => {
                write!(f, "unsupported feature: {}", unsupported)
            }
            CFFError::ReferenceIntegrity {
                table,
                kind,
                operand: Some(operand),
                count,
            } => write!(
                f,
                "{} calls {} subroutine {} but there are {}",
                table, kind, operand, count
            ),
            CFFError::ReferenceIntegrity {
                table,
                kind,
                operand: None,
                ..
            } => write!(f, "{} calls a {} subroutine with no literal index", table, kind),
            CFFError::InvalidGlyphId {
                glyph_id,
                num_glyphs,
            } => write!(
                f,
                "glyph id {} is out of range, font has {} glyphs",
                glyph_id, num_glyphs
            ),
            CFFError::SharedLocalCall { global_subr } => write!(
                f,
                "global subroutine {} calls local subroutines that differ between font dicts",
                global_subr
            ),
            CFFError::Write(error) => {
                write!(f, "write error: ")?;
                error.fmt(f)
            }
        }
    }
}

impl std::error::Error for CFFError {}

impl fmt::Display for Table {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Table::Header => write!(f, "header"),
            Table::NameIndex => write!(f, "Name INDEX"),
            Table::TopDictIndex => write!(f, "Top DICT INDEX"),
            Table::TopDict => write!(f, "Top DICT"),
            Table::StringIndex => write!(f, "String INDEX"),
            Table::GlobalSubrIndex => write!(f, "Global Subr INDEX"),
            Table::CharStrings => write!(f, "CharStrings INDEX"),
            Table::Charset => write!(f, "charset"),
            Table::FDSelect => write!(f, "FDSelect"),
            Table::FDArray => write!(f, "Font DICT INDEX"),
            Table::PrivateDict(fd) => write!(f, "Private DICT {}", fd),
            Table::LocalSubrIndex(fd) => write!(f, "Local Subr INDEX {}", fd),
            Table::CharString(glyph_id) => write!(f, "charstring of glyph {}", glyph_id),
            Table::LocalSubr(fd, index) => {
                write!(f, "local subroutine {} of font dict {}", index, fd)
            }
            Table::GlobalSubr(index) => write!(f, "global subroutine {}", index),
        }
    }
}

impl fmt::Display for Unsupported {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Unsupported::PredefinedCharset(id) => write!(f, "predefined charset {}", id),
            Unsupported::CharsetFormat(format) => write!(f, "charset format {}", format),
            Unsupported::FDSelectFormat(format) => write!(f, "FDSelect format {}", format),
            Unsupported::CustomEncoding => write!(f, "custom encoding"),
            Unsupported::CFF2 => write!(f, "CFF2"),
            Unsupported::SyntheticFont => write!(f, "synthetic font"),
        }
    }
}

impl fmt::Display for SubroutineKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SubroutineKind::Local => write!(f, "local"),
            SubroutineKind::Global => write!(f, "global"),
        }
    }
}

impl CFF {
    /// Parse a CFF font from `data`.
    pub fn from_bytes(data: &[u8]) -> Result<CFF, CFFError> {
        CFF::read(ReadScope::new(data))
    }

    /// Parse a CFF font from `scope`.
    ///
    /// The data must hold exactly one font. Offsets in the font are relative to the start of
    /// `scope`.
    pub fn read(scope: ReadScope<'_>) -> Result<CFF, CFFError> {
        match scope.ctxt().read_u8() {
            Ok(2) => return Err(CFFError::UnsupportedFeature(Unsupported::CFF2)),
            Ok(_) => {}
            Err(_) => return Err(CFFError::parse(Table::Header, 0, ParseError::BadEof)),
        }

        let mut ctxt = scope.ctxt();
        let header = ctxt
            .read::<Header>()
            .map_err(malformed(Table::Header, 0))?;

        let name_index_offset = ctxt.position();
        let name_index = ctxt
            .read::<Index>()
            .map_err(malformed(Table::NameIndex, name_index_offset))?;
        let top_dict_index_offset = ctxt.position();
        let top_dict_index = ctxt
            .read::<Index>()
            .map_err(malformed(Table::TopDictIndex, top_dict_index_offset))?;
        let string_index_offset = ctxt.position();
        let string_index = ctxt
            .read::<Index>()
            .map_err(malformed(Table::StringIndex, string_index_offset))?;
        let global_subr_index_offset = ctxt.position();
        let global_subr_index = ctxt
            .read::<Index>()
            .map_err(malformed(Table::GlobalSubrIndex, global_subr_index_offset))?;

        // Font sets are not supported, expect exactly one font
        if name_index.len() != 1 {
            return Err(CFFError::parse(
                Table::NameIndex,
                name_index_offset,
                ParseError::BadValue,
            ));
        }
        let top_dict = match top_dict_index.read_object(0) {
            Some(data) if top_dict_index.len() == 1 => ReadScope::new(data)
                .read::<TopDict>()
                .map_err(malformed(Table::TopDict, top_dict_index_offset))?,
            _ => {
                return Err(CFFError::parse(
                    Table::TopDictIndex,
                    top_dict_index_offset,
                    ParseError::BadValue,
                ))
            }
        };

        if top_dict.first_operator() == Some(Operator::SYNTHETIC_BASE) {
            return Err(CFFError::UnsupportedFeature(Unsupported::SyntheticFont));
        }

        // Encodings 0 and 1 are the predefined Standard and Expert encodings
        match top_dict.get(Operator::ENCODING) {
            None | Some([Operand::Integer(0 | 1)]) => {}
            Some(_) => return Err(CFFError::UnsupportedFeature(Unsupported::CustomEncoding)),
        }

        let char_strings_offset =
            offset_operand(&top_dict, top_dict_index_offset, Operator::CHAR_STRINGS)?;
        let char_strings_index = match char_strings_offset {
            Some(offset) => Some(
                scope
                    .offset(offset)
                    .read::<Index>()
                    .map_err(malformed(Table::CharStrings, offset))?,
            ),
            None => {
                warn!("Top DICT has no CharStrings operator");
                None
            }
        };
        let n_glyphs = char_strings_index.as_ref().map(Index::len);

        let charset = match top_dict.get_i32(Operator::CHARSET).transpose() {
            Ok(Some(id @ 0..=2)) => {
                return Err(CFFError::UnsupportedFeature(
                    Unsupported::PredefinedCharset(id),
                ))
            }
            Ok(Some(_)) | Err(_) => {
                let offset =
                    offset_operand(&top_dict, top_dict_index_offset, Operator::CHARSET)?;
                offset
                    .map(|offset| read_charset(&scope, offset, n_glyphs))
                    .transpose()?
            }
            Ok(None) => None,
        };

        let (fd_select, font_dicts, privates) = if top_dict.get(Operator::ROS).is_some() {
            let offset = offset_operand(&top_dict, top_dict_index_offset, Operator::FD_ARRAY)?
                .ok_or_else(|| {
                    CFFError::parse(Table::TopDict, top_dict_index_offset, ParseError::MissingValue)
                })?;
            let font_dict_index = scope
                .offset(offset)
                .read::<Index>()
                .map_err(malformed(Table::FDArray, offset))?;
            let font_dicts = font_dict_index
                .iter()
                .map(|data| ReadScope::new(data).read::<FontDict>())
                .collect::<Result<Vec<_>, _>>()
                .map_err(malformed(Table::FDArray, offset))?;

            let fd_select = offset_operand(&top_dict, top_dict_index_offset, Operator::FD_SELECT)?
                .map(|offset| read_fd_select(&scope, offset, n_glyphs))
                .transpose()?;

            let privates = font_dicts
                .iter()
                .enumerate()
                .map(|(fd, font_dict)| {
                    read_private(&scope, (Table::FDArray, offset), font_dict, fd)
                })
                .collect::<Result<Vec<_>, _>>()?;

            (fd_select, Some(font_dicts), privates)
        } else {
            let top_dict_location = (Table::TopDict, top_dict_index_offset);
            let private = read_private(&scope, top_dict_location, &top_dict, 0)?;
            (None, None, vec![private])
        };

        Ok(CFF {
            header,
            name_index,
            top_dict,
            string_index,
            global_subr_index,
            char_strings_index,
            charset,
            fd_select,
            font_dicts,
            privates,
        })
    }

    /// Serialise this font, recomputing every offset.
    pub fn to_bytes(&self) -> Result<Vec<u8>, CFFError> {
        let (_, buffer) = write::buffer::<_, CFF>(self, ())?;
        Ok(buffer.into_inner())
    }

    pub fn is_cid_keyed(&self) -> bool {
        self.top_dict.get(Operator::ROS).is_some()
    }

    /// The number of glyphs in the font, 0 if it has no CharStrings INDEX.
    pub fn num_glyphs(&self) -> usize {
        self.char_strings_index.as_ref().map_or(0, Index::len)
    }

    /// The PostScript name of the font, if it is valid UTF-8.
    pub fn font_name(&self) -> Option<&str> {
        self.name_index
            .read_object(0)
            .and_then(|name| std::str::from_utf8(name).ok())
    }

    /// Returns the index of the Font DICT used by `glyph_id`.
    ///
    /// Fonts that are not CID-keyed, or lack an FDSelect, always use Font DICT 0.
    pub fn font_dict_for_glyph(&self, glyph_id: u16) -> Result<usize, CFFError> {
        let font_dict_count = match &self.font_dicts {
            Some(font_dicts) => font_dicts.len(),
            None => return Ok(0),
        };
        let fd = match &self.fd_select {
            Some(fd_select) => fd_select
                .font_dict_index(glyph_id)
                .map(usize::from)
                .ok_or_else(|| CFFError::parse(Table::FDSelect, 0, ParseError::BadIndex))?,
            None => 0,
        };
        if fd < font_dict_count {
            Ok(fd)
        } else {
            Err(CFFError::parse(Table::FDSelect, 0, ParseError::BadIndex))
        }
    }

    /// The Local Subr INDEX of the Font DICT `fd`, if it has one.
    pub fn local_subr_index(&self, fd: usize) -> Option<&Index> {
        self.privates
            .get(fd)
            .and_then(Option::as_ref)
            .and_then(|private| private.local_subr_index.as_ref())
    }

    /// Work out where everything will be written and the offsets the DICTs need to hold.
    ///
    /// Every offset operand is written in the five byte form so the size of each DICT is known
    /// before the offsets it holds are.
    fn layout(&self) -> Result<Layout, WriteError> {
        let mut private_lengths = Vec::with_capacity(self.privates.len());
        for private in &self.privates {
            let length = match private {
                Some(private) => Some(write::size::<_, PrivateDict>(
                    &private.dict,
                    private.delta(0),
                )?),
                None => None,
            };
            private_lengths.push(length);
        }

        let placeholder_privates = vec![0; self.privates.len()];
        let placeholder = Offsets {
            charset: 0,
            fd_select: 0,
            char_strings: 0,
            fd_array: 0,
            privates: &placeholder_privates,
            private_lengths: &private_lengths,
        };

        let mut offset = write::size::<_, Header>(&self.header, ())?
            + write::size::<_, Index>(&self.name_index, ())?
            + write::size::<_, Index>(&self.top_dict_index(&placeholder)?, ())?
            + write::size::<_, Index>(&self.string_index, ())?
            + write::size::<_, Index>(&self.global_subr_index, ())?;

        let charset = offset;
        if let Some(charset) = &self.charset {
            offset += write::size::<_, Charset>(charset, ())?;
        }
        let fd_select = offset;
        if let Some(fd_select) = &self.fd_select {
            offset += write::size::<_, FDSelect>(fd_select, ())?;
        }
        let char_strings = offset;
        if let Some(char_strings_index) = &self.char_strings_index {
            offset += write::size::<_, Index>(char_strings_index, ())?;
        }
        let fd_array = offset;
        if let Some(font_dict_index) = self.font_dict_index(&placeholder)? {
            offset += write::size::<_, Index>(&font_dict_index, ())?;
        }
        let mut privates = Vec::with_capacity(self.privates.len());
        for (private, length) in self.privates.iter().zip(&private_lengths) {
            privates.push(offset);
            if let (Some(private), Some(length)) = (private, length) {
                offset += length;
                if let Some(local_subr_index) = &private.local_subr_index {
                    offset += write::size::<_, Index>(local_subr_index, ())?;
                }
            }
        }

        let offsets = Offsets {
            charset,
            fd_select,
            char_strings,
            fd_array,
            privates: &privates,
            private_lengths: &private_lengths,
        };
        let private_deltas = self
            .privates
            .iter()
            .zip(&private_lengths)
            .map(|(private, length)| match private {
                Some(private) => private.delta(length.unwrap_or(0)),
                None => DictDelta::new(),
            })
            .collect();

        Ok(Layout {
            top_dict_index: self.top_dict_index(&offsets)?,
            font_dict_index: self.font_dict_index(&offsets)?,
            private_deltas,
            length: offset,
        })
    }

    fn top_dict_index(&self, offsets: &Offsets<'_>) -> Result<Index, WriteError> {
        let mut delta = DictDelta::new();
        match self.charset {
            Some(_) => delta.push_offset(Operator::CHARSET, i32::try_from(offsets.charset)?),
            None => delta.omit(Operator::CHARSET),
        }
        match self.fd_select {
            Some(_) => delta.push_offset(Operator::FD_SELECT, i32::try_from(offsets.fd_select)?),
            None => delta.omit(Operator::FD_SELECT),
        }
        match self.char_strings_index {
            Some(_) => {
                delta.push_offset(Operator::CHAR_STRINGS, i32::try_from(offsets.char_strings)?)
            }
            None => delta.omit(Operator::CHAR_STRINGS),
        }
        match self.font_dicts {
            Some(_) => delta.push_offset(Operator::FD_ARRAY, i32::try_from(offsets.fd_array)?),
            None => {
                delta.omit(Operator::FD_ARRAY);
                delta.push_private(offsets, 0)?;
            }
        }

        let (_, buffer) = write::buffer::<_, TopDict>(&self.top_dict, delta)?;
        Ok(Index::from(vec![buffer.into_inner()]))
    }

    fn font_dict_index(&self, offsets: &Offsets<'_>) -> Result<Option<Index>, WriteError> {
        let font_dicts = match &self.font_dicts {
            Some(font_dicts) => font_dicts,
            None => return Ok(None),
        };

        let mut index = Index::new();
        for (fd, font_dict) in font_dicts.iter().enumerate() {
            let mut delta = DictDelta::new();
            delta.push_private(offsets, fd)?;
            let (_, buffer) = write::buffer::<_, FontDict>(font_dict, delta)?;
            index.push(buffer.into_inner());
        }
        Ok(Some(index))
    }
}

/// The offsets of the structures that DICTs refer to.
struct Offsets<'a> {
    charset: usize,
    fd_select: usize,
    char_strings: usize,
    fd_array: usize,
    privates: &'a [usize],
    private_lengths: &'a [Option<usize>],
}

struct Layout {
    top_dict_index: Index,
    font_dict_index: Option<Index>,
    private_deltas: Vec<DictDelta>,
    length: usize,
}

impl WriteBinary<&Self> for CFF {
    type Output = ();

    /// Write the font in the order: Header, Name INDEX, Top DICT INDEX, String INDEX, Global Subr
    /// INDEX, charset, FDSelect, CharStrings INDEX, Font DICT INDEX, then each Private DICT
    /// followed by its Local Subr INDEX. The output is padded to a multiple of four bytes.
    fn write<C: WriteContext>(ctxt: &mut C, cff: &CFF) -> Result<(), WriteError> {
        let start = ctxt.bytes_written();
        let layout = cff.layout()?;

        Header::write(ctxt, &cff.header)?;
        Index::write(ctxt, &cff.name_index)?;
        Index::write(ctxt, &layout.top_dict_index)?;
        Index::write(ctxt, &cff.string_index)?;
        Index::write(ctxt, &cff.global_subr_index)?;
        if let Some(charset) = &cff.charset {
            Charset::write(ctxt, charset)?;
        }
        if let Some(fd_select) = &cff.fd_select {
            FDSelect::write(ctxt, fd_select)?;
        }
        if let Some(char_strings_index) = &cff.char_strings_index {
            Index::write(ctxt, char_strings_index)?;
        }
        if let Some(font_dict_index) = &layout.font_dict_index {
            Index::write(ctxt, font_dict_index)?;
        }
        for (private, delta) in cff.privates.iter().zip(layout.private_deltas) {
            if let Some(private) = private {
                PrivateDict::write_dep(ctxt, &private.dict, delta)?;
                if let Some(local_subr_index) = &private.local_subr_index {
                    Index::write(ctxt, local_subr_index)?;
                }
            }
        }

        let length = ctxt.bytes_written() - start;
        if length != layout.length {
            return Err(WriteError::LayoutMismatch);
        }
        ctxt.write_zeros(long_align(length) - length)
    }
}

impl Private {
    /// The changes to make to the Private DICT when its Local Subr INDEX follows it
    /// `subrs_offset` bytes from its start.
    fn delta(&self, subrs_offset: usize) -> DictDelta {
        let mut delta = DictDelta::new();
        match &self.local_subr_index {
            // subrs_offset is at most the length of a DICT so it fits in an i32
            Some(_) => delta.push_offset(Operator::SUBRS, subrs_offset as i32),
            None => delta.omit(Operator::SUBRS),
        }
        delta
    }
}

/// Read the offset held by `operator` in the Top DICT found at `dict_offset`.
fn offset_operand(
    dict: &Dict,
    dict_offset: usize,
    operator: Operator,
) -> Result<Option<usize>, CFFError> {
    dict.get_i32(operator)
        .transpose()
        .and_then(|offset| offset.map(usize::try_from).transpose().map_err(ParseError::from))
        .map_err(malformed(Table::TopDict, dict_offset))
}

fn read_charset(
    scope: &ReadScope<'_>,
    offset: usize,
    n_glyphs: Option<usize>,
) -> Result<Charset, CFFError> {
    // Charset entries are counted by the CharStrings INDEX
    let n_glyphs = n_glyphs
        .ok_or_else(|| CFFError::parse(Table::Charset, offset, ParseError::MissingValue))?;
    let format = scope
        .offset(offset)
        .ctxt()
        .read_u8()
        .map_err(|err| CFFError::parse(Table::Charset, offset, err.into()))?;
    if format != 2 {
        return Err(CFFError::UnsupportedFeature(Unsupported::CharsetFormat(
            format,
        )));
    }
    scope
        .offset(offset)
        .read_dep::<Charset>(n_glyphs)
        .map_err(malformed(Table::Charset, offset))
}

fn read_fd_select(
    scope: &ReadScope<'_>,
    offset: usize,
    n_glyphs: Option<usize>,
) -> Result<FDSelect, CFFError> {
    let n_glyphs = n_glyphs
        .ok_or_else(|| CFFError::parse(Table::FDSelect, offset, ParseError::MissingValue))?;
    let format = scope
        .offset(offset)
        .ctxt()
        .read_u8()
        .map_err(|err| CFFError::parse(Table::FDSelect, offset, err.into()))?;
    if format != 3 {
        return Err(CFFError::UnsupportedFeature(Unsupported::FDSelectFormat(
            format,
        )));
    }
    scope
        .offset(offset)
        .read_dep::<FDSelect>(n_glyphs)
        .map_err(malformed(Table::FDSelect, offset))
}

/// Read the Private DICT `dict` refers to, and its Local Subr INDEX if it has one.
///
/// `dict` is the Top DICT or a Font DICT, found in `table` at `dict_offset`.
fn read_private(
    scope: &ReadScope<'_>,
    (table, dict_offset): (Table, usize),
    dict: &Dict,
    fd: usize,
) -> Result<Option<Private>, CFFError> {
    let (length, offset) = match dict.get(Operator::PRIVATE) {
        Some([Operand::Offset(length), Operand::Offset(offset)]) => {
            match (usize::try_from(*length), usize::try_from(*offset)) {
                (Ok(length), Ok(offset)) => (length, offset),
                _ => {
                    let error = ParseError::BadOffset;
                    return Err(CFFError::parse(table, dict_offset, error));
                }
            }
        }
        Some(_) => {
            let error = ParseError::BadValue;
            return Err(CFFError::parse(table, dict_offset, error));
        }
        None => return Ok(None),
    };

    let private_dict = scope
        .offset_length(offset, length)
        .and_then(|scope| scope.read::<PrivateDict>())
        .map_err(malformed(Table::PrivateDict(fd), offset))?;

    // The local subrs offset is relative to the beginning of the Private DICT data
    let local_subr_index = private_dict
        .get_i32(Operator::SUBRS)
        .transpose()
        .and_then(|subrs| subrs.map(usize::try_from).transpose().map_err(ParseError::from))
        .map_err(malformed(Table::PrivateDict(fd), offset))?
        .map(|subrs| {
            let subrs = offset + subrs;
            scope
                .offset(subrs)
                .read::<Index>()
                .map_err(malformed(Table::LocalSubrIndex(fd), subrs))
        })
        .transpose()?;

    Ok(Some(Private {
        dict: private_dict,
        local_subr_index,
    }))
}

impl ReadBinary for Header {
    type HostType<'b> = Self;

    fn read(ctxt: &mut ReadCtxt<'_>) -> Result<Self, ParseError> {
        let major = ctxt.read_u8()?;
        if major != 1 {
            return Err(ParseError::BadVersion);
        }
        let minor = ctxt.read_u8()?;
        let hdr_size = ctxt.read_u8()?;
        let off_size = ctxt.read_u8()?;

        if hdr_size < 4 {
            return Err(ParseError::BadValue);
        }

        if off_size < 1 || off_size > 4 {
            return Err(ParseError::BadValue);
        }

        if hdr_size > 4 {
            warn!("dropping {} bytes of CFF header extension", hdr_size - 4);
            let _unknown = ctxt.read_slice(usize::from(hdr_size - 4))?;
        }

        Ok(Header {
            major,
            minor,
            hdr_size,
            off_size,
        })
    }
}

impl WriteBinary<&Self> for Header {
    type Output = ();

    fn write<C: WriteContext>(ctxt: &mut C, header: &Header) -> Result<(), WriteError> {
        U8::write(ctxt, header.major)?;
        U8::write(ctxt, header.minor)?;
        // Any data between the header and the Name INDEX will have been discarded.
        // So the size will always be 4 bytes.
        U8::write(ctxt, 4)?; // hdr_size
        U8::write(ctxt, header.off_size)?;

        Ok(())
    }
}

impl ReadBinary for Index {
    type HostType<'a> = Index;

    fn read(ctxt: &mut ReadCtxt<'_>) -> Result<Index, ParseError> {
        let count = usize::from(ctxt.read_u16be()?);
        if count == 0 {
            return Ok(Index::new());
        }

        let off_size = ctxt.read_u8()?;
        if off_size < 1 || off_size > 4 {
            return Err(ParseError::BadValue);
        }

        let offset_array = ctxt.read_slice((count + 1) * usize::from(off_size))?;
        let offsets = (0..=count)
            .map(|index| lookup_offset_index(off_size, offset_array, index))
            .collect::<Vec<_>>();
        // Offsets are 1-based and must not decrease
        if offsets[0] != 1 || offsets.iter().tuple_windows().any(|(start, end)| end < start) {
            return Err(ParseError::BadOffset);
        }

        let data_array = ctxt.read_slice(offsets[count] - 1)?;
        let data = offsets
            .iter()
            .tuple_windows()
            .map(|(start, end)| data_array[start - 1..end - 1].to_vec())
            .collect();

        Ok(Index { data })
    }
}

impl WriteBinary<&Self> for Index {
    type Output = ();

    fn write<C: WriteContext>(ctxt: &mut C, index: &Index) -> Result<(), WriteError> {
        U16Be::write(ctxt, u16::try_from(index.len())?)?;
        if index.is_empty() {
            return Ok(());
        }

        let mut offsets = Vec::with_capacity(index.len() + 1);
        let mut offset = 1; // INDEX offsets start at 1
        offsets.push(offset);
        for object in index.iter() {
            offset += object.len();
            offsets.push(offset);
        }
        let (off_size, offset_array) = serialise_offset_array(offsets)?;

        U8::write(ctxt, off_size)?;
        ctxt.write_bytes(&offset_array)?;
        for object in index.iter() {
            ctxt.write_bytes(object)?;
        }

        Ok(())
    }
}

impl ReadBinary for Dict {
    type HostType<'b> = Self;

    fn read(ctxt: &mut ReadCtxt<'_>) -> Result<Self, ParseError> {
        let mut dict = Vec::new();
        let mut operands = Vec::new();

        while ctxt.bytes_available() {
            match Op::read(ctxt)? {
                Op::Operator(operator) => {
                    integer_to_offset(operator, &mut operands);
                    dict.push((operator, operands.clone()));
                    operands.clear();
                }
                Op::Operand(operand) => {
                    operands.push(operand);
                    if operands.len() > MAX_OPERANDS {
                        return Err(ParseError::LimitExceeded);
                    }
                }
            }
        }

        // Operands must be followed by an operator
        ctxt.check(operands.is_empty())?;

        Ok(Dict { dict })
    }
}

fn offset_size(value: usize) -> Option<u8> {
    match value {
        0..=0xFF => Some(1),
        0x100..=0xFFFF => Some(2),
        0x1_0000..=0xFF_FFFF => Some(3),
        0x100_0000..=0xFFFF_FFFF => Some(4),
        _ => None,
    }
}

// Special case handling for operands that are offsets. This function swaps them from an
// Integer to an Offset. This is later used when writing operands.
fn integer_to_offset(operator: Operator, operands: &mut [Operand]) {
    match (operator, &operands) {
        // Encodings 0..=1 indicate predefined encodings and are not offsets
        (Operator::ENCODING, [Operand::Integer(offset)]) if *offset > 1 => {
            operands[0] = Operand::Offset(*offset);
        }
        (Operator::CHARSET, [Operand::Integer(offset)])
        | (Operator::CHAR_STRINGS, [Operand::Integer(offset)])
        | (Operator::SUBRS, [Operand::Integer(offset)])
        | (Operator::FD_ARRAY, [Operand::Integer(offset)])
        | (Operator::FD_SELECT, [Operand::Integer(offset)]) => {
            operands[0] = Operand::Offset(*offset);
        }
        (Operator::PRIVATE, [Operand::Integer(length), Operand::Integer(offset)]) => {
            let offset = *offset;
            operands[0] = Operand::Offset(*length);
            operands[1] = Operand::Offset(offset);
        }
        _ => {}
    }
}

impl WriteBinaryDep<&Self> for Dict {
    type Args = DictDelta;
    type Output = usize; // The length of the written Dict

    fn write_dep<C: WriteContext>(
        ctxt: &mut C,
        dict: &Dict,
        delta: DictDelta,
    ) -> Result<Self::Output, WriteError> {
        let offset = ctxt.bytes_written();

        // Replace operands with delta operands if present
        for (operator, operands) in dict.iter() {
            if delta.omits(*operator) {
                continue;
            }
            let operands = delta.get(*operator).unwrap_or(operands.as_slice());
            for operand in operands {
                Operand::write(ctxt, operand)?;
            }
            Operator::write(ctxt, *operator)?;
        }

        // Offsets the DICT did not have yet go at the end
        for (operator, operands) in delta.dict.iter() {
            if dict.get(*operator).is_none() {
                for operand in operands {
                    Operand::write(ctxt, operand)?;
                }
                Operator::write(ctxt, *operator)?;
            }
        }

        Ok(ctxt.bytes_written() - offset)
    }
}

impl ReadBinary for Op {
    type HostType<'b> = Self;

    fn read(ctxt: &mut ReadCtxt<'_>) -> Result<Self, ParseError> {
        let b0 = ctxt.read_u8()?;

        match b0 {
            0..=21 => Ok(Op::Operator(Operator(primitive::operator(ctxt, b0)?))),
            28 | 29 | 32..=254 => Ok(Op::Operand(Operand::Integer(primitive::int_operand(
                ctxt, b0,
            )?))),
            30 => Ok(Op::Operand(Operand::Real(primitive::real_operand(ctxt)?))),
            22..=27 | 31 | 255 => Err(ParseError::BadPrimitive), // reserved
        }
    }
}

impl WriteBinary<Self> for Operator {
    type Output = ();

    fn write<C: WriteContext>(ctxt: &mut C, op: Operator) -> Result<(), WriteError> {
        primitive::write_operator(ctxt, op.0)
    }
}

impl WriteBinary<&Self> for Operand {
    type Output = ();

    // Refer to Table 3 Operand Encoding in section 4 of Technical Note #5176 for details on the
    // integer encoding scheme.
    fn write<C: WriteContext>(ctxt: &mut C, op: &Operand) -> Result<(), WriteError> {
        match op {
            Operand::Integer(val) => primitive::write_int(ctxt, *val),
            // Offsets are always encoded using the i32 representation to make their size
            // predictable.
            Operand::Offset(val) => primitive::write_full_int(ctxt, *val),
            Operand::Real(real) => primitive::write_real(ctxt, real),
        }
    }
}

impl Operand {
    pub fn is_offset(&self) -> bool {
        matches!(self, Operand::Offset(_))
    }
}

impl ReadBinary for Range<SID, u16> {
    type HostType<'b> = Self;

    fn read(ctxt: &mut ReadCtxt<'_>) -> Result<Self, ParseError> {
        let first = ctxt.read_u16be()?;
        let n_left = ctxt.read_u16be()?;
        ctxt.check(first.checked_add(n_left).is_some())?;
        Ok(Range { first, n_left })
    }
}

impl WriteBinary for Range<SID, u16> {
    type Output = ();

    fn write<C: WriteContext>(ctxt: &mut C, range: Self) -> Result<(), WriteError> {
        U16Be::write(ctxt, range.first)?;
        U16Be::write(ctxt, range.n_left)?;

        Ok(())
    }
}

impl<F, N> Range<F, N>
where
    N: Copy,
    usize: From<N>,
{
    pub fn len(&self) -> usize {
        usize::from(self.n_left) + 1
    }
}

impl Range<SID, u16> {
    pub fn iter(&self) -> impl Iterator<Item = SID> {
        let last = self.first.saturating_add(self.n_left);
        self.first..=last
    }
}

impl ReadBinaryDep for Charset {
    type Args<'a> = usize;
    type HostType<'a> = Charset;

    fn read_dep<'a>(
        ctxt: &mut ReadCtxt<'a>,
        n_glyphs: usize,
    ) -> Result<Self::HostType<'a>, ParseError> {
        // (There is one less element in the charset than nGlyphs because the .notdef glyph name is omitted.)
        let n_glyphs = n_glyphs.checked_sub(1).ok_or(ParseError::BadValue)?;
        match ctxt.read_u8()? {
            2 => {
                let mut ranges = Vec::new();
                let mut glyphs_covered = 0;
                while glyphs_covered < n_glyphs {
                    let range = ctxt.read::<Range<SID, u16>>()?;
                    glyphs_covered += range.len();
                    ranges.push(range);
                }
                Ok(Charset { ranges })
            }
            _ => Err(ParseError::NotImplemented),
        }
    }
}

impl WriteBinary<&Self> for Charset {
    type Output = ();

    fn write<C: WriteContext>(ctxt: &mut C, charset: &Self) -> Result<(), WriteError> {
        U8::write(ctxt, 2)?; // format
        for range in &charset.ranges {
            Range::write(ctxt, *range)?;
        }

        Ok(())
    }
}

impl Charset {
    /// Build a charset holding `ids` for glyphs 1, 2, 3, and so on.
    pub fn from_ids(ids: impl IntoIterator<Item = SID>) -> Charset {
        let mut ranges: Vec<Range<SID, u16>> = Vec::new();
        for id in ids {
            match ranges.last_mut() {
                Some(range)
                    if range.n_left < u16::MAX
                        && range.first.checked_add(range.n_left + 1) == Some(id) =>
                {
                    range.n_left += 1
                }
                _ => ranges.push(Range {
                    first: id,
                    n_left: 0,
                }),
            }
        }
        Charset { ranges }
    }

    /// The SID or CID of each glyph, starting with `.notdef`.
    pub fn iter(&self) -> impl Iterator<Item = SID> + '_ {
        iter::once(0).chain(self.ranges.iter().flat_map(|range| range.iter()))
    }

    /// Returns the SID (name-keyed font) or CID (CID-keyed font) of the supplied glyph
    pub fn id_for_glyph(&self, glyph_id: u16) -> Option<SID> {
        self.iter().nth(usize::from(glyph_id))
    }

    /// Returns the glyph id of the supplied SID or CID
    pub fn sid_to_gid(&self, sid: SID) -> Option<u16> {
        if sid == 0 {
            return Some(0);
        }
        self.iter()
            .position(|id| id == sid)
            .and_then(|glyph_id| u16::try_from(glyph_id).ok())
    }

    pub fn ranges(&self) -> &[Range<SID, u16>] {
        &self.ranges
    }
}

impl ReadBinaryDep for FDSelect {
    type Args<'a> = usize;
    type HostType<'a> = FDSelect;

    fn read_dep<'a>(
        ctxt: &mut ReadCtxt<'a>,
        n_glyphs: usize,
    ) -> Result<Self::HostType<'a>, ParseError> {
        match ctxt.read_u8()? {
            3 => {
                let nranges = usize::from(ctxt.read_u16be()?);
                let mut ranges = Vec::with_capacity(nranges);
                for _ in 0..nranges {
                    let first = ctxt.read_u16be()?;
                    let font_dict_index = ctxt.read_u8()?;
                    ranges.push(FDRange {
                        first,
                        font_dict_index,
                    });
                }
                let sentinel = ctxt.read_u16be()?;

                // The first range must start at glyph 0 and ranges must be in order
                ctxt.check(ranges.first().map_or(true, |range| range.first == 0))?;
                ctxt.check(
                    ranges
                        .iter()
                        .map(|range| range.first)
                        .chain(iter::once(sentinel))
                        .tuple_windows()
                        .all(|(first, next)| first < next),
                )?;
                if usize::from(sentinel) != n_glyphs {
                    warn!(
                        "FDSelect sentinel {} does not match glyph count {}",
                        sentinel, n_glyphs
                    );
                }

                Ok(FDSelect { ranges, sentinel })
            }
            _ => Err(ParseError::NotImplemented),
        }
    }
}

impl WriteBinary<&Self> for FDSelect {
    type Output = ();

    fn write<C: WriteContext>(ctxt: &mut C, fd_select: &Self) -> Result<(), WriteError> {
        U8::write(ctxt, 3)?; // format
        U16Be::write(ctxt, u16::try_from(fd_select.ranges.len())?)?;
        for range in &fd_select.ranges {
            U16Be::write(ctxt, range.first)?;
            U8::write(ctxt, range.font_dict_index)?;
        }
        U16Be::write(ctxt, fd_select.sentinel)?;

        Ok(())
    }
}

impl FDSelect {
    /// Build an FDSelect from the Font DICT index of every glyph, in glyph id order.
    pub fn from_indices(indices: &[u8]) -> Result<FDSelect, WriteError> {
        let mut ranges: Vec<FDRange> = Vec::new();
        for (glyph_id, &font_dict_index) in indices.iter().enumerate() {
            match ranges.last() {
                Some(range) if range.font_dict_index == font_dict_index => {}
                _ => ranges.push(FDRange {
                    first: u16::try_from(glyph_id)?,
                    font_dict_index,
                }),
            }
        }
        Ok(FDSelect {
            ranges,
            sentinel: u16::try_from(indices.len())?,
        })
    }

    /// Returns the index of the Font DICT for the supplied `glyph_id`
    pub fn font_dict_index(&self, glyph_id: u16) -> Option<u8> {
        let range_windows = self
            .ranges
            .iter()
            .map(|range| (range.first, Some(range.font_dict_index)))
            .chain(iter::once((self.sentinel, None)))
            .tuple_windows();

        for ((first, fd_index), (last, _)) in range_windows {
            if glyph_id >= first && glyph_id < last {
                return fd_index;
            }
        }

        None
    }

    pub fn ranges(&self) -> &[FDRange] {
        &self.ranges
    }
}

impl Index {
    pub fn new() -> Self {
        Index { data: Vec::new() }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn read_object(&self, index: usize) -> Option<&[u8]> {
        self.data.get(index).map(Vec::as_slice)
    }

    pub fn iter(&self) -> impl Iterator<Item = &[u8]> {
        self.data.iter().map(Vec::as_slice)
    }

    /// Append `object`, returning its index.
    pub fn push(&mut self, object: Vec<u8>) -> usize {
        self.data.push(object);
        self.data.len() - 1
    }
}

impl From<Vec<Vec<u8>>> for Index {
    fn from(data: Vec<Vec<u8>>) -> Self {
        Index { data }
    }
}

impl Dict {
    pub fn new() -> Self {
        Dict { dict: Vec::new() }
    }

    pub fn get(&self, key: Operator) -> Option<&[Operand]> {
        self.dict.iter().find_map(|(op, args)| {
            if *op == key {
                Some(args.as_slice())
            } else {
                None
            }
        })
    }

    /// Returns the i32 value of this operator if the operands hold a single Integer.
    pub fn get_i32(&self, key: Operator) -> Option<Result<i32, ParseError>> {
        self.get(key).map(|operands| match operands {
            [Operand::Integer(number)] => Ok(*number),
            [Operand::Offset(number)] => Ok(*number),
            _ => Err(ParseError::BadValue),
        })
    }

    /// Set the operands of `operator`, replacing any existing ones in place.
    pub fn set(&mut self, operator: Operator, operands: Vec<Operand>) {
        match self.dict.iter_mut().find(|(op, _)| *op == operator) {
            Some((_, existing)) => *existing = operands,
            None => self.dict.push((operator, operands)),
        }
    }

    pub fn remove(&mut self, operator: Operator) {
        if let Some(index) = self.dict.iter().position(|(op, _)| *op == operator) {
            self.dict.remove(index);
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &(Operator, Vec<Operand>)> {
        self.dict.iter()
    }

    /// Returns the first operator of this DICT or `None` if the DICT is empty.
    pub fn first_operator(&self) -> Option<Operator> {
        self.iter().next().map(|(operator, _)| *operator)
    }

    pub fn len(&self) -> usize {
        self.dict.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dict.is_empty()
    }
}

impl DictDelta {
    pub fn new() -> Self {
        DictDelta::default()
    }

    pub fn get(&self, key: Operator) -> Option<&[Operand]> {
        self.dict
            .iter()
            .find(|(op, _)| *op == key)
            .map(|(_, args)| args.as_slice())
    }

    /// Push `operator` on this Dict as an Offset Operand
    pub fn push_offset(&mut self, operator: Operator, offset: i32) {
        self.dict.push((operator, vec![Operand::Offset(offset)]))
    }

    /// Push `operands` onto this Dict
    pub fn push(&mut self, operator: Operator, operands: Vec<Operand>) {
        debug_assert!(operands.iter().all(Operand::is_offset));
        self.dict.push((operator, operands))
    }

    /// Leave `operator` out when writing the Dict
    pub fn omit(&mut self, operator: Operator) {
        self.omit.push(operator)
    }

    fn omits(&self, operator: Operator) -> bool {
        self.omit.contains(&operator)
    }

    /// Point the Private operator at the Private DICT of font dict `fd`, or drop it if there is
    /// none.
    fn push_private(&mut self, offsets: &Offsets<'_>, fd: usize) -> Result<(), WriteError> {
        match (offsets.privates.get(fd), offsets.private_lengths.get(fd)) {
            (Some(offset), Some(Some(length))) => {
                self.push(
                    Operator::PRIVATE,
                    vec![
                        Operand::Offset(i32::try_from(*length)?),
                        Operand::Offset(i32::try_from(*offset)?),
                    ],
                );
            }
            _ => self.omit(Operator::PRIVATE),
        }
        Ok(())
    }
}

fn lookup_offset_index(off_size: u8, offset_array: &[u8], index: usize) -> usize {
    let buf = &offset_array[index * usize::from(off_size)..];
    match off_size {
        1 => usize::from(buf[0]),
        2 => usize::from(BigEndian::read_u16(buf)),
        3 => BigEndian::read_u24(buf) as usize,
        _ => BigEndian::read_u32(buf) as usize,
    }
}

/// Serialise the offsets using an optimal `off_size`, returning that and the serialised data.
fn serialise_offset_array(offsets: Vec<usize>) -> Result<(u8, Vec<u8>), WriteError> {
    let off_size = match offsets.last() {
        Some(&last) => offset_size(last).ok_or(WriteError::BadValue)?,
        None => return Ok((1, Vec::new())),
    };

    // NOTE: Casts are safe as every offset is at most the last one
    let mut offset_array = WriteBuffer::new();
    match off_size {
        1 => offset_array.write_iter::<U8, _>(offsets.into_iter().map(|offset| offset as u8))?,
        2 => offset_array
            .write_iter::<U16Be, _>(offsets.into_iter().map(|offset| offset as u16))?,
        3 => offset_array
            .write_iter::<U24Be, _>(offsets.into_iter().map(|offset| offset as u32))?,
        _ => offset_array
            .write_iter::<U32Be, _>(offsets.into_iter().map(|offset| offset as u32))?,
    }

    Ok((off_size, offset_array.into_inner()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn simple_font() -> CFF {
        let mut top_dict = TopDict::new();
        top_dict.set(Operator::FULL_NAME, vec![Operand::Integer(391)]);
        top_dict.set(
            Operator::FONT_BBOX,
            vec![
                Operand::Integer(-50),
                Operand::Integer(-200),
                Operand::Integer(1000),
                Operand::Integer(900),
            ],
        );
        let mut private_dict = PrivateDict::new();
        private_dict.set(Operator::NOMINAL_WIDTH_X, vec![Operand::Integer(500)]);

        CFF {
            header: Header {
                major: 1,
                minor: 0,
                hdr_size: 4,
                off_size: 1,
            },
            name_index: Index::from(vec![b"Simple".to_vec()]),
            top_dict,
            string_index: Index::from(vec![b"Simple Regular".to_vec()]),
            global_subr_index: Index::from(vec![vec![0x0b]]),
            char_strings_index: Some(Index::from(vec![
                vec![0x0e],
                vec![0x8b, 0x8b, 0x15, 0x0e],
                vec![0x20, 0x1d, 0x0e],
            ])),
            charset: Some(Charset::from_ids([391, 392])),
            fd_select: None,
            font_dicts: None,
            privates: vec![Some(Private {
                dict: private_dict,
                local_subr_index: Some(Index::from(vec![vec![0x0b], vec![0x0b]])),
            })],
        }
    }

    #[test]
    fn test_read_op1() {
        let mut ctxt = ReadScope::new(&[0, 0]).ctxt();
        assert_eq!(
            Op::read(&mut ctxt).unwrap(),
            Op::Operator(Operator::VERSION)
        );
    }

    #[test]
    fn test_read_op2() {
        let mut ctxt = ReadScope::new(&[12, 1]).ctxt();
        assert_eq!(
            Op::read(&mut ctxt).unwrap(),
            Op::Operator(Operator::IS_FIXED_PITCH)
        );
    }

    #[test]
    fn test_fail_op2() {
        let mut ctxt = ReadScope::new(&[12]).ctxt();
        assert!(Op::read(&mut ctxt).is_err());
    }

    #[test]
    fn test_read_reserved_op() {
        let mut ctxt = ReadScope::new(&[22]).ctxt();
        assert_eq!(Op::read(&mut ctxt), Err(ParseError::BadPrimitive));
    }

    #[test]
    fn test_read_i16() {
        //                             _____-10000______  ______10000_____  100   -100
        let mut ctxt = ReadScope::new(&[0x1c, 0xd8, 0xf0, 0x1c, 0x27, 0x10, 0xef, 0x27]).ctxt();
        let expected = [-10000, 10000, 100, -100];
        for value in expected {
            assert_eq!(
                Op::read(&mut ctxt).unwrap(),
                Op::Operand(Operand::Integer(value))
            );
        }
    }

    #[test]
    fn test_empty_index() {
        let (_, buffer) = write::buffer::<_, Index>(&Index::new(), ()).unwrap();
        assert_eq!(buffer.bytes(), &[0, 0]);
        let index = ReadScope::new(&[0, 0]).read::<Index>().unwrap();
        assert!(index.is_empty());
    }

    #[test]
    fn test_read_write_index() {
        let data = [0, 2, 1, 1, 3, 4, 0xAA, 0xBB, 0xCC];
        let index = ReadScope::new(&data).read::<Index>().unwrap();
        assert_eq!(
            index.iter().collect::<Vec<_>>(),
            vec![&[0xAA, 0xBB][..], &[0xCC][..]]
        );
        let (_, buffer) = write::buffer::<_, Index>(&index, ()).unwrap();
        assert_eq!(buffer.bytes(), &data);
    }

    #[test]
    fn test_read_index_bad_offsets() {
        // First offset not 1
        let data = [0, 1, 1, 2, 3, 0xAA, 0xBB];
        assert_eq!(
            ReadScope::new(&data).read::<Index>(),
            Err(ParseError::BadOffset)
        );
        // Decreasing offsets
        let data = [0, 2, 1, 1, 3, 2, 0xAA, 0xBB];
        assert_eq!(
            ReadScope::new(&data).read::<Index>(),
            Err(ParseError::BadOffset)
        );
        // Bad off_size
        let data = [0, 1, 5, 0, 0, 0, 0, 1];
        assert_eq!(
            ReadScope::new(&data).read::<Index>(),
            Err(ParseError::BadValue)
        );
    }

    #[test]
    fn test_index_off_size() {
        // The last offset is one more than the size of the data
        let index = Index::from(vec![vec![0; 254]]);
        let (_, buffer) = write::buffer::<_, Index>(&index, ()).unwrap();
        assert_eq!(&buffer.bytes()[..5], &[0, 1, 1, 1, 255]);

        let index = Index::from(vec![vec![0; 255]]);
        let (_, buffer) = write::buffer::<_, Index>(&index, ()).unwrap();
        assert_eq!(&buffer.bytes()[..7], &[0, 1, 2, 0, 1, 1, 0]);
        assert_eq!(ReadScope::new(buffer.bytes()).read::<Index>(), Ok(index));
    }

    #[test]
    fn test_read_dict_offsets() {
        //          CharStrings 1  __Private 10, 300__  _FullName 391_
        let data = [0x8c, 17, 0x95, 0xf7, 0xc0, 18, 0xf8, 0x1b, 2];
        let dict = ReadScope::new(&data).read::<Dict>().unwrap();
        assert_eq!(dict.get(Operator::CHAR_STRINGS), Some(&[Operand::Offset(1)][..]));
        assert_eq!(
            dict.get(Operator::PRIVATE),
            Some(&[Operand::Offset(10), Operand::Offset(300)][..])
        );
        assert_eq!(dict.get_i32(Operator::FULL_NAME), Some(Ok(391)));
        assert_eq!(dict.first_operator(), Some(Operator::CHAR_STRINGS));
        assert_eq!(dict.len(), 3);
    }

    #[test]
    fn test_dict_encoding_not_offset() {
        let data = [0x8c, 16];
        let dict = ReadScope::new(&data).read::<Dict>().unwrap();
        assert_eq!(dict.get(Operator::ENCODING), Some(&[Operand::Integer(1)][..]));
    }

    #[test]
    fn test_dict_too_many_operands() {
        let mut data = vec![0x8b; MAX_OPERANDS + 1];
        data.push(6);
        assert_eq!(
            ReadScope::new(&data).read::<Dict>(),
            Err(ParseError::LimitExceeded)
        );
    }

    #[test]
    fn test_dict_trailing_operands() {
        let data = [0x8b, 0x8b];
        assert_eq!(
            ReadScope::new(&data).read::<Dict>(),
            Err(ParseError::BadValue)
        );
    }

    #[test]
    fn test_write_dict_with_delta() {
        let mut dict = Dict::new();
        dict.set(Operator::VERSION, vec![Operand::Integer(391)]);
        dict.set(Operator::CHAR_STRINGS, vec![Operand::Offset(5)]);
        dict.set(Operator::CHARSET, vec![Operand::Offset(9)]);

        let mut delta = DictDelta::new();
        delta.push_offset(Operator::CHAR_STRINGS, 1000);
        delta.omit(Operator::CHARSET);
        delta.push_offset(Operator::FD_ARRAY, 2);

        let (length, buffer) = write::buffer::<_, Dict>(&dict, delta).unwrap();
        assert_eq!(length, buffer.len());
        assert_eq!(
            buffer.bytes(),
            &[
                0xf8, 0x1b, 0, // 391 version
                29, 0, 0, 0x03, 0xe8, 17, // 1000 CharStrings
                29, 0, 0, 0, 2, 12, 36, // 2 FDArray
            ]
        );
    }

    #[test]
    fn test_dict_set_remove() {
        let mut dict = Dict::new();
        dict.set(Operator::VERSION, vec![Operand::Integer(1)]);
        dict.set(Operator::NOTICE, vec![Operand::Integer(2)]);
        dict.set(Operator::VERSION, vec![Operand::Integer(3)]);
        assert_eq!(dict.first_operator(), Some(Operator::VERSION));
        assert_eq!(dict.get_i32(Operator::VERSION), Some(Ok(3)));
        dict.remove(Operator::VERSION);
        assert_eq!(dict.first_operator(), Some(Operator::NOTICE));
        assert_eq!(dict.len(), 1);
    }

    #[test]
    fn test_charset_from_ids() {
        let charset = Charset::from_ids([391, 392, 393, 17, 18, 400]);
        assert_eq!(
            charset.ranges(),
            &[
                Range {
                    first: 391,
                    n_left: 2
                },
                Range {
                    first: 17,
                    n_left: 1
                },
                Range {
                    first: 400,
                    n_left: 0
                },
            ]
        );
        assert_eq!(charset.id_for_glyph(0), Some(0));
        assert_eq!(charset.id_for_glyph(4), Some(17));
        assert_eq!(charset.id_for_glyph(7), None);
        assert_eq!(charset.sid_to_gid(400), Some(6));
        assert_eq!(charset.sid_to_gid(500), None);
    }

    #[test]
    fn test_read_write_charset() {
        let data = [2, 0x01, 0x87, 0x00, 0x02, 0x00, 0x11, 0x00, 0x00];
        let charset = ReadScope::new(&data).read_dep::<Charset>(5).unwrap();
        assert_eq!(
            charset.iter().collect::<Vec<_>>(),
            vec![0, 391, 392, 393, 17]
        );
        let (_, buffer) = write::buffer::<_, Charset>(&charset, ()).unwrap();
        assert_eq!(buffer.bytes(), &data);
    }

    #[test]
    fn test_fd_select_font_dict_index() {
        #[rustfmt::skip]
        let data = [
            3, // format
            0, 3, // nranges
            0, 0, 0, // glyphs 0..2 -> 0
            0, 2, 2, // glyphs 2..5 -> 2
            0, 5, 1, // glyphs 5..7 -> 1
            0, 7, // sentinel
        ];
        let fd_select = ReadScope::new(&data).read_dep::<FDSelect>(7).unwrap();
        let indices = (0..8)
            .map(|glyph_id| fd_select.font_dict_index(glyph_id))
            .collect::<Vec<_>>();
        assert_eq!(
            indices,
            [
                Some(0),
                Some(0),
                Some(2),
                Some(2),
                Some(2),
                Some(1),
                Some(1),
                None
            ]
        );
        let (_, buffer) = write::buffer::<_, FDSelect>(&fd_select, ()).unwrap();
        assert_eq!(buffer.bytes(), &data);
    }

    #[test]
    fn test_fd_select_from_indices() {
        let fd_select = FDSelect::from_indices(&[0, 0, 2, 2, 2, 1, 1]).unwrap();
        assert_eq!(
            fd_select.ranges(),
            &[
                FDRange {
                    first: 0,
                    font_dict_index: 0
                },
                FDRange {
                    first: 2,
                    font_dict_index: 2
                },
                FDRange {
                    first: 5,
                    font_dict_index: 1
                },
            ]
        );
        assert_eq!(fd_select.font_dict_index(6), Some(1));
        assert_eq!(fd_select.font_dict_index(7), None);
    }

    #[test]
    fn test_fd_select_unordered_ranges() {
        let data = [3, 0, 2, 0, 0, 0, 0, 0, 1, 0, 7];
        assert_eq!(
            ReadScope::new(&data).read_dep::<FDSelect>(7),
            Err(ParseError::BadValue)
        );
    }

    #[test]
    fn test_write_read_simple_font() {
        let cff = simple_font();
        let data = cff.to_bytes().unwrap();
        assert_eq!(data.len() % 4, 0);

        let read = CFF::from_bytes(&data).unwrap();
        assert_eq!(read.font_name(), Some("Simple"));
        assert_eq!(read.num_glyphs(), 3);
        assert!(!read.is_cid_keyed());
        assert_eq!(read.charset, cff.charset);
        assert_eq!(read.char_strings_index, cff.char_strings_index);
        assert_eq!(read.global_subr_index, cff.global_subr_index);
        assert_eq!(read.local_subr_index(0), cff.local_subr_index(0));
        assert_eq!(
            read.top_dict.get(Operator::FONT_BBOX),
            cff.top_dict.get(Operator::FONT_BBOX)
        );
        let private = read.privates[0].as_ref().unwrap();
        assert_eq!(
            private.dict.get(Operator::NOMINAL_WIDTH_X),
            Some(&[Operand::Integer(500)][..])
        );

        // Writing what was read is stable
        assert_eq!(read.to_bytes().unwrap(), data);
    }

    #[test]
    fn test_write_font_without_local_subrs() {
        let mut cff = simple_font();
        if let Some(private) = cff.privates[0].as_mut() {
            private.dict.set(Operator::SUBRS, vec![Operand::Offset(99)]);
            private.local_subr_index = None;
        }
        let read = CFF::from_bytes(&cff.to_bytes().unwrap()).unwrap();
        let private = read.privates[0].as_ref().unwrap();
        assert_eq!(private.dict.get(Operator::SUBRS), None);
        assert_eq!(private.local_subr_index, None);
    }

    #[test]
    fn test_predefined_charset() {
        #[rustfmt::skip]
        let data = [
            1, 0, 4, 1, // header
            0, 1, 1, 1, 2, b'A', // Name INDEX
            0, 1, 1, 1, 3, 139, 15, // Top DICT INDEX: 0 charset
            0, 0, // String INDEX
            0, 0, // Global Subr INDEX
        ];
        assert_eq!(
            CFF::from_bytes(&data),
            Err(CFFError::UnsupportedFeature(Unsupported::PredefinedCharset(0)))
        );

        let mut data = data;
        for (operand, id) in [(140, 1), (141, 2)] {
            data[15] = operand;
            assert_eq!(
                CFF::from_bytes(&data),
                Err(CFFError::UnsupportedFeature(Unsupported::PredefinedCharset(id)))
            );
        }
    }

    #[test]
    fn test_read_cff2() {
        let data = [2, 0, 5, 0, 0];
        assert_eq!(
            CFF::from_bytes(&data),
            Err(CFFError::UnsupportedFeature(Unsupported::CFF2))
        );
    }

    #[test]
    fn test_read_bad_version() {
        let data = [3, 0, 4, 1];
        assert_eq!(
            CFF::from_bytes(&data),
            Err(CFFError::MalformedFont {
                table: Table::Header,
                offset: 0,
                cause: ParseError::BadVersion
            })
        );
    }

    #[test]
    fn test_read_font_set() {
        #[rustfmt::skip]
        let data = [
            1, 0, 4, 1, // header
            0, 2, 1, 1, 2, 3, b'A', b'B', // Name INDEX with two fonts
            0, 0, 0, 0, 0, 0,
        ];
        assert_eq!(
            CFF::from_bytes(&data),
            Err(CFFError::MalformedFont {
                table: Table::NameIndex,
                offset: 4,
                cause: ParseError::BadValue
            })
        );
    }

    #[test]
    fn test_read_fd_select_format0() {
        let mut cff = simple_font();
        let ros = vec![
            Operand::Integer(391),
            Operand::Integer(392),
            Operand::Integer(0),
        ];
        cff.top_dict.set(Operator::ROS, ros);
        cff.font_dicts = Some(vec![FontDict::new()]);
        cff.fd_select = Some(FDSelect::from_indices(&[0, 0, 0]).unwrap());
        let mut data = cff.to_bytes().unwrap();

        // Patch the FDSelect format
        let read = CFF::from_bytes(&data).unwrap();
        let offset = read
            .top_dict
            .get_i32(Operator::FD_SELECT)
            .unwrap()
            .unwrap() as usize;
        data[offset] = 0;
        assert_eq!(
            CFF::from_bytes(&data),
            Err(CFFError::UnsupportedFeature(Unsupported::FDSelectFormat(0)))
        );
    }

    #[test]
    fn test_read_charset_format0() {
        let mut data = simple_font().to_bytes().unwrap();

        // Patch the charset format
        let read = CFF::from_bytes(&data).unwrap();
        let offset = read.top_dict.get_i32(Operator::CHARSET).unwrap().unwrap() as usize;
        data[offset] = 0;
        assert_eq!(
            CFF::from_bytes(&data),
            Err(CFFError::UnsupportedFeature(Unsupported::CharsetFormat(0)))
        );
    }

    #[test]
    fn test_read_custom_encoding() {
        let mut cff = simple_font();
        cff.top_dict.set(Operator::ENCODING, vec![Operand::Integer(1000)]);
        let data = cff.to_bytes().unwrap();
        assert_eq!(
            CFF::from_bytes(&data),
            Err(CFFError::UnsupportedFeature(Unsupported::CustomEncoding))
        );
    }

    #[test]
    fn test_read_synthetic_font() {
        let mut cff = simple_font();
        let mut top_dict = TopDict::new();
        top_dict.set(Operator::SYNTHETIC_BASE, vec![Operand::Integer(1)]);
        for (operator, operands) in cff.top_dict.iter() {
            top_dict.set(*operator, operands.clone());
        }
        cff.top_dict = top_dict;
        let data = cff.to_bytes().unwrap();
        assert_eq!(
            CFF::from_bytes(&data),
            Err(CFFError::UnsupportedFeature(Unsupported::SyntheticFont))
        );
    }

    #[test]
    fn test_read_header_extension() {
        let mut ctxt = ReadScope::new(&[1, 0, 6, 4, 0xaa, 0xbb, 0x07]).ctxt();
        let header = ctxt.read::<Header>().unwrap();
        assert_eq!(header.hdr_size, 6);
        assert_eq!(ctxt.position(), 6);

        let mut buffer = WriteBuffer::new();
        Header::write(&mut buffer, &header).unwrap();
        assert_eq!(buffer.bytes(), &[1, 0, 4, 4]);

        #[rustfmt::skip]
        let data = [
            1, 0, 6, 1, 0xaa, 0xbb, // header with extension
            0, 1, 1, 1, 2, b'A', // Name INDEX
            0, 1, 1, 1, 1, // Top DICT INDEX: empty DICT
            0, 0, // String INDEX
            0, 0, // Global Subr INDEX
        ];
        let cff = CFF::from_bytes(&data).unwrap();
        assert_eq!(cff.header.hdr_size, 6);
        assert_eq!(cff.font_name(), Some("A"));
    }

    #[test]
    fn test_bad_offset_reports_top_dict_location() {
        #[rustfmt::skip]
        let data = [
            1, 0, 4, 1, // header
            0, 1, 1, 1, 2, b'A', // Name INDEX
            0, 1, 1, 1, 4, 0x1e, 0x1f, 17, // Top DICT INDEX: real CharStrings offset
            0, 0, // String INDEX
            0, 0, // Global Subr INDEX
        ];
        assert_eq!(
            CFF::from_bytes(&data),
            Err(CFFError::MalformedFont {
                table: Table::TopDict,
                offset: 10,
                cause: ParseError::BadValue,
            })
        );

        #[rustfmt::skip]
        let data = [
            1, 0, 4, 1, // header
            0, 1, 1, 1, 2, b'A', // Name INDEX
            0, 1, 1, 1, 3, 0x8b, 18, // Top DICT INDEX: Private with one operand
            0, 0, // String INDEX
            0, 0, // Global Subr INDEX
        ];
        assert_eq!(
            CFF::from_bytes(&data),
            Err(CFFError::MalformedFont {
                table: Table::TopDict,
                offset: 10,
                cause: ParseError::BadValue,
            })
        );

        #[rustfmt::skip]
        let data = [
            1, 0, 4, 1, // header
            0, 1, 1, 1, 2, b'A', // Name INDEX
            0, 1, 1, 1, 4, 0x90, 0x8a, 18, // Top DICT INDEX: Private at offset -1
            0, 0, // String INDEX
            0, 0, // Global Subr INDEX
        ];
        assert_eq!(
            CFF::from_bytes(&data),
            Err(CFFError::MalformedFont {
                table: Table::TopDict,
                offset: 10,
                cause: ParseError::BadOffset,
            })
        );
    }

    #[test]
    fn test_malformed_primitive_in_top_dict() {
        #[rustfmt::skip]
        let data = [
            1, 0, 4, 1, // header
            0, 1, 1, 1, 2, b'A', // Name INDEX
            0, 1, 1, 1, 3, 0x1e, 0xdf, // Top DICT INDEX: real with reserved nibble
            0, 0, // String INDEX
            0, 0, // Global Subr INDEX
        ];
        assert_eq!(
            CFF::from_bytes(&data),
            Err(CFFError::MalformedPrimitive {
                table: Table::TopDict,
                offset: 10
            })
        );
    }

    #[test]
    fn test_cff_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<CFF>();
    }
}

use std::convert::TryFrom;
use std::iter;

use log::{debug, trace};
use rustc_hash::{FxHashMap, FxHashSet};

use super::charstring::{subr_bias, CharString, SubroutineCall};
use super::{malformed, CFFError, FDSelect, Index, Operator, Private, SubroutineKind, Table, CFF};
use crate::error::{ParseError, WriteError};

/// A subset of a CFF font.
pub struct SubsetCFF {
    table: CFF,
    glyph_ids: Vec<u16>,
}

impl From<SubsetCFF> for CFF {
    fn from(subset: SubsetCFF) -> CFF {
        subset.table
    }
}

impl SubsetCFF {
    /// The ids of the retained glyphs in ascending order, always starting with glyph 0.
    pub fn glyph_ids(&self) -> &[u16] {
        &self.glyph_ids
    }

    pub fn table(&self) -> &CFF {
        &self.table
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, CFFError> {
        self.table.to_bytes()
    }
}

/// Subset the CFF font in `data` to `glyph_ids`, returning the serialised subset font.
pub fn subset_cff(data: &[u8], glyph_ids: &[u16]) -> Result<Vec<u8>, CFFError> {
    CFF::from_bytes(data)?.subset(glyph_ids)?.to_bytes()
}

/// A charstring or subroutine to scan for calls, along with the Font DICT whose local
/// subroutines it calls.
#[derive(Copy, Clone, Debug)]
enum Program {
    CharString { glyph_id: u16, fd: usize },
    Local { fd: usize, index: usize },
    Global { fd: usize, index: usize },
}

/// Subroutines reachable from the retained glyphs.
struct UsedSubrs {
    /// Local subroutines of each Font DICT.
    local: Vec<FxHashSet<usize>>,
    /// Global subroutines, and the Font DICTs of the glyphs they were reached from.
    global: FxHashMap<usize, FxHashSet<usize>>,
}

/// Dense renumbering of the subroutines that are kept from one Subrs INDEX.
struct Remap {
    /// Retained subroutines in ascending order. The position of each is its new index.
    old_ids: Vec<usize>,
    new_ids: FxHashMap<usize, usize>,
    /// Bias of the subset INDEX.
    bias: i32,
}

impl CFF {
    /// Subset this font to `glyph_ids` and the subroutines they call.
    ///
    /// Glyph 0 (`.notdef`) is always retained. Glyph ids are not renumbered: the charstrings of
    /// glyphs that are not retained are replaced with empty charstrings so the charset, and any
    /// tables outside the font that refer to glyph ids, stay valid. Subroutines and Font DICTs
    /// that are no longer used are dropped and the remaining ones renumbered, keeping their
    /// original order. Calls are rewritten to use the new numbering.
    ///
    /// **Known Limitations**
    ///
    /// The String INDEX is copied as-is.
    pub fn subset(&self, glyph_ids: &[u16]) -> Result<SubsetCFF, CFFError> {
        let num_glyphs = match &self.char_strings_index {
            Some(char_strings_index) => char_strings_index.len(),
            None => {
                return Err(CFFError::parse(
                    Table::CharStrings,
                    0,
                    ParseError::MissingValue,
                ))
            }
        };

        let mut glyph_ids = iter::once(0)
            .chain(glyph_ids.iter().copied())
            .collect::<Vec<_>>();
        glyph_ids.sort_unstable();
        glyph_ids.dedup();
        if let Some(&glyph_id) = glyph_ids
            .iter()
            .find(|&&glyph_id| usize::from(glyph_id) >= num_glyphs)
        {
            return Err(CFFError::InvalidGlyphId {
                glyph_id,
                num_glyphs,
            });
        }

        let mut glyphs = FxHashMap::default();
        for &glyph_id in &glyph_ids {
            glyphs.insert(glyph_id, self.font_dict_for_glyph(glyph_id)?);
        }
        let mut retained_fds = glyphs.values().copied().collect::<Vec<_>>();
        retained_fds.sort_unstable();
        retained_fds.dedup();

        let used_subrs = self.used_subrs(&glyph_ids, &glyphs)?;
        let locals = used_subrs.local.iter().map(Remap::new).collect::<Vec<_>>();
        let global = Remap::new(used_subrs.global.keys());

        // CharStrings, unselected glyphs inherit the Font DICT of the glyph before them
        let mut char_strings_index = Index::new();
        let mut glyph_fds = Vec::with_capacity(num_glyphs);
        let mut fd = 0;
        for glyph_id in 0..num_glyphs {
            let selected = u16::try_from(glyph_id)
                .ok()
                .and_then(|glyph_id| glyphs.get(&glyph_id).map(|&fd| (glyph_id, fd)));
            let data = match selected {
                Some((glyph_id, glyph_fd)) => {
                    fd = glyph_fd;
                    let program = Program::CharString { glyph_id, fd };
                    self.rewrite_program(program, &locals, &global)?
                }
                None => Vec::new(),
            };
            char_strings_index.push(data);
            glyph_fds.push(fd);
        }

        let global_subr_index = self.subset_global_subrs(&used_subrs, &locals, &global)?;

        let fd_select = match self.fd_select {
            Some(_) => {
                let mut indices = Vec::with_capacity(glyph_fds.len());
                for fd in &glyph_fds {
                    let new_fd = retained_fds.binary_search(fd).map_err(|_| {
                        CFFError::parse(Table::FDSelect, 0, ParseError::BadIndex)
                    })?;
                    indices.push(u8::try_from(new_fd).map_err(WriteError::from)?);
                }
                Some(FDSelect::from_indices(&indices)?)
            }
            None => None,
        };

        let (font_dicts, private_fds) = match &self.font_dicts {
            Some(font_dicts) => {
                let font_dicts = retained_fds
                    .iter()
                    .filter_map(|&fd| font_dicts.get(fd).cloned())
                    .collect::<Vec<_>>();
                (Some(font_dicts), retained_fds.clone())
            }
            None => (None, (0..self.privates.len()).collect()),
        };
        let privates = private_fds
            .iter()
            .map(|&fd| self.subset_private(fd, &locals, &global))
            .collect::<Result<Vec<_>, _>>()?;

        debug!(
            "subset CFF to {} of {} glyphs, {} of {} global subrs, {} local subrs, {} font dicts",
            glyph_ids.len(),
            num_glyphs,
            global_subr_index.len(),
            self.global_subr_index.len(),
            locals.iter().map(|remap| remap.old_ids.len()).sum::<usize>(),
            private_fds.len(),
        );

        let table = CFF {
            header: self.header.clone(),
            name_index: self.name_index.clone(),
            top_dict: self.top_dict.clone(),
            string_index: self.string_index.clone(),
            global_subr_index,
            char_strings_index: Some(char_strings_index),
            charset: self.charset.clone(),
            fd_select,
            font_dicts,
            privates,
        };

        Ok(SubsetCFF { table, glyph_ids })
    }

    /// Find every subroutine reachable from `glyph_ids`.
    fn used_subrs(
        &self,
        glyph_ids: &[u16],
        glyph_fds: &FxHashMap<u16, usize>,
    ) -> Result<UsedSubrs, CFFError> {
        let slots = self
            .font_dicts
            .as_ref()
            .map_or(1, Vec::len)
            .max(self.privates.len());
        let mut used = UsedSubrs {
            local: vec![FxHashSet::default(); slots],
            global: FxHashMap::default(),
        };

        let mut stack = Vec::with_capacity(glyph_ids.len());
        for &glyph_id in glyph_ids.iter().rev() {
            if let Some(&fd) = glyph_fds.get(&glyph_id) {
                stack.push(Program::CharString { glyph_id, fd });
            }
        }

        // Subroutines are marked when first seen so recursive calls are only followed once
        while let Some(program) = stack.pop() {
            let fd = program.fd();
            let (_, charstring) = self.read_program(program)?;
            for call in charstring.subroutine_calls() {
                let (_, index) = self.resolve_call(program, call)?;
                let callee = match call.kind {
                    SubroutineKind::Local => {
                        if !used.local[fd].insert(index) {
                            continue;
                        }
                        Program::Local { fd, index }
                    }
                    SubroutineKind::Global => {
                        if !used.global.entry(index).or_default().insert(fd) {
                            continue;
                        }
                        Program::Global { fd, index }
                    }
                };
                trace!("{} calls {}", program.table(), callee.table());
                stack.push(callee);
            }
        }

        Ok(used)
    }

    fn read_program(&self, program: Program) -> Result<(&[u8], CharString), CFFError> {
        let data = match program {
            Program::CharString { glyph_id, .. } => self
                .char_strings_index
                .as_ref()
                .and_then(|index| index.read_object(usize::from(glyph_id))),
            Program::Local { fd, index } => self
                .local_subr_index(fd)
                .and_then(|local_subr_index| local_subr_index.read_object(index)),
            Program::Global { index, .. } => self.global_subr_index.read_object(index),
        }
        .ok_or_else(|| CFFError::parse(program.table(), 0, ParseError::BadIndex))?;

        let charstring = CharString::parse(data).map_err(malformed(program.table(), 0))?;
        Ok((data, charstring))
    }

    fn subr_count(&self, kind: SubroutineKind, fd: usize) -> usize {
        match kind {
            SubroutineKind::Local => self.local_subr_index(fd).map_or(0, Index::len),
            SubroutineKind::Global => self.global_subr_index.len(),
        }
    }

    /// Returns the token position of the operand of `call` and the index of the subroutine it
    /// calls in the original font.
    fn resolve_call(
        &self,
        program: Program,
        call: SubroutineCall,
    ) -> Result<(usize, usize), CFFError> {
        let count = self.subr_count(call.kind, program.fd());
        call.operand
            .and_then(|(position, operand)| {
                let index = operand.checked_add(subr_bias(count))?;
                let index = usize::try_from(index).ok().filter(|&index| index < count)?;
                Some((position, index))
            })
            .ok_or_else(|| CFFError::ReferenceIntegrity {
                table: program.table(),
                kind: call.kind,
                operand: call.operand.map(|(_, operand)| operand),
                count,
            })
    }

    /// Returns the charstring of `program` with every call renumbered.
    fn rewrite_program(
        &self,
        program: Program,
        locals: &[Remap],
        global: &Remap,
    ) -> Result<Vec<u8>, CFFError> {
        let (data, mut charstring) = self.read_program(program)?;
        let calls = charstring.subroutine_calls().collect::<Vec<_>>();
        if calls.is_empty() {
            return Ok(data.to_vec());
        }

        for call in calls {
            let (position, index) = self.resolve_call(program, call)?;
            let remap = match call.kind {
                SubroutineKind::Local => locals.get(program.fd()),
                SubroutineKind::Global => Some(global),
            };
            let operand = remap
                .and_then(|remap| remap.operand(index))
                .ok_or_else(|| CFFError::ReferenceIntegrity {
                    table: program.table(),
                    kind: call.kind,
                    operand: call.operand.map(|(_, operand)| operand),
                    count: self.subr_count(call.kind, program.fd()),
                })?;
            charstring.set_operand(position, operand)?;
        }

        Ok(charstring.to_bytes()?)
    }

    /// Build the Global Subr INDEX of the subset.
    ///
    /// A global subroutine reached from glyphs using different Font DICTs is rewritten for each
    /// of them, the results must agree.
    fn subset_global_subrs(
        &self,
        used_subrs: &UsedSubrs,
        locals: &[Remap],
        global: &Remap,
    ) -> Result<Index, CFFError> {
        let mut global_subr_index = Index::new();
        for &index in &global.old_ids {
            let mut fds = used_subrs
                .global
                .get(&index)
                .into_iter()
                .flatten()
                .copied()
                .collect::<Vec<_>>();
            fds.sort_unstable();

            let rewrites = fds
                .into_iter()
                .map(|fd| self.rewrite_program(Program::Global { fd, index }, locals, global))
                .collect::<Result<Vec<_>, _>>()?;
            if rewrites.windows(2).any(|pair| pair[0] != pair[1]) {
                return Err(CFFError::SharedLocalCall { global_subr: index });
            }
            global_subr_index.push(rewrites.into_iter().next().unwrap_or_default());
        }

        Ok(global_subr_index)
    }

    /// The Private DICT of Font DICT `fd` with only the retained local subroutines.
    fn subset_private(
        &self,
        fd: usize,
        locals: &[Remap],
        global: &Remap,
    ) -> Result<Option<Private>, CFFError> {
        let private = match self.privates.get(fd) {
            Some(Some(private)) => private,
            _ => return Ok(None),
        };

        let mut dict = private.dict.clone();
        let local_subr_index = match locals.get(fd) {
            Some(remap) if !remap.old_ids.is_empty() => {
                let mut local_subr_index = Index::new();
                for &index in &remap.old_ids {
                    let program = Program::Local { fd, index };
                    local_subr_index.push(self.rewrite_program(program, locals, global)?);
                }
                Some(local_subr_index)
            }
            _ => {
                dict.remove(Operator::SUBRS);
                None
            }
        };

        Ok(Some(Private {
            dict,
            local_subr_index,
        }))
    }
}

impl Program {
    fn fd(self) -> usize {
        match self {
            Program::CharString { fd, .. } | Program::Local { fd, .. } | Program::Global { fd, .. } => {
                fd
            }
        }
    }

    fn table(self) -> Table {
        match self {
            Program::CharString { glyph_id, .. } => Table::CharString(glyph_id),
            Program::Local { fd, index } => Table::LocalSubr(fd, index),
            Program::Global { index, .. } => Table::GlobalSubr(index),
        }
    }
}

impl Remap {
    fn new<'a>(used: impl IntoIterator<Item = &'a usize>) -> Remap {
        let mut old_ids = used.into_iter().copied().collect::<Vec<_>>();
        old_ids.sort_unstable();
        let new_ids = old_ids
            .iter()
            .enumerate()
            .map(|(new_id, &old_id)| (old_id, new_id))
            .collect();
        let bias = subr_bias(old_ids.len());

        Remap {
            old_ids,
            new_ids,
            bias,
        }
    }

    /// The operand that calls `old_id` in the subset.
    fn operand(&self, old_id: usize) -> Option<i32> {
        let new_id = *self.new_ids.get(&old_id)?;
        i32::try_from(new_id).ok().map(|new_id| new_id - self.bias)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remap_keeps_order() {
        let used = [40, 3, 7].iter().copied().collect::<FxHashSet<usize>>();
        let remap = Remap::new(&used);
        assert_eq!(remap.old_ids, [3, 7, 40]);
        assert_eq!(remap.operand(3), Some(-107));
        assert_eq!(remap.operand(40), Some(-105));
        assert_eq!(remap.operand(8), None);
    }

    #[test]
    fn test_remap_bias_follows_new_count() {
        let used = (0..2000).collect::<FxHashSet<usize>>();
        let remap = Remap::new(&used);
        assert_eq!(remap.bias, 1131);
        assert_eq!(remap.operand(1999), Some(1999 - 1131));

        let used = (1000..2000).collect::<FxHashSet<usize>>();
        let remap = Remap::new(&used);
        assert_eq!(remap.bias, 107);
        assert_eq!(remap.operand(1000), Some(-107));
    }
}

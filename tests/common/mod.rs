#![allow(dead_code)]

use cff_subset::cff::{
    Charset, FDSelect, FontDict, Header, Index, Operand, Operator, Private, PrivateDict, TopDict,
    CFF,
};

/// Build a name-keyed font with the supplied charstrings and subroutines.
///
/// Glyph `n` is given SID `390 + n`.
pub fn name_keyed_font(
    char_strings: Vec<Vec<u8>>,
    local_subrs: Vec<Vec<u8>>,
    global_subrs: Vec<Vec<u8>>,
) -> CFF {
    let charset = Charset::from_ids((1..char_strings.len()).map(|glyph_id| 390 + glyph_id as u16));
    let mut top_dict = TopDict::new();
    top_dict.set(Operator::FULL_NAME, vec![Operand::Integer(391)]);

    CFF {
        header: header(),
        name_index: Index::from(vec![b"Test-Regular".to_vec()]),
        top_dict,
        string_index: Index::from(vec![b"Test Regular".to_vec(), b"Test".to_vec()]),
        global_subr_index: Index::from(global_subrs),
        char_strings_index: Some(Index::from(char_strings)),
        charset: Some(charset),
        fd_select: None,
        font_dicts: None,
        privates: vec![Some(private(local_subrs))],
    }
}

/// Build a CID-keyed font. Glyph `n` uses Font DICT `fd_indices[n]` and Font DICT `fd` has the
/// local subroutines `local_subrs[fd]`.
///
/// Each Font DICT is given the FontName SID `391 + fd`.
pub fn cid_keyed_font(
    char_strings: Vec<Vec<u8>>,
    fd_indices: &[u8],
    local_subrs: Vec<Vec<Vec<u8>>>,
    global_subrs: Vec<Vec<u8>>,
) -> CFF {
    assert_eq!(char_strings.len(), fd_indices.len());
    let charset = Charset::from_ids((1..char_strings.len()).map(|cid| cid as u16));
    let mut top_dict = TopDict::new();
    top_dict.set(
        Operator::ROS,
        vec![
            Operand::Integer(391),
            Operand::Integer(392),
            Operand::Integer(0),
        ],
    );
    top_dict.set(
        Operator::CID_COUNT,
        vec![Operand::Integer(char_strings.len() as i32)],
    );

    let font_dicts = (0..local_subrs.len())
        .map(|fd| {
            let mut font_dict = FontDict::new();
            font_dict.set(Operator::FONT_NAME, vec![Operand::Integer(391 + fd as i32)]);
            font_dict
        })
        .collect();
    let privates = local_subrs
        .into_iter()
        .map(|subrs| Some(private(subrs)))
        .collect();

    CFF {
        header: header(),
        name_index: Index::from(vec![b"Test-CID".to_vec()]),
        top_dict,
        string_index: Index::from(vec![
            b"Adobe".to_vec(),
            b"Identity".to_vec(),
            b"Test-CID-0".to_vec(),
            b"Test-CID-1".to_vec(),
            b"Test-CID-2".to_vec(),
        ]),
        global_subr_index: Index::from(global_subrs),
        char_strings_index: Some(Index::from(char_strings)),
        charset: Some(charset),
        fd_select: Some(FDSelect::from_indices(fd_indices).unwrap()),
        font_dicts: Some(font_dicts),
        privates,
    }
}

fn header() -> Header {
    Header {
        major: 1,
        minor: 0,
        hdr_size: 4,
        off_size: 4,
    }
}

fn private(local_subrs: Vec<Vec<u8>>) -> Private {
    let mut dict = PrivateDict::new();
    dict.set(Operator::NOMINAL_WIDTH_X, vec![Operand::Integer(500)]);
    let local_subr_index = if local_subrs.is_empty() {
        None
    } else {
        Some(Index::from(local_subrs))
    };
    Private {
        dict,
        local_subr_index,
    }
}

/// The objects of `index` as owned vectors, for comparing with expected data.
pub fn objects(index: &Index) -> Vec<Vec<u8>> {
    index.iter().map(<[u8]>::to_vec).collect()
}

#![warn(rust_2018_idioms)]

//! Reading, writing, and subsetting of CFF font programs.
//!
//! ```no_run
//! # fn main() -> Result<(), cff_subset::cff::CFFError> {
//! let data = std::fs::read("font.cff").unwrap_or_default();
//! let subset = cff_subset::subset_cff(&data, &[3, 17, 42])?;
//! # let _ = subset;
//! # Ok(())
//! # }
//! ```

/// Reading and writing of binary data.
pub mod binary;
pub mod cff;
pub mod error;

pub use crate::cff::{subset_cff, CFF};

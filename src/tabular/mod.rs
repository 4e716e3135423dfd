//! Artifact parsing: delimited text, spreadsheets, and zip bundles, all
//! normalized into [`Table`](crate::core::types::Table).

pub mod archive;
pub mod csv;
pub mod xlsx;

use std::path::Path;

use crate::core::error::{HarvestError, Result};
use crate::core::types::{ArtifactFormat, Table};

pub use archive::unpack_zip;
pub use csv::parse_csv_bytes;
pub use xlsx::parse_xlsx_file;

/// How to interpret the raw grid of an artifact.
#[derive(Debug, Clone)]
pub struct ParseOptions {
    /// Zero-based row (after `skip_rows`) holding the column names.
    pub header_row: usize,
    pub delimiter: u8,
    /// Zero-based physical row indexes to drop before the header is applied.
    pub skip_rows: Vec<usize>,
}

impl Default for ParseOptions {
    fn default() -> Self {
        Self {
            header_row: 0,
            delimiter: b',',
            skip_rows: Vec::new(),
        }
    }
}

impl ParseOptions {
    pub fn with_header_row(mut self, row: usize) -> Self {
        self.header_row = row;
        self
    }

    pub fn tab_separated(mut self) -> Self {
        self.delimiter = b'\t';
        self
    }

    pub fn with_skip_rows(mut self, rows: Vec<usize>) -> Self {
        self.skip_rows = rows;
        self
    }
}

/// Parse a downloaded artifact into a table.
///
/// Zip bundles are containers, not tables; callers unpack them with
/// [`unpack_zip`] and parse the members individually.
pub fn parse_artifact(path: &Path, format: ArtifactFormat, opts: &ParseOptions) -> Result<Table> {
    match format {
        ArtifactFormat::Csv => {
            let bytes = std::fs::read(path)?;
            csv::parse_csv_bytes(&bytes, opts)
        }
        ArtifactFormat::Xlsx => xlsx::parse_xlsx_file(path, opts),
        ArtifactFormat::Zip => Err(HarvestError::Parse(format!(
            "{} is an archive and must be unpacked first",
            path.display()
        ))),
    }
}

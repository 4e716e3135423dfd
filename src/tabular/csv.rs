//! Delimited-text parsing.
//!
//! The portals export CSVs with every flaw the format allows: UTF-8 BOMs,
//! ragged rows, decorative banner rows above the header, and occasional
//! non-UTF-8 bytes. The reader here is permissive on input and strict on
//! output shape.

use crate::core::error::{HarvestError, Result};
use crate::core::types::Table;

use super::ParseOptions;

const UTF8_BOM: &[u8] = &[0xEF, 0xBB, 0xBF];

/// Parse delimited bytes into a table per `opts`.
///
/// Rows listed in `opts.skip_rows` are dropped by physical index first; the
/// header row is then selected from what remains. A header row beyond the
/// end of the data is a parse error, not an empty table.
pub fn parse_csv_bytes(bytes: &[u8], opts: &ParseOptions) -> Result<Table> {
    let bytes = bytes.strip_prefix(UTF8_BOM).unwrap_or(bytes);
    let text = String::from_utf8_lossy(bytes);

    let mut reader = ::csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .delimiter(opts.delimiter)
        .from_reader(text.as_bytes());

    let mut grid: Vec<Vec<String>> = Vec::new();
    for (index, record) in reader.records().enumerate() {
        let record = record.map_err(|e| HarvestError::Parse(e.to_string()))?;
        if opts.skip_rows.contains(&index) {
            continue;
        }
        grid.push(record.iter().map(|s| s.to_string()).collect());
    }

    table_from_grid(grid, opts)
}

/// Apply the header-row selection shared by the csv and xlsx readers.
pub(super) fn table_from_grid(mut grid: Vec<Vec<String>>, opts: &ParseOptions) -> Result<Table> {
    if opts.header_row >= grid.len() {
        return Err(HarvestError::Parse(format!(
            "header row {} is beyond the end of the data ({} rows)",
            opts.header_row,
            grid.len()
        )));
    }
    let rows = grid.split_off(opts.header_row + 1);
    let columns = grid
        .pop()
        .map(|r| r.into_iter().map(|c| c.trim().to_string()).collect())
        .unwrap_or_default();
    Ok(Table::new(columns, rows))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_csv_with_default_options() {
        let table =
            parse_csv_bytes(b"id,name\n1,Ada\n2,Grace\n", &ParseOptions::default()).unwrap();
        assert_eq!(table.columns, vec!["id", "name"]);
        assert_eq!(table.row_count(), 2);
        assert_eq!(table.rows[1], vec!["2", "Grace"]);
    }

    #[test]
    fn bom_is_stripped_before_the_header() {
        let mut bytes = vec![0xEF, 0xBB, 0xBF];
        bytes.extend_from_slice(b"id,name\n1,Ada\n");
        let table = parse_csv_bytes(&bytes, &ParseOptions::default()).unwrap();
        assert_eq!(table.columns[0], "id");
    }

    #[test]
    fn banner_rows_above_the_header_are_skipped() {
        let raw = b"District Export\nGenerated 2026-08-01\nid,name\n1,Ada\n";
        let opts = ParseOptions::default().with_header_row(2);
        let table = parse_csv_bytes(raw, &opts).unwrap();
        assert_eq!(table.columns, vec!["id", "name"]);
        assert_eq!(table.row_count(), 1);
    }

    #[test]
    fn skip_rows_drop_by_physical_index() {
        // Banner on row 0 and a blank separator on row 2; header ends up first.
        let raw = b"BANNER,,\nid,name\n,,\n1,Ada\n";
        let opts = ParseOptions::default().with_skip_rows(vec![0, 2]);
        let table = parse_csv_bytes(raw, &opts).unwrap();
        assert_eq!(table.columns, vec!["id", "name"]);
        assert_eq!(table.rows, vec![vec!["1", "Ada"]]);
    }

    #[test]
    fn tab_separated_export() {
        let table =
            parse_csv_bytes(b"id\tname\n1\tAda\n", &ParseOptions::default().tab_separated())
                .unwrap();
        assert_eq!(table.columns, vec!["id", "name"]);
        assert_eq!(table.rows[0], vec!["1", "Ada"]);
    }

    #[test]
    fn header_beyond_eof_is_a_parse_error() {
        let err = parse_csv_bytes(b"only,row\n", &ParseOptions::default().with_header_row(5))
            .unwrap_err();
        assert!(matches!(err, HarvestError::Parse(_)));
    }

    #[test]
    fn ragged_rows_are_normalized_to_the_header_width() {
        let table = parse_csv_bytes(b"a,b,c\n1\n1,2,3,4\n", &ParseOptions::default()).unwrap();
        assert_eq!(table.rows[0], vec!["1", "", ""]);
        assert_eq!(table.rows[1], vec!["1", "2", "3"]);
    }
}

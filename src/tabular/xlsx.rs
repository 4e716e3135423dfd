//! Spreadsheet parsing via `calamine`. The meal portal exports both modern
//! `.xlsx` and legacy `.xls`, so the auto-detecting opener is used.

use std::path::Path;

use calamine::{open_workbook_auto, Data, Reader};

use crate::core::error::{HarvestError, Result};
use crate::core::types::Table;

use super::csv::table_from_grid;
use super::ParseOptions;

/// Parse the first worksheet of a spreadsheet into a table.
pub fn parse_xlsx_file(path: &Path, opts: &ParseOptions) -> Result<Table> {
    let mut workbook = open_workbook_auto(path)
        .map_err(|e| HarvestError::Parse(format!("{}: {e}", path.display())))?;
    let range = workbook
        .worksheet_range_at(0)
        .ok_or_else(|| HarvestError::Parse(format!("{}: workbook has no sheets", path.display())))?
        .map_err(|e| HarvestError::Parse(format!("{}: {e}", path.display())))?;

    let grid: Vec<Vec<String>> = range
        .rows()
        .enumerate()
        .filter(|(index, _)| !opts.skip_rows.contains(index))
        .map(|(_, row)| row.iter().map(cell_to_string).collect())
        .collect();

    table_from_grid(grid, opts)
}

fn cell_to_string(cell: &Data) -> String {
    match cell {
        Data::Empty => String::new(),
        other => other.to_string(),
    }
}

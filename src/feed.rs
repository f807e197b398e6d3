//! Splits the exported sheet text into rows of raw fields.
//!
//! The export is a fixed, simple comma-separated dump. Quoted fields that
//! contain commas are NOT honoured: `"1,046.25"` becomes two fields. Sources
//! that need quoting must publish a different export rather than rely on
//! this parser to grow CSV semantics.

use crate::errors::{AppError, AppResult};

const FIELD_DELIMITER: char = ',';

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawRow(Vec<String>);

impl RawRow {
    pub fn new(fields: Vec<String>) -> Self {
        Self(fields)
    }

    pub fn field(&self, index: usize) -> Option<&str> {
        self.0.get(index).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

pub fn parse_rows(text: &str) -> Vec<RawRow> {
    text.lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| {
            RawRow::new(
                line.split(FIELD_DELIMITER)
                    .map(str::to_string)
                    .collect(),
            )
        })
        .collect()
}

pub fn take_row(mut rows: Vec<RawRow>, index: usize) -> AppResult<RawRow> {
    if index >= rows.len() {
        return Err(AppError::Parse(format!(
            "feed has {} non-empty rows; totals row {index} is missing",
            rows.len()
        )));
    }
    Ok(rows.swap_remove(index))
}

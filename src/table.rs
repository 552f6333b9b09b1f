//! SourceTable - the tabular value flowing through the pipeline
//!
//! Every Source resolves into a `SourceTable` and every Compute consumes and
//! produces one. Cells are always strings; numeric interpretation happens in the
//! compute step that needs it.
//!
//! ## Text Form
//!
//! Protocol output and `Static` sources use the semicolon-separated text form:
//!
//! ```text
//! enclosure-1;1;healthy;
//! enclosure-2;0;failed;
//! ```
//!
//! One trailing separator per line is tolerated, blank lines are skipped.

use serde::{Deserialize, Serialize};

/// Default cell separator of the text form
pub const TABLE_SEP: &str = ";";

/// An ordered list of rows of string cells
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceTable {
    /// Rows in resolution order
    pub rows: Vec<Vec<String>>,

    /// Optional column names (set by table-shaped protocols like SNMP tables)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub headers: Option<Vec<String>>,

    /// Unparsed protocol output, kept for Json2Csv / Xml2Csv
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_data: Option<String>,
}

impl SourceTable {
    /// Create a table from rows
    pub fn new(rows: Vec<Vec<String>>) -> Self {
        Self {
            rows,
            headers: None,
            raw_data: None,
        }
    }

    /// An empty table, the result of every failed or absent source
    pub fn empty() -> Self {
        Self::default()
    }

    /// Parse the text form using the given separator
    pub fn from_csv(text: &str, separator: &str) -> Self {
        Self::new(parse_rows(text, separator))
    }

    /// Parse the text form and keep the text as raw data
    pub fn from_raw(text: impl Into<String>) -> Self {
        let text = text.into();
        let mut table = Self::from_csv(&text, TABLE_SEP);
        table.raw_data = Some(text);
        table
    }

    #[must_use]
    pub fn with_headers(mut self, headers: Vec<String>) -> Self {
        self.headers = Some(headers);
        self
    }

    /// Render the rows in the text form (each line ends with a separator)
    pub fn to_csv(&self) -> String {
        let mut out = String::new();
        for row in &self.rows {
            for cell in row {
                out.push_str(cell);
                out.push_str(TABLE_SEP);
            }
            out.push('\n');
        }
        out
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    /// Width of the widest row
    pub fn column_count(&self) -> usize {
        self.rows.iter().map(Vec::len).max().unwrap_or(0)
    }

    /// True when every row has the same number of cells
    pub fn is_rectangular(&self) -> bool {
        let mut widths = self.rows.iter().map(Vec::len);
        match widths.next() {
            Some(first) => widths.all(|w| w == first),
            None => true,
        }
    }

    /// Pad short rows with empty cells so every row has the widest row's width
    pub fn pad_rows(&mut self) {
        let width = self.column_count();
        for row in &mut self.rows {
            row.resize(width, String::new());
        }
    }

    /// Deep copy without empty rows (what a `Copy` source yields)
    pub fn copy_non_empty(&self) -> Self {
        Self {
            rows: self
                .rows
                .iter()
                .filter(|row| !row.is_empty())
                .cloned()
                .collect(),
            headers: self.headers.clone(),
            raw_data: self.raw_data.clone(),
        }
    }

    /// Cell at 1-based row/column coordinates
    pub fn cell(&self, row: usize, column: usize) -> Option<&str> {
        self.rows
            .get(row.checked_sub(1)?)?
            .get(column.checked_sub(1)?)
            .map(String::as_str)
    }
}

/// Split text into rows; one trailing separator per line is dropped
pub fn parse_rows(text: &str, separator: &str) -> Vec<Vec<String>> {
    text.lines()
        .map(|line| line.trim_end_matches('\r'))
        .filter(|line| !line.trim().is_empty())
        .map(|line| split_line(line, separator))
        .collect()
}

/// Split one line into cells; a single trailing separator does not create an empty cell
pub fn split_line(line: &str, separator: &str) -> Vec<String> {
    if separator.is_empty() {
        return vec![line.to_string()];
    }
    let line = line.strip_suffix(separator).unwrap_or(line);
    line.split(separator).map(str::to_string).collect()
}

//! Row and column selection: KeepOnlyMatchingLines, ExcludeMatchingLines, KeepColumns

use std::collections::HashSet;

use regex::{Regex, RegexBuilder};

use crate::table::SourceTable;

use super::Step;

/// Keep (or drop, when `keep` is false) the rows whose cell matches
///
/// The regexp is case-insensitive and may match anywhere in the cell; the value
/// list is comma-separated and compared case-insensitively. With both present a
/// row must satisfy both. Rows too short for the column are left in place.
pub(super) fn matching_lines(
    table: &mut SourceTable,
    column: usize,
    regexp: Option<&str>,
    value_list: Option<&str>,
    keep: bool,
    step: &mut Step<'_>,
) {
    if !step.valid_column(column) {
        return;
    }

    let pattern = match regexp.filter(|p| !p.is_empty()).map(compile) {
        Some(Ok(re)) => Some(re),
        Some(Err(e)) => {
            step.warn(format!("invalid regexp: {e}"));
            return;
        }
        None => None,
    };

    let values: Option<HashSet<String>> = value_list.filter(|l| !l.is_empty()).map(|list| {
        list.split(',')
            .map(|v| v.trim().to_lowercase())
            .collect()
    });

    if pattern.is_none() && values.is_none() {
        return;
    }

    let mut short_rows = Vec::new();
    let mut position = 0;
    table.rows.retain(|row| {
        position += 1;
        let Some(cell) = row.get(column - 1) else {
            short_rows.push(position);
            return true;
        };
        let matches = pattern.as_ref().is_none_or(|re| re.is_match(cell))
            && values
                .as_ref()
                .is_none_or(|set| set.contains(&cell.trim().to_lowercase()));
        matches == keep
    });

    for row in short_rows {
        step.warn(format!("row {row} has no column {column}, kept as is"));
    }
}

fn compile(pattern: &str) -> Result<Regex, regex::Error> {
    RegexBuilder::new(pattern).case_insensitive(true).build()
}

/// Keep the listed columns (e.g. `"1,3"`), in ascending order
pub(super) fn keep_columns(table: &mut SourceTable, column_numbers: &str, step: &mut Step<'_>) {
    let parsed: Result<Vec<usize>, _> = column_numbers
        .split(',')
        .map(str::trim)
        .filter(|n| !n.is_empty())
        .map(str::parse::<usize>)
        .collect();

    let mut columns = match parsed {
        Ok(columns) if !columns.is_empty() => columns,
        _ => {
            step.warn(format!("invalid column list '{column_numbers}'"));
            return;
        }
    };
    columns.sort_unstable();
    columns.dedup();

    let narrowest = table.rows.iter().map(Vec::len).min().unwrap_or(0);
    if columns[0] == 0 || (!table.is_empty() && columns[columns.len() - 1] > narrowest) {
        step.warn(format!(
            "column list '{column_numbers}' does not fit a table of width {narrowest}"
        ));
        return;
    }

    for row in &mut table.rows {
        *row = columns.iter().map(|c| std::mem::take(&mut row[c - 1])).collect();
    }
}

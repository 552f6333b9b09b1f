//! Sources computed by the resolver from already-resolved tables

use std::collections::{BTreeMap, HashMap};

use tracing::warn;

use crate::connector::SourceKind;
use crate::error::Diagnostic;
use crate::table::{SourceTable, TABLE_SEP, split_line};

/// Execute a Copy, Static, TableUnion or TableJoin source
///
/// `tables` holds every table resolved so far in the job. Returns `None` for
/// protocol sources.
pub(super) fn execute(
    key: &str,
    kind: &SourceKind,
    tables: &BTreeMap<String, SourceTable>,
    diagnostics: &mut Vec<Diagnostic>,
) -> Option<SourceTable> {
    let table = match kind {
        SourceKind::Static { value } => {
            let mut table = SourceTable::from_raw(value.clone());
            table.pad_rows();
            table
        }

        SourceKind::Copy { from } => find(tables, key, from, diagnostics)
            .map(SourceTable::copy_non_empty)
            .unwrap_or_default(),

        SourceKind::TableUnion { tables: references } => {
            let parts: Vec<&SourceTable> = references
                .iter()
                .filter_map(|r| find(tables, key, r, diagnostics))
                .collect();
            union(&parts)
        }

        SourceKind::TableJoin {
            left_table,
            right_table,
            left_key_column,
            right_key_column,
            default_right_line,
        } => {
            let left = find(tables, key, left_table, diagnostics);
            let right = find(tables, key, right_table, diagnostics);
            match (left, right) {
                (Some(left), Some(right)) if *left_key_column >= 1 && *right_key_column >= 1 => {
                    join(
                        left,
                        right,
                        *left_key_column,
                        *right_key_column,
                        default_right_line.as_deref(),
                    )
                }
                (Some(_), Some(_)) => {
                    diagnostics.push(Diagnostic::data(
                        format!("source({key})"),
                        "key columns are 1-based",
                    ));
                    SourceTable::empty()
                }
                _ => SourceTable::empty(),
            }
        }

        _ => return None,
    };

    Some(table)
}

fn find<'t>(
    tables: &'t BTreeMap<String, SourceTable>,
    key: &str,
    reference: &str,
    diagnostics: &mut Vec<Diagnostic>,
) -> Option<&'t SourceTable> {
    let table = tables.get(reference);
    if table.is_none() {
        warn!("source {key} references unknown source '{reference}'");
        diagnostics.push(Diagnostic::data(
            format!("source({key})"),
            format!("references unknown source '{reference}'"),
        ));
    }
    table
}

/// Rows of every table in order; raw data joined by newlines
pub(super) fn union(tables: &[&SourceTable]) -> SourceTable {
    let rows = tables.iter().flat_map(|t| t.rows.iter().cloned()).collect();
    let raw: Vec<&str> = tables.iter().filter_map(|t| t.raw_data.as_deref()).collect();

    let mut table = SourceTable::new(rows);
    if !raw.is_empty() {
        table.raw_data = Some(raw.join("\n"));
    }
    table
}

/// Case-insensitive equi-join of two tables on 1-based key columns
///
/// Each left row is concatenated with every matching right row. A left row
/// without match is completed by `default_right_line` when there is one and
/// dropped otherwise.
pub(super) fn join(
    left: &SourceTable,
    right: &SourceTable,
    left_key_column: usize,
    right_key_column: usize,
    default_right_line: Option<&str>,
) -> SourceTable {
    let mut index: HashMap<String, Vec<&Vec<String>>> = HashMap::new();
    for row in &right.rows {
        if let Some(key) = row.get(right_key_column - 1) {
            index.entry(key.to_lowercase()).or_default().push(row);
        }
    }

    let default_row = default_right_line.map(|line| split_line(line, TABLE_SEP));

    let mut rows = Vec::new();
    for left_row in &left.rows {
        let matches = left_row
            .get(left_key_column - 1)
            .and_then(|key| index.get(&key.to_lowercase()));

        match (matches, &default_row) {
            (Some(matches), _) => {
                for right_row in matches {
                    rows.push(left_row.iter().chain(right_row.iter()).cloned().collect());
                }
            }
            (None, Some(default_row)) => {
                rows.push(left_row.iter().chain(default_row.iter()).cloned().collect());
            }
            (None, None) => {}
        }
    }

    let mut table = SourceTable::new(rows);
    if !table.is_rectangular() {
        table.pad_rows();
    }
    table
}

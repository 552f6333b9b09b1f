//! Compute pipeline - ordered transformations over a SourceTable
//!
//! Each [`Compute`] is a pure function `SourceTable -> SourceTable`. The pipeline
//! applies a source's computes strictly in declaration order, each step consuming
//! the output of the previous one:
//!
//! ```text
//! protocol output ─► compute(1) ─► compute(2) ─► ... ─► resolved table
//!                        │             │
//!                        └─ diagnostics (data warnings, never failures)
//! ```
//!
//! ## Totality
//!
//! A compute never fails the table. Malformed runtime data degrades one cell or
//! one row:
//!
//! - an out-of-range column leaves that row untouched
//! - an unparsable number, hex value or zero divisor follows the host's
//!   [`DataErrorPolicy`] (leave the cell unchanged by default, or drop the row)
//! - an invalid declaration (bad regexp, unknown translation table, non-numeric
//!   literal operand) turns the whole step into a no-op
//!
//! Every one of those cases is reported as a [`Diagnostic`] of kind `Data`.
//!
//! Columns are 1-based everywhere. Operands written `$n` read column `n` of the
//! current row.

mod arithmetic;
mod filter;
mod markup;
mod text;
mod translate;

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::connector::TranslationTable;
use crate::error::Diagnostic;
use crate::table::SourceTable;

pub use arithmetic::ArithmeticOp;

/// One declarative transformation step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum Compute {
    Add {
        column: usize,
        value: String,
    },
    Subtract {
        column: usize,
        value: String,
    },
    Multiply {
        column: usize,
        value: String,
    },
    Divide {
        column: usize,
        value: String,
    },
    /// Bitwise AND
    And {
        column: usize,
        value: String,
    },
    KeepOnlyMatchingLines {
        column: usize,
        #[serde(default)]
        regexp: Option<String>,
        #[serde(default)]
        value_list: Option<String>,
    },
    ExcludeMatchingLines {
        column: usize,
        #[serde(default)]
        regexp: Option<String>,
        #[serde(default)]
        value_list: Option<String>,
    },
    KeepColumns {
        column_numbers: String,
    },
    DuplicateColumn {
        column: usize,
    },
    Extract {
        column: usize,
        sub_column: usize,
        sub_separators: String,
    },
    ExtractPropertyFromWbemPath {
        column: usize,
        property: String,
    },
    Translate {
        column: usize,
        translation_table: String,
    },
    ArrayTranslate {
        column: usize,
        translation_table: String,
        #[serde(default)]
        array_separator: Option<String>,
        #[serde(default)]
        result_separator: Option<String>,
    },
    PerBitTranslation {
        column: usize,
        bit_list: String,
        translation_table: String,
    },
    #[serde(alias = "append")]
    RightConcat {
        column: usize,
        value: String,
    },
    #[serde(alias = "prepend")]
    LeftConcat {
        column: usize,
        value: String,
    },
    Replace {
        column: usize,
        existing_value: String,
        new_value: String,
    },
    Substring {
        column: usize,
        start: String,
        length: String,
    },
    Convert {
        column: usize,
        conversion: ConversionType,
    },
    Json2Csv {
        #[serde(default)]
        entry_key: String,
        properties: String,
        #[serde(default = "default_json_separator")]
        separator: String,
    },
    Xml2Csv {
        record_tag: String,
        properties: String,
    },
}

fn default_json_separator() -> String {
    ";".to_string()
}

impl Compute {
    /// Short lower-case name used in diagnostics
    pub fn name(&self) -> &'static str {
        match self {
            Compute::Add { .. } => "add",
            Compute::Subtract { .. } => "subtract",
            Compute::Multiply { .. } => "multiply",
            Compute::Divide { .. } => "divide",
            Compute::And { .. } => "and",
            Compute::KeepOnlyMatchingLines { .. } => "keepOnlyMatchingLines",
            Compute::ExcludeMatchingLines { .. } => "excludeMatchingLines",
            Compute::KeepColumns { .. } => "keepColumns",
            Compute::DuplicateColumn { .. } => "duplicateColumn",
            Compute::Extract { .. } => "extract",
            Compute::ExtractPropertyFromWbemPath { .. } => "extractPropertyFromWbemPath",
            Compute::Translate { .. } => "translate",
            Compute::ArrayTranslate { .. } => "arrayTranslate",
            Compute::PerBitTranslation { .. } => "perBitTranslation",
            Compute::RightConcat { .. } => "rightConcat",
            Compute::LeftConcat { .. } => "leftConcat",
            Compute::Replace { .. } => "replace",
            Compute::Substring { .. } => "substring",
            Compute::Convert { .. } => "convert",
            Compute::Json2Csv { .. } => "json2Csv",
            Compute::Xml2Csv { .. } => "xml2Csv",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConversionType {
    /// Hexadecimal to decimal
    #[serde(rename = "hex2dec")]
    Hex2Dec,

    /// `ok|degraded|failed` list reduced to its worst state
    #[serde(rename = "array2simple_status")]
    Array2SimpleStatus,
}

/// What happens to a row whose cell cannot be interpreted
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataErrorPolicy {
    /// Keep the row, leave the cell as it was
    #[default]
    LeaveUnchanged,

    /// Remove the row from the table
    DropRow,
}

/// Read-only inputs shared by every compute of a source
#[derive(Debug, Clone, Copy)]
pub struct ComputeContext<'a> {
    pub translation_tables: &'a BTreeMap<String, TranslationTable>,
    pub policy: DataErrorPolicy,
}

impl<'a> ComputeContext<'a> {
    pub fn new(translation_tables: &'a BTreeMap<String, TranslationTable>) -> Self {
        Self {
            translation_tables,
            policy: DataErrorPolicy::default(),
        }
    }

    #[must_use]
    pub fn with_policy(mut self, policy: DataErrorPolicy) -> Self {
        self.policy = policy;
        self
    }
}

/// Result of one compute or of a whole pipeline
#[derive(Debug, Clone, PartialEq)]
pub struct ComputeOutcome {
    pub table: SourceTable,
    pub diagnostics: Vec<Diagnostic>,
}

/// Apply a single compute
///
/// The table is consumed and the transformed table returned; the same input always
/// yields the same output. Rows are padded afterwards if the step left the table
/// ragged.
pub fn apply_compute(
    table: SourceTable,
    compute: &Compute,
    context: &ComputeContext<'_>,
) -> ComputeOutcome {
    let mut table = table;
    let mut step = Step::new(compute.name(), context);

    match compute {
        Compute::Add { column, value } => {
            arithmetic::arithmetic(&mut table, *column, value, ArithmeticOp::Add, &mut step)
        }
        Compute::Subtract { column, value } => arithmetic::arithmetic(
            &mut table,
            *column,
            value,
            ArithmeticOp::Subtract,
            &mut step,
        ),
        Compute::Multiply { column, value } => arithmetic::arithmetic(
            &mut table,
            *column,
            value,
            ArithmeticOp::Multiply,
            &mut step,
        ),
        Compute::Divide { column, value } => {
            arithmetic::arithmetic(&mut table, *column, value, ArithmeticOp::Divide, &mut step)
        }
        Compute::And { column, value } => {
            arithmetic::bitwise_and(&mut table, *column, value, &mut step)
        }
        Compute::Convert { column, conversion } => {
            arithmetic::convert(&mut table, *column, *conversion, &mut step)
        }
        Compute::KeepOnlyMatchingLines {
            column,
            regexp,
            value_list,
        } => filter::matching_lines(
            &mut table,
            *column,
            regexp.as_deref(),
            value_list.as_deref(),
            true,
            &mut step,
        ),
        Compute::ExcludeMatchingLines {
            column,
            regexp,
            value_list,
        } => filter::matching_lines(
            &mut table,
            *column,
            regexp.as_deref(),
            value_list.as_deref(),
            false,
            &mut step,
        ),
        Compute::KeepColumns { column_numbers } => {
            filter::keep_columns(&mut table, column_numbers, &mut step)
        }
        Compute::Translate {
            column,
            translation_table,
        } => translate::translate(&mut table, *column, translation_table, &mut step),
        Compute::ArrayTranslate {
            column,
            translation_table,
            array_separator,
            result_separator,
        } => translate::array_translate(
            &mut table,
            *column,
            translation_table,
            array_separator.as_deref().unwrap_or(","),
            result_separator.as_deref().unwrap_or("|"),
            &mut step,
        ),
        Compute::PerBitTranslation {
            column,
            bit_list,
            translation_table,
        } => translate::per_bit_translation(
            &mut table,
            *column,
            bit_list,
            translation_table,
            &mut step,
        ),
        Compute::DuplicateColumn { column } => {
            text::duplicate_column(&mut table, *column, &mut step)
        }
        Compute::Extract {
            column,
            sub_column,
            sub_separators,
        } => text::extract(&mut table, *column, *sub_column, sub_separators, &mut step),
        Compute::ExtractPropertyFromWbemPath { column, property } => {
            text::extract_wbem_property(&mut table, *column, property, &mut step)
        }
        Compute::RightConcat { column, value } => {
            text::concat(&mut table, *column, value, text::Side::Right, &mut step)
        }
        Compute::LeftConcat { column, value } => {
            text::concat(&mut table, *column, value, text::Side::Left, &mut step)
        }
        Compute::Replace {
            column,
            existing_value,
            new_value,
        } => text::replace(&mut table, *column, existing_value, new_value, &mut step),
        Compute::Substring {
            column,
            start,
            length,
        } => text::substring(&mut table, *column, start, length, &mut step),
        Compute::Json2Csv {
            entry_key,
            properties,
            separator,
        } => markup::json_to_csv(&mut table, entry_key, properties, separator, &mut step),
        Compute::Xml2Csv {
            record_tag,
            properties,
        } => markup::xml_to_csv(&mut table, record_tag, properties, &mut step),
    }

    if !table.is_rectangular() {
        table.pad_rows();
    }

    ComputeOutcome {
        table,
        diagnostics: step.diagnostics,
    }
}

/// Apply computes in declaration order
///
/// Diagnostics are labelled `compute(n)` with `n` the 1-based position in the list.
pub fn apply_computes(
    table: SourceTable,
    computes: &[Compute],
    context: &ComputeContext<'_>,
) -> ComputeOutcome {
    let mut outcome = ComputeOutcome {
        table,
        diagnostics: Vec::new(),
    };

    for (index, compute) in computes.iter().enumerate() {
        let step = apply_compute(outcome.table, compute, context);
        let label = format!("compute({})", index + 1);
        outcome.table = step.table;
        outcome
            .diagnostics
            .extend(step.diagnostics.into_iter().map(|d| d.within(&label)));
    }

    outcome
}

/// Why a row was left alone
pub(crate) enum RowError {
    /// Not applicable to this row (short row, no match); always keeps the row
    Skip(String),

    /// Cell content cannot be interpreted; subject to the data-error policy
    Malformed(String),
}

/// Per-compute state: the policy, lookups and collected diagnostics
pub(crate) struct Step<'a> {
    name: &'static str,
    policy: DataErrorPolicy,
    translation_tables: &'a BTreeMap<String, TranslationTable>,
    diagnostics: Vec<Diagnostic>,
}

impl<'a> Step<'a> {
    fn new(name: &'static str, context: &ComputeContext<'a>) -> Self {
        Self {
            name,
            policy: context.policy,
            translation_tables: context.translation_tables,
            diagnostics: Vec::new(),
        }
    }

    /// Record a data warning for the whole step
    pub(crate) fn warn(&mut self, message: impl Into<String>) {
        let message = message.into();
        warn!(compute = self.name, "{message}");
        self.diagnostics.push(Diagnostic::data(self.name, message));
    }

    fn warn_row(&mut self, row: usize, message: String) {
        warn!(compute = self.name, row, "{message}");
        self.diagnostics
            .push(Diagnostic::data(format!("{}.row({row})", self.name), message));
    }

    /// Look up a translation table of the connector
    pub(crate) fn translation_table(&mut self, name: &str) -> Option<TranslationTable> {
        let table = self.translation_tables.get(name).cloned();
        if table.is_none() {
            self.warn(format!("unknown translation table '{name}'"));
        }
        table
    }

    /// Validate a 1-based column declaration
    pub(crate) fn valid_column(&mut self, column: usize) -> bool {
        if column == 0 {
            self.warn("column index must be 1 or greater");
            return false;
        }
        true
    }

    /// Apply `f` to every row, routing row errors through the policy
    pub(crate) fn for_each_row(
        &mut self,
        table: &mut SourceTable,
        mut f: impl FnMut(&mut Vec<String>) -> Result<(), RowError>,
    ) {
        let mut position = 0;
        let mut rejected = Vec::new();
        let policy = self.policy;

        table.rows.retain_mut(|row| {
            position += 1;
            match f(row) {
                Ok(()) => true,
                Err(RowError::Skip(message)) => {
                    rejected.push((position, message));
                    true
                }
                Err(RowError::Malformed(message)) => {
                    rejected.push((position, message));
                    policy == DataErrorPolicy::LeaveUnchanged
                }
            }
        });

        for (row, message) in rejected {
            self.warn_row(row, message);
        }
    }
}

/// Operand of a compute: a `$n` column reference or a literal
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Operand<'v> {
    Column(usize),
    Literal(&'v str),
}

impl<'v> Operand<'v> {
    pub(crate) fn parse(value: &'v str) -> Self {
        match crate::connector::column_reference(value) {
            Some(column) => Operand::Column(column),
            None => Operand::Literal(value),
        }
    }

    /// Value for one row; `None` when the referenced column does not exist
    pub(crate) fn resolve<'r>(&self, row: &'r [String]) -> Option<&'r str>
    where
        'v: 'r,
    {
        match self {
            Operand::Column(column) => row.get(column - 1).map(String::as_str),
            Operand::Literal(value) => Some(value),
        }
    }
}

/// Cell of a 1-based column, or a `Skip` error naming the row width
pub(crate) fn cell_mut(row: &mut [String], column: usize) -> Result<&mut String, RowError> {
    let width = row.len();
    column.checked_sub(1).and_then(|i| row.get_mut(i)).ok_or_else(|| {
        RowError::Skip(format!("column {column} out of range (row has {width})"))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    pub(crate) fn table(rows: &[&[&str]]) -> SourceTable {
        SourceTable::new(
            rows.iter()
                .map(|r| r.iter().map(|c| c.to_string()).collect())
                .collect(),
        )
    }

    fn no_tables() -> BTreeMap<String, TranslationTable> {
        BTreeMap::new()
    }

    #[test]
    fn test_compute_order_is_observable() {
        let tables = no_tables();
        let ctx = ComputeContext::new(&tables);
        let divide = Compute::Divide {
            column: 2,
            value: "2".into(),
        };
        let multiply = Compute::Multiply {
            column: 2,
            value: "3".into(),
        };

        let forward = apply_computes(
            table(&[&["x", "8"]]),
            &[divide.clone(), multiply.clone()],
            &ctx,
        );
        assert_eq!(forward.table, table(&[&["x", "12"]]));

        let add = Compute::Add {
            column: 2,
            value: "4".into(),
        };
        let add_then_multiply = apply_computes(
            table(&[&["x", "8"]]),
            &[add.clone(), multiply.clone()],
            &ctx,
        );
        assert_eq!(add_then_multiply.table, table(&[&["x", "36"]]));

        let multiply_then_add = apply_computes(table(&[&["x", "8"]]), &[multiply, add], &ctx);
        assert_eq!(multiply_then_add.table, table(&[&["x", "28"]]));
    }

    #[test]
    fn test_pipeline_labels_diagnostics_by_position() {
        let tables = no_tables();
        let ctx = ComputeContext::new(&tables);
        let outcome = apply_computes(
            table(&[&["x", "oops"]]),
            &[
                Compute::DuplicateColumn { column: 1 },
                Compute::Divide {
                    column: 3,
                    value: "2".into(),
                },
            ],
            &ctx,
        );
        assert_eq!(outcome.diagnostics.len(), 1);
        assert_eq!(outcome.diagnostics[0].context, "compute(2).divide.row(1)");
        assert_eq!(outcome.table, table(&[&["x", "x", "oops"]]));
    }

    #[test]
    fn test_drop_row_policy() {
        let tables = no_tables();
        let ctx = ComputeContext::new(&tables).with_policy(DataErrorPolicy::DropRow);
        let outcome = apply_compute(
            table(&[&["a", "10"], &["b", "n/a"], &["c", "4"]]),
            &Compute::Multiply {
                column: 2,
                value: "2".into(),
            },
            &ctx,
        );
        assert_eq!(outcome.table, table(&[&["a", "20"], &["c", "8"]]));
        assert_eq!(outcome.diagnostics.len(), 1);
    }

    #[test]
    fn test_short_rows_are_kept_under_drop_policy() {
        let tables = no_tables();
        let ctx = ComputeContext::new(&tables).with_policy(DataErrorPolicy::DropRow);
        let outcome = apply_compute(
            table(&[&["a", "10"], &["b"]]),
            &Compute::Add {
                column: 2,
                value: "1".into(),
            },
            &ctx,
        );
        assert_eq!(outcome.table, table(&[&["a", "11"], &["b", ""]]));
    }

    #[test]
    fn test_compute_json_model() {
        let computes: Vec<Compute> = serde_json::from_value(serde_json::json!([
            {"type": "keepOnlyMatchingLines", "column": 2, "regexp": "^1$"},
            {"type": "perBitTranslation", "column": 3, "bitList": "0,1", "translationTable": "bits"},
            {"type": "append", "column": 1, "value": "$2"},
            {"type": "convert", "column": 1, "conversion": "hex2dec"}
        ]))
        .unwrap();
        assert_eq!(computes.len(), 4);
        assert_eq!(computes[2].name(), "rightConcat");
    }
}

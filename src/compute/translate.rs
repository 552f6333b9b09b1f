//! Table-driven computes: Translate, ArrayTranslate, PerBitTranslation
//!
//! Translation tables belong to the connector and are shared read-only; lookups
//! are case-insensitive. `Translate` and `ArrayTranslate` fall back on the
//! `default` entry, `PerBitTranslation` does not.

use crate::table::SourceTable;

use super::arithmetic::parse_integer;
use super::{RowError, Step, cell_mut};

/// Joins the per-bit translations of one cell
const BIT_SEPARATOR: &str = " - ";

pub(super) fn translate(
    table: &mut SourceTable,
    column: usize,
    translation_table: &str,
    step: &mut Step<'_>,
) {
    if !step.valid_column(column) {
        return;
    }
    let Some(lookup) = step.translation_table(translation_table) else {
        return;
    };

    step.for_each_row(table, |row| {
        let cell = cell_mut(row, column)?;
        let translated = lookup
            .translate(cell)
            .ok_or_else(|| RowError::Skip(format!("no translation for '{cell}'")))?;
        *cell = translated.to_string();
        Ok(())
    });
}

pub(super) fn array_translate(
    table: &mut SourceTable,
    column: usize,
    translation_table: &str,
    array_separator: &str,
    result_separator: &str,
    step: &mut Step<'_>,
) {
    if !step.valid_column(column) {
        return;
    }
    let Some(lookup) = step.translation_table(translation_table) else {
        return;
    };

    step.for_each_row(table, |row| {
        let cell = cell_mut(row, column)?;
        let translated: Vec<&str> = cell
            .split(array_separator)
            .map(str::trim)
            .filter(|element| !element.is_empty())
            .filter_map(|element| lookup.translate(element))
            .filter(|value| !value.is_empty())
            .collect();
        *cell = translated.join(result_separator);
        Ok(())
    });
}

pub(super) fn per_bit_translation(
    table: &mut SourceTable,
    column: usize,
    bit_list: &str,
    translation_table: &str,
    step: &mut Step<'_>,
) {
    if !step.valid_column(column) {
        return;
    }
    let Some(lookup) = step.translation_table(translation_table) else {
        return;
    };

    let mut bits = Vec::new();
    for bit in bit_list.split(',').map(str::trim).filter(|b| !b.is_empty()) {
        match bit.parse::<u32>() {
            Ok(bit) if bit < u64::BITS => bits.push(bit),
            _ => step.warn(format!("ignoring invalid bit position '{bit}'")),
        }
    }
    if bits.is_empty() {
        step.warn(format!("no usable bit in '{bit_list}'"));
        return;
    }

    step.for_each_row(table, |row| {
        let cell = cell_mut(row, column)?;
        let value = parse_integer(cell)
            .ok_or_else(|| RowError::Malformed(format!("'{cell}' is not an integer")))?;

        // an unknown bit translates to an empty string, which the join drops
        let translated: Vec<&str> = bits
            .iter()
            .map(|bit| {
                let key = format!("{bit},{}", (value >> bit) & 1);
                lookup.get(&key).unwrap_or_default()
            })
            .filter(|s| !s.is_empty())
            .collect();
        *cell = translated.join(BIT_SEPARATOR);
        Ok(())
    });
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use pretty_assertions::assert_eq;

    use super::super::tests::table;
    use super::super::{Compute, ComputeContext, ComputeOutcome, apply_compute};
    use crate::connector::TranslationTable;

    fn run(input: crate::table::SourceTable, compute: Compute) -> ComputeOutcome {
        let mut tables = BTreeMap::new();
        tables.insert(
            "status".to_string(),
            TranslationTable::from([("1", "ok"), ("2", "degraded"), ("default", "failed")]),
        );
        tables.insert(
            "bits".to_string(),
            TranslationTable::from([
                ("0,1", "Fan Failure"),
                ("1,1", "Power Failure"),
                ("2,0", "Cover Closed"),
            ]),
        );
        tables.insert(
            "nodefault".to_string(),
            TranslationTable::from([("a", "Alpha")]),
        );
        apply_compute(input, &compute, &ComputeContext::new(&tables))
    }

    #[test]
    fn test_translate_with_default() {
        let out = run(
            table(&[&["1"], &["2"], &["9"]]),
            Compute::Translate {
                column: 1,
                translation_table: "status".into(),
            },
        );
        assert_eq!(out.table, table(&[&["ok"], &["degraded"], &["failed"]]));
    }

    #[test]
    fn test_translate_unresolvable_key_leaves_cell() {
        let out = run(
            table(&[&["A"], &["b"]]),
            Compute::Translate {
                column: 1,
                translation_table: "nodefault".into(),
            },
        );
        assert_eq!(out.table, table(&[&["Alpha"], &["b"]]));
        assert_eq!(out.diagnostics.len(), 1);
    }

    #[test]
    fn test_unknown_translation_table_is_a_no_op() {
        let input = table(&[&["1"]]);
        let out = run(
            input.clone(),
            Compute::Translate {
                column: 1,
                translation_table: "missing".into(),
            },
        );
        assert_eq!(out.table, input);
        assert_eq!(out.diagnostics.len(), 1);
    }

    #[test]
    fn test_array_translate() {
        let out = run(
            table(&[&["1,2,,1"]]),
            Compute::ArrayTranslate {
                column: 1,
                translation_table: "status".into(),
                array_separator: None,
                result_separator: None,
            },
        );
        assert_eq!(out.table, table(&[&["ok|degraded|ok"]]));
    }

    #[test]
    fn test_per_bit_translation() {
        // 3 = bits 0 and 1 set, bit 2 clear
        let out = run(
            table(&[&["x", "3"], &["y", "0"], &["z", "n/a"]]),
            Compute::PerBitTranslation {
                column: 2,
                bit_list: "0,1,2".into(),
                translation_table: "bits".into(),
            },
        );
        assert_eq!(
            out.table,
            table(&[
                &["x", "Fan Failure - Power Failure - Cover Closed"],
                &["y", "Cover Closed"],
                &["z", "n/a"],
            ])
        );
        assert_eq!(out.diagnostics.len(), 1);
    }
}

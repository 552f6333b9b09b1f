//! Text computes: DuplicateColumn, Extract, ExtractPropertyFromWbemPath,
//! RightConcat/LeftConcat, Replace, Substring

use regex::RegexBuilder;

use crate::table::{SourceTable, TABLE_SEP};

use super::{Operand, RowError, Step, cell_mut};

pub(super) fn duplicate_column(table: &mut SourceTable, column: usize, step: &mut Step<'_>) {
    if !step.valid_column(column) {
        return;
    }

    step.for_each_row(table, |row| {
        let copy = cell_mut(row, column)?.clone();
        row.insert(column, copy);
        Ok(())
    });
}

pub(super) fn extract(
    table: &mut SourceTable,
    column: usize,
    sub_column: usize,
    sub_separators: &str,
    step: &mut Step<'_>,
) {
    if !step.valid_column(column) {
        return;
    }
    if sub_column == 0 || sub_separators.is_empty() {
        step.warn("extract needs a sub-column of 1 or more and at least one separator");
        return;
    }

    step.for_each_row(table, |row| {
        let cell = cell_mut(row, column)?;
        let piece = cell
            .split(|c: char| sub_separators.contains(c))
            .filter(|piece| !piece.is_empty())
            .nth(sub_column - 1)
            .ok_or_else(|| RowError::Skip(format!("'{cell}' has no piece {sub_column}")))?
            .to_string();
        *cell = piece;
        Ok(())
    });
}

/// `CIM_Fan.CreationClassName="CIM_Fan",DeviceID="FAN1"` with `DeviceID` gives `FAN1`
pub(super) fn extract_wbem_property(
    table: &mut SourceTable,
    column: usize,
    property: &str,
    step: &mut Step<'_>,
) {
    if !step.valid_column(column) {
        return;
    }

    let pattern = format!(r#"(?:^|[.,])\s*{}\s*=\s*"?([^",]*)"?"#, regex::escape(property));
    let re = match RegexBuilder::new(&pattern).case_insensitive(true).build() {
        Ok(re) => re,
        Err(e) => {
            step.warn(format!("invalid property name '{property}': {e}"));
            return;
        }
    };

    step.for_each_row(table, |row| {
        let cell = cell_mut(row, column)?;
        let value = re
            .captures(cell)
            .and_then(|caps| caps.get(1))
            .map(|m| m.as_str().to_string())
            .ok_or_else(|| RowError::Skip(format!("no property '{property}' in '{cell}'")))?;
        *cell = value;
        Ok(())
    });
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum Side {
    Left,
    Right,
}

/// Append or prepend a value to a column
///
/// Targeting the column right after the last one adds a new column holding the
/// value. A result containing the table separator is split into several cells.
pub(super) fn concat(
    table: &mut SourceTable,
    column: usize,
    value: &str,
    side: Side,
    step: &mut Step<'_>,
) {
    if !step.valid_column(column) {
        return;
    }
    let operand = Operand::parse(value);

    step.for_each_row(table, |row| {
        let addition = operand
            .resolve(row)
            .ok_or_else(|| RowError::Skip(format!("operand column of '{value}' out of range")))?
            .to_string();

        if column == row.len() + 1 {
            row.push(addition);
        } else {
            let cell = cell_mut(row, column)?;
            match side {
                Side::Right => cell.push_str(&addition),
                Side::Left => cell.insert_str(0, &addition),
            }
        }

        if row[column - 1].contains(TABLE_SEP) {
            let parts: Vec<String> = row[column - 1]
                .split(TABLE_SEP)
                .map(str::to_string)
                .collect();
            row.splice(column - 1..column, parts);
        }
        Ok(())
    });
}

pub(super) fn replace(
    table: &mut SourceTable,
    column: usize,
    existing_value: &str,
    new_value: &str,
    step: &mut Step<'_>,
) {
    if !step.valid_column(column) {
        return;
    }
    let existing = Operand::parse(existing_value);
    let replacement = Operand::parse(new_value);

    step.for_each_row(table, |row| {
        let from = existing
            .resolve(row)
            .ok_or_else(|| RowError::Skip(format!("column of '{existing_value}' out of range")))?
            .to_string();
        let to = replacement
            .resolve(row)
            .ok_or_else(|| RowError::Skip(format!("column of '{new_value}' out of range")))?
            .to_string();
        if from.is_empty() {
            return Ok(());
        }
        let cell = cell_mut(row, column)?;
        *cell = cell.replace(&from, &to);
        Ok(())
    });
}

/// 1-based character substring; start and length may be `$n` references
pub(super) fn substring(
    table: &mut SourceTable,
    column: usize,
    start: &str,
    length: &str,
    step: &mut Step<'_>,
) {
    if !step.valid_column(column) {
        return;
    }
    let start = Operand::parse(start);
    let length = Operand::parse(length);

    step.for_each_row(table, |row| {
        let begin = resolve_index(&start, row)?;
        let count = resolve_index(&length, row)?;
        let cell = cell_mut(row, column)?;

        let chars = cell.chars().count();
        if begin == 0 || begin - 1 + count > chars {
            return Err(RowError::Skip(format!(
                "substring({begin}, {count}) out of range for '{cell}'"
            )));
        }
        *cell = cell.chars().skip(begin - 1).take(count).collect();
        Ok(())
    });
}

fn resolve_index(operand: &Operand<'_>, row: &[String]) -> Result<usize, RowError> {
    let value = operand
        .resolve(row)
        .ok_or_else(|| RowError::Skip(format!("{operand:?} out of range")))?;
    value
        .trim()
        .parse::<usize>()
        .map_err(|_| RowError::Malformed(format!("'{value}' is not a position")))
}

//! Numeric computes: Add, Subtract, Multiply, Divide, And, Convert

use crate::table::SourceTable;

use super::{ConversionType, Operand, RowError, Step, cell_mut};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArithmeticOp {
    Add,
    Subtract,
    Multiply,
    Divide,
}

impl ArithmeticOp {
    /// `None` on division by zero or a non-finite result
    pub fn apply(self, left: f64, right: f64) -> Option<f64> {
        let result = match self {
            ArithmeticOp::Add => left + right,
            ArithmeticOp::Subtract => left - right,
            ArithmeticOp::Multiply => left * right,
            ArithmeticOp::Divide if right == 0.0 => return None,
            ArithmeticOp::Divide => left / right,
        };
        result.is_finite().then_some(result)
    }
}

/// Parse a decimal number cell
pub(crate) fn parse_number(value: &str) -> Option<f64> {
    value.trim().parse::<f64>().ok().filter(|v| v.is_finite())
}

/// Parse a non-negative integer cell; `"5.0"` is accepted as 5
pub(crate) fn parse_integer(value: &str) -> Option<u64> {
    let value = value.trim();
    value.parse::<u64>().ok().or_else(|| {
        parse_number(value)
            .filter(|v| *v >= 0.0 && v.fract() == 0.0 && *v <= u64::MAX as f64)
            .map(|v| v as u64)
    })
}

/// Shortest representation; integral values print without a fraction
pub(crate) fn format_number(value: f64) -> String {
    format!("{value}")
}

pub(super) fn arithmetic(
    table: &mut SourceTable,
    column: usize,
    value: &str,
    op: ArithmeticOp,
    step: &mut Step<'_>,
) {
    if !step.valid_column(column) {
        return;
    }

    let operand = Operand::parse(value);
    if let Operand::Literal(literal) = operand
        && parse_number(literal).is_none()
    {
        step.warn(format!("operand '{literal}' is neither a number nor a column reference"));
        return;
    }

    step.for_each_row(table, |row| {
        let right = operand
            .resolve(row)
            .ok_or_else(|| RowError::Skip(format!("operand column of '{value}' out of range")))?;
        let right = parse_number(right)
            .ok_or_else(|| RowError::Malformed(format!("operand '{right}' is not a number")))?;

        let cell = cell_mut(row, column)?;
        let left = parse_number(cell)
            .ok_or_else(|| RowError::Malformed(format!("'{cell}' is not a number")))?;

        let result = op.apply(left, right).ok_or_else(|| {
            RowError::Malformed(format!("cannot compute {op:?} of {left} and {right}"))
        })?;
        *cell = format_number(result);
        Ok(())
    });
}

pub(super) fn bitwise_and(table: &mut SourceTable, column: usize, value: &str, step: &mut Step<'_>) {
    if !step.valid_column(column) {
        return;
    }

    let operand = Operand::parse(value);
    if let Operand::Literal(literal) = operand
        && parse_integer(literal).is_none()
    {
        step.warn(format!("operand '{literal}' is not an integer"));
        return;
    }

    step.for_each_row(table, |row| {
        let mask = operand
            .resolve(row)
            .ok_or_else(|| RowError::Skip(format!("operand column of '{value}' out of range")))?;
        let mask = parse_integer(mask)
            .ok_or_else(|| RowError::Malformed(format!("operand '{mask}' is not an integer")))?;

        let cell = cell_mut(row, column)?;
        let bits = parse_integer(cell)
            .ok_or_else(|| RowError::Malformed(format!("'{cell}' is not an integer")))?;
        *cell = (bits & mask).to_string();
        Ok(())
    });
}

/// Severity order of simple statuses, worst last
const SIMPLE_STATUSES: [&str; 3] = ["ok", "degraded", "failed"];

pub(super) fn convert(
    table: &mut SourceTable,
    column: usize,
    conversion: ConversionType,
    step: &mut Step<'_>,
) {
    if !step.valid_column(column) {
        return;
    }

    step.for_each_row(table, |row| {
        let cell = cell_mut(row, column)?;
        match conversion {
            ConversionType::Hex2Dec => {
                let trimmed = cell.trim();
                let digits = trimmed
                    .strip_prefix("0x")
                    .or_else(|| trimmed.strip_prefix("0X"))
                    .unwrap_or(trimmed)
                    .replace([':', ' '], "");
                let value = u64::from_str_radix(&digits, 16).map_err(|_| {
                    RowError::Malformed(format!("'{cell}' is not a hexadecimal number"))
                })?;
                *cell = value.to_string();
            }
            ConversionType::Array2SimpleStatus => {
                let worst = cell
                    .split('|')
                    .filter_map(|state| {
                        let state = state.trim().to_lowercase();
                        SIMPLE_STATUSES.iter().position(|s| *s == state)
                    })
                    .max()
                    .ok_or_else(|| RowError::Skip(format!("no known status in '{cell}'")))?;
                *cell = SIMPLE_STATUSES[worst].to_string();
            }
        }
        Ok(())
    });
}

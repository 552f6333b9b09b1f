//! Functions of mapping expressions
//!
//! An attribute or metric expression may be a single call wrapping the whole
//! expression, e.g. `megaHertz2Hertz($3)` or `lookup("enclosure", "name", "id", $2)`.
//! Arguments are expressions themselves: `$n` references, templates or quoted
//! literals. An unknown function name leaves the expression as a plain template.
//!
//! | function                      | result                                        |
//! |-------------------------------|-----------------------------------------------|
//! | `megaBit2Bit(x)`              | `x * 1e6`                                     |
//! | `megaBit2Byte(x)`             | `x * 125000`                                  |
//! | `mebiByte2Byte(x)`            | `x * 1048576`                                 |
//! | `megaHertz2Hertz(x)`          | `x * 1e6`                                     |
//! | `milliVolt2Volt(x)`           | `x / 1000`                                    |
//! | `percent2Ratio(x)`            | `x / 100`                                     |
//! | `boolean(x)`                  | `1` for `1` or `true`, `0` otherwise          |
//! | `lookup(type, attr, key, v)`  | `attr` of the first `type` monitor whose `key` attribute is `v` |
//! | `rate(x)`                     | per-second change of `x` since the previous collect |
//! | `fakeCounter(x)`              | running sum of `x * seconds` since the previous collect |
//!
//! `rate` and `fakeCounter` only make sense for metrics: they keep the raw
//! value of the previous collect in a hidden `__<metric>.rate_from` /
//! `__<metric>.fake_counter_from` metric of the monitor, and yield nothing on
//! the first collect.

use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use tracing::{debug, trace};

use crate::connector::evaluate_expression;
use crate::telemetry::{Metric, TelemetryStore};

static FUNCTION_CALL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*([A-Za-z][A-Za-z0-9]*)\((.*)\)\s*$").expect("function call pattern is valid")
});

/// Prefix of the metrics the engine keeps for itself
const HIDDEN_METRIC_PREFIX: &str = "__";

/// Function name and raw argument list of an expression that is a single call
fn function_call(expression: &str) -> Option<(String, Vec<String>)> {
    let caps = FUNCTION_CALL.captures(expression)?;
    Some((caps[1].to_ascii_lowercase(), split_arguments(&caps[2])))
}

/// Split on commas outside of quotes and parentheses
fn split_arguments(text: &str) -> Vec<String> {
    let mut arguments = Vec::new();
    let mut current = String::new();
    let (mut quoted, mut depth) = (false, 0usize);
    for c in text.chars() {
        match c {
            '"' => quoted = !quoted,
            '(' if !quoted => depth += 1,
            ')' if !quoted => depth = depth.saturating_sub(1),
            ',' if !quoted && depth == 0 => {
                arguments.push(std::mem::take(&mut current).trim().to_string());
                continue;
            }
            _ => {}
        }
        current.push(c);
    }
    if !current.trim().is_empty() || !arguments.is_empty() {
        arguments.push(current.trim().to_string());
    }
    arguments
}

/// Value of one function argument on a row; quotes make a literal
fn argument_value(argument: &str, row: &[String]) -> Option<String> {
    match argument
        .strip_prefix('"')
        .and_then(|a| a.strip_suffix('"'))
    {
        Some(literal) => Some(literal.to_string()),
        None => evaluate_expression(argument, row),
    }
}

fn number_argument(argument: &str, row: &[String]) -> Option<f64> {
    argument_value(argument, row)?
        .trim()
        .parse::<f64>()
        .ok()
        .filter(|n| n.is_finite())
}

/// Unit conversion named by `function`, applied to `value`
fn convert(function: &str, value: f64) -> Option<f64> {
    let converted = match function {
        "megabit2bit" | "megahertz2hertz" => value * 1_000_000.0,
        "megabit2byte" => value * 125_000.0,
        "mebibyte2byte" => value * 1_048_576.0,
        "millivolt2volt" => value / 1000.0,
        "percent2ratio" => value / 100.0,
        _ => return None,
    };
    Some(converted)
}

fn is_conversion(function: &str) -> bool {
    convert(function, 0.0).is_some()
}

/// Evaluate an attribute or metric expression on a row
///
/// `None` when the value cannot be computed: a missing cell, a non-numeric
/// operand of a conversion, an unmatched lookup. Counter functions are not
/// handled here, see [`counter_function`].
pub(super) fn evaluate(store: &TelemetryStore, expression: &str, row: &[String]) -> Option<String> {
    let Some((function, arguments)) = function_call(expression) else {
        return evaluate_expression(expression, row);
    };

    if is_conversion(&function) {
        let value = number_argument(arguments.first()?, row)?;
        return convert(&function, value).map(|v| v.to_string());
    }

    match function.as_str() {
        "boolean" => {
            let value = argument_value(arguments.first()?, row).unwrap_or_default();
            let value = value.trim();
            Some(if value == "1" || value.eq_ignore_ascii_case("true") { "1" } else { "0" }.to_string())
        }
        "lookup" => lookup(store, &arguments, row),
        _ => evaluate_expression(expression, row),
    }
}

fn lookup(store: &TelemetryStore, arguments: &[String], row: &[String]) -> Option<String> {
    let [monitor_type, attribute, key, value] = arguments else {
        debug!("lookup takes 4 arguments, got {}", arguments.len());
        return None;
    };
    let values: Vec<String> = [monitor_type, attribute, key, value]
        .into_iter()
        .map(|a| argument_value(a, row).filter(|v| !v.is_empty()))
        .collect::<Option<_>>()?;
    let [monitor_type, attribute, key, value] = values.as_slice() else {
        return None;
    };

    let found = store
        .monitors_of_type(monitor_type)
        .find(|m| m.attribute(key) == Some(value.as_str()))
        .and_then(|m| m.attribute(attribute))
        .map(str::to_string);
    if found.is_none() {
        trace!("lookup: no {monitor_type} with {key}={value}");
    }
    found
}

/// Metric functions that read the monitor's previous collect
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum CounterFunction {
    /// Per-second change of a counter
    Rate,

    /// Counter accumulated from a rate
    FakeCounter,
}

impl CounterFunction {
    fn hidden_metric_name(self, metric_name: &str) -> String {
        match self {
            Self::Rate => format!("{HIDDEN_METRIC_PREFIX}{metric_name}.rate_from"),
            Self::FakeCounter => format!("{HIDDEN_METRIC_PREFIX}{metric_name}.fake_counter_from"),
        }
    }
}

/// The counter function of an expression and its argument
pub(super) fn counter_function(expression: &str) -> Option<(CounterFunction, String)> {
    let (function, arguments) = function_call(expression)?;
    let function = match function.as_str() {
        "rate" => CounterFunction::Rate,
        "fakecounter" => CounterFunction::FakeCounter,
        _ => return None,
    };
    Some((function, arguments.into_iter().next()?))
}

/// Where a counter function reads and writes
pub(super) struct CounterTarget<'a> {
    pub monitor_type: &'a str,
    pub monitor_id: &'a str,
    pub metric_name: &'a str,
}

/// Apply a counter function to this collect's raw value
///
/// The raw value is recorded in the hidden metric for the next collect. A
/// first collect, a collect time that did not move forward, or (for `rate`) a
/// counter that went backwards yields `None`.
pub(super) fn apply_counter(
    store: &mut TelemetryStore,
    function: CounterFunction,
    target: &CounterTarget<'_>,
    raw: f64,
    collect_time: DateTime<Utc>,
) -> Option<f64> {
    let hidden = function.hidden_metric_name(target.metric_name);
    let monitor = store.find_monitor(target.monitor_type, target.monitor_id)?;
    let previous = monitor
        .metric(&hidden)
        .and_then(|m| Some((m.as_number()?, m.collect_time())));
    let previous_counter = monitor.number_metric(target.metric_name);

    store.set_metric(
        target.monitor_type,
        target.monitor_id,
        &hidden,
        Metric::number(raw, collect_time),
    );

    let (previous_raw, previous_time) = previous?;
    let elapsed = (collect_time - previous_time).num_milliseconds() as f64 / 1000.0;
    if elapsed <= 0.0 {
        return None;
    }

    match function {
        CounterFunction::Rate => {
            let delta = raw - previous_raw;
            if delta < 0.0 {
                debug!("{}: {} went backwards, no rate this collect", target.monitor_id, target.metric_name);
                return None;
            }
            Some(delta / elapsed)
        }
        CounterFunction::FakeCounter => Some(raw * elapsed + previous_counter.unwrap_or(0.0)),
    }
}

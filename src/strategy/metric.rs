//! Mapped values to typed metrics

use chrono::{DateTime, Utc};
use tracing::warn;

use crate::connector::{Connector, Mapping, MetricKind, base_metric_name};
use crate::error::Diagnostic;
use crate::telemetry::{Metric, TelemetryStore, metric_attributes};

use super::mapping::{self, CounterTarget, apply_counter, counter_function};

/// States of `hw.status` when the connector does not declare the metric
const DEFAULT_STATUS_STATES: [&str; 3] = ["ok", "degraded", "failed"];

/// Build the metric for a mapped value
///
/// The connector's metric definition decides the kind. A state outside the
/// declared set, or a non-numeric value for a number metric, is an error message
/// for the caller to log and skip.
pub(super) fn build_metric(
    connector: &Connector,
    name: &str,
    value: &str,
    collect_time: DateTime<Utc>,
) -> Result<Metric, String> {
    let value = value.trim();
    let definition = connector.metric_definition(name);

    let states: Option<Vec<String>> = match definition.map(|d| &d.kind) {
        Some(MetricKind::StateSet { states }) => Some(states.clone()),
        Some(MetricKind::Number) => None,
        None if base_metric_name(name) == "hw.status" => {
            Some(DEFAULT_STATUS_STATES.iter().map(|s| s.to_string()).collect())
        }
        None => None,
    };

    let metric = match states {
        Some(states) => {
            let state = states
                .iter()
                .find(|s| s.eq_ignore_ascii_case(value))
                .cloned()
                .ok_or_else(|| format!("'{value}' is not one of {states:?} for {name}"))?;
            Metric::state_set(state, states, collect_time)
        }
        None => {
            let number = value
                .parse::<f64>()
                .ok()
                .filter(|n| n.is_finite())
                .ok_or_else(|| format!("'{value}' is not a number for {name}"))?;
            Metric::number(number, collect_time).with_unit(definition.and_then(|d| d.unit.clone()))
        }
    };

    Ok(metric.with_attributes(metric_attributes(name)))
}

/// Evaluate the mapping's metric expressions on a row and store the results
///
/// Values that cannot be turned into their metric are skipped with a data
/// diagnostic; the other metrics of the row are still written. `rate()` and
/// `fakeCounter()` expressions read and update the monitor's previous collect.
pub(super) fn apply_metrics(
    store: &mut TelemetryStore,
    connector: &Connector,
    monitor_type: &str,
    monitor_id: &str,
    mapping: &Mapping,
    row: &[String],
    collect_time: DateTime<Utc>,
) -> Vec<Diagnostic> {
    let mut diagnostics = Vec::new();
    for (name, expression) in &mapping.metrics {
        let value = match counter_function(expression) {
            Some((function, argument)) => {
                let raw = mapping::evaluate(store, &argument, row)
                    .and_then(|v| v.trim().parse::<f64>().ok())
                    .filter(|v| v.is_finite());
                let Some(raw) = raw else {
                    continue;
                };
                let target = CounterTarget {
                    monitor_type,
                    monitor_id,
                    metric_name: name,
                };
                apply_counter(store, function, &target, raw, collect_time).map(|v| v.to_string())
            }
            None => mapping::evaluate(store, expression, row),
        };
        let Some(value) = value else {
            continue;
        };
        if value.trim().is_empty() {
            continue;
        }
        match build_metric(connector, name, &value, collect_time) {
            Ok(metric) => {
                store.set_metric(monitor_type, monitor_id, name, metric);
            }
            Err(message) => {
                warn!("{monitor_id}: {message}");
                diagnostics.push(Diagnostic::data(format!("monitor({monitor_id})"), message));
            }
        }
    }
    diagnostics
}

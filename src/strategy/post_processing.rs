//! Passes over the monitor graph that run between phases
//!
//! A post-processor only reads and writes the store; it never executes a
//! source. The cycle runs [`ParentLinker`] then [`ChildStatusAggregator`]
//! after discovery, and [`HostThermalCalculator`] then
//! [`ChildStatusAggregator`] after collect.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use tracing::{trace, warn};

use crate::connector::base_metric_name;
use crate::error::Diagnostic;
use crate::telemetry::{
    CONNECTOR_MONITOR_TYPE, HOST_MONITOR_TYPE, Metric, Monitor, PARENT_ID_ATTRIBUTE,
    PARENT_TYPE_ATTRIBUTE, TelemetryStore, metric_attributes,
};

/// Worst health of the present children of a monitor
pub const CHILDREN_STATUS_METRIC: &str = "hw.status.children";

pub const AMBIENT_TEMPERATURE_METRIC: &str = "hw.host.ambient_temperature";

pub const HEATING_MARGIN_METRIC: &str = "hw.host.heating_margin";

const HEALTH_STATES: [&str; 3] = ["ok", "degraded", "failed"];

/// Temperatures outside this open range are not taken as ambient
const AMBIENT_RANGE: (f64, f64) = (5.0, 35.0);

pub trait PostProcessor: Send + Sync {
    fn name(&self) -> &'static str;

    fn process(&self, store: &mut TelemetryStore, time: DateTime<Utc>) -> Vec<Diagnostic>;
}

/// Link monitors to the parent named by their `hw.parent.*` attributes
///
/// The parent is looked up among monitors of the same connector whose `id`
/// attribute matches. Monitors without a resolvable parent hang under the
/// endpoint host.
#[derive(Debug, Clone, Copy, Default)]
pub struct ParentLinker;

impl PostProcessor for ParentLinker {
    fn name(&self) -> &'static str {
        "parent-linker"
    }

    fn process(&self, store: &mut TelemetryStore, _time: DateTime<Utc>) -> Vec<Diagnostic> {
        let host_id = store.endpoint_host_id().map(str::to_string);
        let mut diagnostics = Vec::new();
        let mut links = Vec::new();

        for monitor in store.all_monitors() {
            if monitor.monitor_type() == CONNECTOR_MONITOR_TYPE || Some(monitor.id()) == host_id.as_deref() {
                continue;
            }
            let Some(connector_id) = monitor.connector_id() else {
                continue;
            };

            let declared = match (
                monitor.attribute(PARENT_TYPE_ATTRIBUTE),
                monitor.attribute(PARENT_ID_ATTRIBUTE),
            ) {
                (Some(parent_type), Some(parent_id)) => Some((parent_type, parent_id)),
                _ => None,
            };
            let resolved = declared.and_then(|(parent_type, parent_id)| {
                store
                    .find_by_key_attributes(
                        parent_type,
                        connector_id,
                        &[("id".to_string(), parent_id.to_string())],
                    )
                    .map(|parent| parent.id().to_string())
                    .filter(|id| id != monitor.id())
            });

            if let (Some((parent_type, parent_id)), None) = (declared, &resolved) {
                let message = format!("parent {parent_type} '{parent_id}' not found");
                warn!("{}: {message}", monitor.id());
                diagnostics.push(Diagnostic::data(format!("monitor({})", monitor.id()), message));
            }

            let parent = resolved.or_else(|| host_id.clone());
            if monitor.parent_id() != parent.as_deref() {
                links.push((monitor.monitor_type().to_string(), monitor.id().to_string(), parent));
            }
        }

        trace!("linking {} monitor(s)", links.len());
        for (monitor_type, id, parent) in links {
            if let Some(monitor) = store.find_monitor_mut(&monitor_type, &id) {
                monitor.set_parent_id(parent);
            }
        }
        diagnostics
    }
}

/// Derive `hw.status.children` on every monitor with present children
#[derive(Debug, Clone, Copy, Default)]
pub struct ChildStatusAggregator;

fn health_rank(state: &str) -> Option<usize> {
    HEALTH_STATES.iter().position(|s| s.eq_ignore_ascii_case(state))
}

/// Worst `hw.status` state of a monitor, if it reports one
fn monitor_health(monitor: &Monitor) -> Option<usize> {
    monitor
        .metrics()
        .iter()
        .filter(|(name, _)| base_metric_name(name) == "hw.status")
        .filter_map(|(_, metric)| metric.as_state().and_then(health_rank))
        .max()
}

impl PostProcessor for ChildStatusAggregator {
    fn name(&self) -> &'static str {
        "child-status"
    }

    fn process(&self, store: &mut TelemetryStore, time: DateTime<Utc>) -> Vec<Diagnostic> {
        // parent id -> worst health of its present children
        let mut worst_by_parent: BTreeMap<&str, usize> = BTreeMap::new();
        for child in store.all_monitors().filter(|m| m.is_present()) {
            let (Some(parent_id), Some(rank)) = (child.parent_id(), monitor_health(child)) else {
                continue;
            };
            let worst = worst_by_parent.entry(parent_id).or_insert(rank);
            *worst = (*worst).max(rank);
        }

        let worst: Vec<(String, String, usize)> = store
            .all_monitors()
            .filter_map(|parent| {
                let rank = *worst_by_parent.get(parent.id())?;
                Some((parent.monitor_type().to_string(), parent.id().to_string(), rank))
            })
            .collect();

        let states: Vec<String> = HEALTH_STATES.iter().map(|s| s.to_string()).collect();
        for (monitor_type, id, rank) in worst {
            store.set_metric(
                &monitor_type,
                &id,
                CHILDREN_STATUS_METRIC,
                Metric::state_set(HEALTH_STATES[rank], states.clone(), time),
            );
        }
        Vec::new()
    }
}

/// Ambient temperature and heating margin of the endpoint host
///
/// Ambient is the lowest temperature reading in (5, 35). The heating margin
/// is the smallest distance between a sensor and its `high.degraded` limit
/// (`high.critical` when no degraded limit is known), floored at 0.
#[derive(Debug, Clone, Copy, Default)]
pub struct HostThermalCalculator;

/// Number metric whose base name matches and whose `limit_type` (if asked) does
fn limit(monitor: &Monitor, limit_type: &str) -> Option<f64> {
    monitor
        .metrics()
        .iter()
        .filter(|(name, _)| base_metric_name(name) == "hw.temperature.limit")
        .filter(|(name, _)| {
            metric_attributes(name).get("limit_type").map(String::as_str) == Some(limit_type)
        })
        .find_map(|(_, metric)| metric.as_number())
}

impl PostProcessor for HostThermalCalculator {
    fn name(&self) -> &'static str {
        "host-thermal"
    }

    fn process(&self, store: &mut TelemetryStore, time: DateTime<Utc>) -> Vec<Diagnostic> {
        let Some(host_id) = store.endpoint_host_id().map(str::to_string) else {
            return Vec::new();
        };

        let mut ambient: Option<f64> = None;
        let mut margin: Option<f64> = None;
        for monitor in store.all_monitors().filter(|m| m.is_present()) {
            let Some(temperature) = monitor.number_metric("hw.temperature") else {
                continue;
            };
            if temperature > AMBIENT_RANGE.0 && temperature < AMBIENT_RANGE.1 {
                ambient = Some(ambient.map_or(temperature, |a| a.min(temperature)));
            }
            let threshold = limit(monitor, "high.degraded").or_else(|| limit(monitor, "high.critical"));
            if let Some(threshold) = threshold {
                let sensor_margin = threshold - temperature;
                margin = Some(margin.map_or(sensor_margin, |m| m.min(sensor_margin)));
            }
        }

        if let Some(ambient) = ambient {
            let metric = Metric::number(ambient, time).with_unit(Some("Cel".to_string()));
            store.set_metric(HOST_MONITOR_TYPE, &host_id, AMBIENT_TEMPERATURE_METRIC, metric);
        }
        if let Some(margin) = margin {
            let metric = Metric::number(margin.max(0.0), time).with_unit(Some("Cel".to_string()));
            store.set_metric(HOST_MONITOR_TYPE, &host_id, HEATING_MARGIN_METRIC, metric);
        }
        Vec::new()
    }
}

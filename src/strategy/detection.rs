//! Detection: which connectors apply to the host
//!
//! Every criterion goes through the extension registry except `DeviceType`,
//! which is checked against the configured host type. The outcome of each
//! connector lands on a synthetic `connector` monitor; hardware monitors are
//! not touched here.
//!
//! Before any criterion runs, every configured protocol that has a health check
//! reports `metricshub.host.up{protocol="..."}` on the endpoint host.

use std::collections::BTreeSet;
use std::sync::Arc;

use futures::future::join_all;
use tracing::{debug, instrument, warn};

use crate::config::HostConfiguration;
use crate::connector::{ApplicabilityPolicy, Connector, Criterion};
use crate::extension::CriterionTestResult;
use crate::telemetry::{
    CONNECTOR_ID_ATTRIBUTE, CONNECTOR_MONITOR_TYPE, HOST_MONITOR_TYPE, Metric, TelemetryStore,
    metric_attributes,
};

use super::StrategyContext;

/// StateSet metric (`ok` | `failed`) of a connector monitor
pub const CONNECTOR_STATUS_METRIC: &str = "metricshub.connector.status";

/// Id of the monitor recording a connector's detection result
pub fn connector_monitor_id(connector_id: &str) -> String {
    format!("{CONNECTOR_MONITOR_TYPE}_{connector_id}")
}

/// Number metric of the endpoint host: 1 when `protocol` answers, 0 otherwise
pub fn host_up_metric_name(protocol: &str) -> String {
    format!("metricshub.host.up{{protocol=\"{protocol}\"}}")
}

/// Result of testing all criteria of one connector
struct ConnectorTest {
    connector: Arc<Connector>,
    success: bool,
    criteria: Vec<CriterionTestResult>,
}

#[instrument(skip_all, fields(host = %context.host.hostname))]
pub(super) async fn run(context: &StrategyContext, store: &mut TelemetryStore) {
    register_endpoint_host(context, store);
    check_protocol_health(context, store).await;

    let tests = if context.host.sequential {
        let mut tests = Vec::with_capacity(context.connectors.len());
        for connector in &context.connectors {
            if context.cancel.is_cancelled() {
                break;
            }
            tests.push(test_connector(context, connector).await);
        }
        tests
    } else {
        join_all(
            context
                .connectors
                .iter()
                .map(|connector| test_connector(context, connector)),
        )
        .await
    };

    let superseded: BTreeSet<&str> = tests
        .iter()
        .filter(|t| t.success)
        .flat_map(|t| t.connector.detection.supersedes.iter().map(String::as_str))
        .collect();

    for test in &tests {
        let replaced = test.success && superseded.contains(test.connector.id.as_str());
        record(context, store, test, replaced);
    }
    // detection failures are expected outcomes, not diagnostics
}

fn register_endpoint_host(context: &StrategyContext, store: &mut TelemetryStore) {
    let host = &context.host;
    let host_id = host.host_id().to_string();
    let monitor = store.set_endpoint_host(&host_id);
    monitor.set_attribute("host.name", host.hostname.clone());
    monitor.set_attribute("host.type", device_kind_name(host));
    monitor.set_attribute("is_endpoint", "true");
    store.mark_present(HOST_MONITOR_TYPE, &host_id, context.strategy_time);
}

async fn check_protocol_health(context: &StrategyContext, store: &mut TelemetryStore) {
    let host = &context.host;
    let results = context
        .registry
        .check_protocols(host, host.strategy_timeout())
        .await;

    for (protocol, up) in results {
        if !up {
            warn!("{protocol} is not responding on {}", host.hostname);
        }
        let name = host_up_metric_name(protocol);
        let metric = Metric::number(if up { 1.0 } else { 0.0 }, context.strategy_time)
            .with_attributes(metric_attributes(&name));
        store.set_metric(HOST_MONITOR_TYPE, host.host_id(), &name, metric);
    }
}

fn device_kind_name(host: &HostConfiguration) -> String {
    serde_json::to_value(host.host_type)
        .ok()
        .and_then(|v| v.as_str().map(str::to_string))
        .unwrap_or_default()
}

async fn test_connector(context: &StrategyContext, connector: &Arc<Connector>) -> ConnectorTest {
    let detection = &connector.detection;
    let mut criteria = Vec::with_capacity(detection.criteria.len());
    let mut success = detection.policy == ApplicabilityPolicy::All;

    for criterion in &detection.criteria {
        let result = test_criterion(context, connector, criterion).await;
        let passed = result.success;
        criteria.push(result);

        match detection.policy {
            ApplicabilityPolicy::All if !passed => {
                success = false;
                break;
            }
            ApplicabilityPolicy::Any if passed => {
                success = true;
                break;
            }
            _ => {}
        }
    }

    debug!(
        "connector {} {}",
        connector.id,
        if success { "applies" } else { "does not apply" }
    );
    ConnectorTest {
        connector: connector.clone(),
        success,
        criteria,
    }
}

async fn test_criterion(
    context: &StrategyContext,
    connector: &Connector,
    criterion: &Criterion,
) -> CriterionTestResult {
    match criterion {
        Criterion::DeviceType { keep, exclude } => {
            let host_type = context.host.host_type;
            let kept = keep.is_empty() || keep.contains(&host_type);
            let excluded = exclude.contains(&host_type);
            let name = device_kind_name(&context.host);
            if kept && !excluded {
                CriterionTestResult::success(format!("Host type {name} is accepted."), Some(name))
            } else {
                CriterionTestResult::failure(format!("Host type {name} is not accepted."), Some(name))
            }
        }
        _ => {
            context
                .registry
                .execute_criterion(
                    criterion,
                    &connector.id,
                    &context.host,
                    context.host.strategy_timeout(),
                )
                .await
        }
    }
}

/// Per-criterion trace followed by the conclusion line
fn status_information(hostname: &str, test: &ConnectorTest, applies: bool) -> String {
    let mut lines: Vec<String> = test
        .criteria
        .iter()
        .filter(|c| c.result.is_some() || !c.message.is_empty())
        .map(|c| {
            format!(
                "Received Result: {}. {}",
                c.result.as_deref().map(str::trim).unwrap_or("N/A"),
                if c.message.is_empty() { "N/A" } else { c.message.as_str() }
            )
        })
        .collect();
    if test.success && !applies {
        lines.push("Superseded by another applicable connector.".to_string());
    }
    lines.push(format!(
        "Conclusion: Test on {hostname} {}",
        if applies { "SUCCEEDED" } else { "FAILED" }
    ));
    lines.join("\n")
}

fn record(context: &StrategyContext, store: &mut TelemetryStore, test: &ConnectorTest, superseded: bool) {
    let connector = &test.connector;
    let applies = test.success && !superseded;
    let id = connector_monitor_id(&connector.id);
    let host_id = store.endpoint_host_id().map(str::to_string);

    let monitor = store.get_or_create(CONNECTOR_MONITOR_TYPE, &id);
    monitor.set_attribute(CONNECTOR_ID_ATTRIBUTE, connector.id.clone());
    monitor.set_attribute("name", connector.display_name().to_string());
    monitor.set_attribute(
        "status_information",
        status_information(&context.host.hostname, test, applies),
    );
    monitor.set_parent_id(host_id);

    let state = if applies { "ok" } else { "failed" };
    store.set_metric(
        CONNECTOR_MONITOR_TYPE,
        &id,
        CONNECTOR_STATUS_METRIC,
        Metric::state_set(
            state,
            vec!["ok".to_string(), "failed".to_string()],
            context.strategy_time,
        ),
    );
    store.mark_present(CONNECTOR_MONITOR_TYPE, &id, context.strategy_time);
}

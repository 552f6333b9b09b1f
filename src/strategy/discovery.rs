//! Discovery: create and refresh monitors, track their presence
//!
//! For every applicable connector the parent-like monitor types run first and
//! one after the other so that parents exist before their children. The
//! remaining types are resolved concurrently (unless the host is sequential)
//! and applied to the store in type order, each one as soon as it and the
//! types before it have resolved.
//!
//! A type whose job ran to completion marks every monitor of this connector it
//! did not see as missing. A job skipped for a structural error, or cut short
//! by cancellation, leaves presence as it was.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::stream::{self, StreamExt};
use tracing::{debug, instrument, trace, warn};

use crate::connector::{Connector, MonitorJob, column_reference};
use crate::error::{Diagnostic, EngineError, EngineResult};
use crate::resolver::{ResolvedSources, SourceResolver};
use crate::table::SourceTable;
use crate::telemetry::{CONNECTOR_ID_ATTRIBUTE, HOST_MONITOR_TYPE, TelemetryStore, monitor_id};

use super::StrategyContext;
use super::mapping;
use super::metric::apply_metrics;

/// Monitor types discovered first, in this order
pub const PRIORITY_MONITOR_TYPES: [&str; 5] = ["host", "enclosure", "blade", "disk_controller", "cpu"];

/// Attribute recording the type of a discovered monitor
const MONITOR_TYPE_ATTRIBUTE: &str = "monitor.type";

struct JobResolution {
    monitor_type: String,
    result: EngineResult<ResolvedSources>,
    elapsed: Duration,
}

#[instrument(skip_all, fields(host = %context.host.hostname))]
pub(super) async fn run(
    context: &StrategyContext,
    store: &mut TelemetryStore,
    diagnostics: &mut Vec<Diagnostic>,
) {
    for connector in context.applicable_connectors(store) {
        if context.cancel.is_cancelled() {
            break;
        }
        let resolver = context.resolver(&connector);

        let priority: Vec<(&str, &MonitorJob)> = PRIORITY_MONITOR_TYPES
            .iter()
            .filter_map(|t| connector.discovery_job(t).map(|job| (*t, job)))
            .collect();
        let others: Vec<(&str, &MonitorJob)> = connector
            .monitors
            .iter()
            .filter(|(t, _)| !PRIORITY_MONITOR_TYPES.contains(&t.as_str()))
            .filter_map(|(t, jobs)| jobs.discovery.as_ref().map(|job| (t.as_str(), job)))
            .collect();

        for (monitor_type, job) in &priority {
            let resolution = resolve_job(&resolver, &connector, monitor_type, job).await;
            diagnostics.extend(apply(context, store, &connector, job, resolution));
        }

        let concurrency = if context.host.sequential { 1 } else { others.len().max(1) };
        let (resolver, resolving_connector) = (&resolver, &connector);
        let mut resolutions = std::pin::pin!(
            stream::iter(&others)
                .map(|&(monitor_type, job)| async move {
                    let resolution = resolve_job(resolver, resolving_connector, monitor_type, job).await;
                    (job, resolution)
                })
                .buffered(concurrency)
                .boxed()
        );
        while let Some((job, resolution)) = resolutions.next().await {
            diagnostics.extend(apply(context, store, &connector, job, resolution));
        }
    }
}

async fn resolve_job(
    resolver: &SourceResolver,
    connector: &Connector,
    monitor_type: &str,
    job: &MonitorJob,
) -> JobResolution {
    let started = Instant::now();
    let job_name = format!("{}.{monitor_type}.discovery", connector.id);
    let result = resolver.resolve(&job_name, &job.sources).await;
    JobResolution {
        monitor_type: monitor_type.to_string(),
        result,
        elapsed: started.elapsed(),
    }
}

/// Turn one resolved discovery job into monitors
fn apply(
    context: &StrategyContext,
    store: &mut TelemetryStore,
    connector: &Arc<Connector>,
    job: &MonitorJob,
    resolution: JobResolution,
) -> Vec<Diagnostic> {
    let monitor_type = resolution.monitor_type.as_str();
    let job_name = format!("{}.{monitor_type}.discovery", connector.id);
    context.record_job_duration(store, "discovery", monitor_type, &connector.id, resolution.elapsed);

    let mut resolved = match resolution.result {
        Ok(resolved) => resolved,
        Err(e) => return vec![structural(&job_name, e)],
    };
    let mut diagnostics = std::mem::take(&mut resolved.diagnostics);

    let Some(table) = resolved.take(&job.mapping.source) else {
        if !resolved.cancelled {
            diagnostics.push(structural(
                &job_name,
                format!("mapping source '{}' is not a source of the job", job.mapping.source),
            ));
        }
        return diagnostics;
    };

    if let Err(e) = check_key_columns(job, &table) {
        diagnostics.push(structural(&job_name, e));
        return diagnostics;
    }

    let time = context.strategy_time;
    let endpoint_id = store.endpoint_host_id().map(str::to_string);
    let mut seen = BTreeSet::new();

    for (index, row) in table.rows.iter().enumerate() {
        let attributes = evaluate_attributes(store, job, row);
        let Some(keys) = key_values(job, &attributes) else {
            warn!("{job_name}: row {} has a blank instance key, skipped", index + 1);
            diagnostics.push(Diagnostic::data(
                format!("{job_name}.row({})", index + 1),
                "blank instance key",
            ));
            continue;
        };

        // a connector's host monitor is the endpoint host itself
        let id = match (&endpoint_id, monitor_type) {
            (Some(endpoint_id), HOST_MONITOR_TYPE) => endpoint_id.clone(),
            _ => {
                let keys: Vec<&str> = keys.iter().map(String::as_str).collect();
                monitor_id(&connector.id, monitor_type, &keys)
            }
        };

        let monitor = store.get_or_create(monitor_type, &id);
        for (name, value) in attributes {
            monitor.set_attribute(name, value);
        }
        monitor.set_attribute(CONNECTOR_ID_ATTRIBUTE, connector.id.clone());
        monitor.set_attribute(MONITOR_TYPE_ATTRIBUTE, monitor_type);

        diagnostics.extend(apply_metrics(
            store,
            connector,
            monitor_type,
            &id,
            &job.mapping,
            row,
            time,
        ));
        store.mark_present(monitor_type, &id, time);
        seen.insert(id);
    }

    if resolved.cancelled {
        debug!("{job_name}: cancelled, presence left unchanged");
        return diagnostics;
    }

    let missing: Vec<String> = store
        .ids_owned_by(monitor_type, &connector.id)
        .into_iter()
        .filter(|id| !seen.contains(id) && Some(id) != endpoint_id.as_ref())
        .collect();
    store.mark_absent(monitor_type, missing.iter().map(String::as_str), time);

    trace!("{job_name}: {} monitor(s) seen", seen.len());
    diagnostics
}

fn structural(job_name: &str, error: impl ToString) -> Diagnostic {
    let message = error.to_string();
    warn!("{job_name} skipped: {message}");
    Diagnostic::structural(job_name, message)
}

/// Every mapped attribute that has a value on this row
pub(super) fn evaluate_attributes(
    store: &TelemetryStore,
    job: &MonitorJob,
    row: &[String],
) -> BTreeMap<String, String> {
    job.mapping
        .attributes
        .iter()
        .filter_map(|(name, expression)| {
            mapping::evaluate(store, expression, row).map(|value| (name.clone(), value))
        })
        .collect()
}

/// Values of the instance keys, `None` if any is missing or blank
pub(super) fn key_values(job: &MonitorJob, attributes: &BTreeMap<String, String>) -> Option<Vec<String>> {
    job.keys
        .iter()
        .map(|key| {
            attributes
                .get(key)
                .filter(|value| !value.trim().is_empty())
                .cloned()
        })
        .collect()
}

/// Instance key attributes must be mapped and their columns must exist
///
/// An empty table has no columns to check; it simply yields no monitor.
pub(super) fn check_key_columns(job: &MonitorJob, table: &SourceTable) -> EngineResult<()> {
    for key in &job.keys {
        let Some(expression) = job.mapping.attributes.get(key) else {
            return Err(EngineError::MissingKeyColumn {
                key: key.clone(),
                column: 0,
                source_key: job.mapping.source.clone(),
            });
        };
        if let Some(column) = column_reference(expression)
            && !table.is_empty()
            && column > table.column_count()
        {
            return Err(EngineError::MissingKeyColumn {
                key: key.clone(),
                column,
                source_key: job.mapping.source.clone(),
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connector::{Mapping, Source, SourceKind};

    fn job(mapping: Mapping) -> MonitorJob {
        MonitorJob::new(
            vec![Source::new("s1", SourceKind::Static { value: String::new() })],
            mapping,
        )
    }

    #[test]
    fn test_missing_key_column_is_structural() {
        let job = job(Mapping::new("s1").attribute("id", "$4"));
        let table = SourceTable::from_csv("a;b", ";");
        assert!(matches!(
            check_key_columns(&job, &table),
            Err(EngineError::MissingKeyColumn { column: 4, .. })
        ));
        assert!(check_key_columns(&job, &SourceTable::empty()).is_ok());
    }

    #[test]
    fn test_unmapped_key_is_structural() {
        let job = job(Mapping::new("s1").attribute("name", "$1"));
        assert!(check_key_columns(&job, &SourceTable::from_csv("a", ";")).is_err());
    }

    #[test]
    fn test_key_values() {
        let store = TelemetryStore::new("h");
        let job = job(Mapping::new("s1").attribute("id", "$1")).with_keys(&["id"]);
        let row = vec![" ".to_string()];
        assert_eq!(key_values(&job, &evaluate_attributes(&store, &job, &row)), None);
        let row = vec!["disk-1".to_string()];
        assert_eq!(
            key_values(&job, &evaluate_attributes(&store, &job, &row)),
            Some(vec!["disk-1".to_string()])
        );
    }

    #[test]
    fn test_priority_types() {
        assert_eq!(PRIORITY_MONITOR_TYPES[0], "host");
        assert!(PRIORITY_MONITOR_TYPES.contains(&"enclosure"));
    }
}

//! Collect: refresh the metrics of present monitors
//!
//! A multi-instance job resolves its sources once and routes each row to the
//! monitor whose key attributes match. A mono-instance job resolves its
//! sources once per monitor, with `${attribute::name}` placeholders replaced by
//! that monitor's attributes, and reads the first row. Each monitor's metrics
//! are written as soon as its resolution (and those of the monitors before it)
//! are done.
//!
//! Collect never creates monitors and never changes presence.

use std::collections::BTreeMap;
use std::sync::{Arc, LazyLock};
use std::time::Instant;

use futures::stream::{self, StreamExt};
use regex::{Captures, Regex};
use tracing::{instrument, trace, warn};

use crate::connector::{Connector, JobKind, MonitorJob, Source};
use crate::error::{Diagnostic, EngineResult};
use crate::resolver::{ResolvedSources, SourceResolver};
use crate::telemetry::TelemetryStore;

use super::StrategyContext;
use super::discovery::{check_key_columns, evaluate_attributes, key_values};
use super::metric::apply_metrics;

static ATTRIBUTE_PLACEHOLDER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$\{attribute::([^}]+)\}").expect("attribute placeholder pattern is valid")
});

/// Replace `${attribute::name}` with the value of the attribute (empty if unset)
pub(crate) fn substitute_attributes(text: &str, attributes: &BTreeMap<String, String>) -> String {
    ATTRIBUTE_PLACEHOLDER
        .replace_all(text, |caps: &Captures| {
            attributes
                .get(caps[1].trim())
                .cloned()
                .unwrap_or_default()
        })
        .into_owned()
}

/// A present monitor targeted by a collect job
struct Target {
    id: String,
    attributes: BTreeMap<String, String>,
}

#[instrument(skip_all, fields(host = %context.host.hostname))]
pub(super) async fn run(
    context: &StrategyContext,
    store: &mut TelemetryStore,
    diagnostics: &mut Vec<Diagnostic>,
) {
    for connector in context.applicable_connectors(store) {
        let resolver = context.resolver(&connector);

        for (monitor_type, jobs) in &connector.monitors {
            if context.cancel.is_cancelled() {
                return;
            }
            let Some(job) = jobs.collect.as_ref() else {
                continue;
            };

            let targets: Vec<Target> = store
                .monitors_of_type(monitor_type)
                .filter(|m| m.is_present() && m.connector_id() == Some(connector.id.as_str()))
                .map(|m| Target {
                    id: m.id().to_string(),
                    attributes: m.attributes().clone(),
                })
                .collect();
            if targets.is_empty() {
                trace!("no present {monitor_type} monitor for {}", connector.id);
                continue;
            }

            let started = Instant::now();
            match job.kind {
                JobKind::MultiInstance => {
                    diagnostics.extend(
                        collect_multi_instance(context, store, &resolver, &connector, monitor_type, job)
                            .await,
                    );
                }
                JobKind::MonoInstance => {
                    let job = JobTarget {
                        resolver: &resolver,
                        connector: &connector,
                        monitor_type,
                        job,
                    };
                    collect_mono_instance(context, store, job, targets, diagnostics).await;
                }
            }
            context.record_job_duration(store, "collect", monitor_type, &connector.id, started.elapsed());
        }
    }
}

async fn collect_multi_instance(
    context: &StrategyContext,
    store: &mut TelemetryStore,
    resolver: &SourceResolver,
    connector: &Arc<Connector>,
    monitor_type: &str,
    job: &MonitorJob,
) -> Vec<Diagnostic> {
    let job_name = format!("{}.{monitor_type}.collect", connector.id);
    let mut resolved = match resolver.resolve(&job_name, &job.sources).await {
        Ok(resolved) => resolved,
        Err(e) => return vec![structural(&job_name, e)],
    };
    let mut diagnostics = std::mem::take(&mut resolved.diagnostics);

    let Some(table) = mapping_table(&mut resolved, job, &job_name, &mut diagnostics) else {
        return diagnostics;
    };
    if let Err(e) = check_key_columns(job, &table) {
        diagnostics.push(structural(&job_name, e));
        return diagnostics;
    }

    for row in &table.rows {
        let attributes = evaluate_attributes(store, job, row);
        let Some(values) = key_values(job, &attributes) else {
            continue;
        };
        let keys: Vec<(String, String)> = job.keys.iter().cloned().zip(values).collect();

        let Some(id) = store
            .find_by_key_attributes(monitor_type, &connector.id, &keys)
            .filter(|m| m.is_present())
            .map(|m| m.id().to_string())
        else {
            trace!("{job_name}: no present monitor for {keys:?}");
            continue;
        };

        diagnostics.extend(apply_metrics(
            store,
            connector,
            monitor_type,
            &id,
            &job.mapping,
            row,
            context.strategy_time,
        ));
    }

    diagnostics
}

/// A collect job bound to its connector
struct JobTarget<'a> {
    resolver: &'a SourceResolver,
    connector: &'a Arc<Connector>,
    monitor_type: &'a str,
    job: &'a MonitorJob,
}

impl JobTarget<'_> {
    /// Resolve the job's sources for one monitor
    async fn resolve(&self, target: &Target) -> (String, EngineResult<ResolvedSources>) {
        let job_name = format!(
            "{}.{}.collect({})",
            self.connector.id, self.monitor_type, target.id
        );
        let sources: Vec<Source> = self
            .job
            .sources
            .iter()
            .cloned()
            .map(|mut source| {
                source
                    .kind
                    .map_parameters(&|text: &str| substitute_attributes(text, &target.attributes));
                source
            })
            .collect();
        let result = self.resolver.resolve(&job_name, &sources).await;
        (job_name, result)
    }
}

async fn collect_mono_instance(
    context: &StrategyContext,
    store: &mut TelemetryStore,
    job_target: JobTarget<'_>,
    targets: Vec<Target>,
    diagnostics: &mut Vec<Diagnostic>,
) {
    let JobTarget {
        connector,
        monitor_type,
        job,
        ..
    } = job_target;
    let concurrency = if context.host.sequential { 1 } else { targets.len().max(1) };
    let job_target = &job_target;
    let mut results = std::pin::pin!(
        stream::iter(&targets)
            .map(|target| async move { (target, job_target.resolve(target).await) })
            .buffered(concurrency)
            .boxed()
    );

    while let Some((target, (job_name, result))) = results.next().await {
        let mut resolved = match result {
            Ok(resolved) => resolved,
            Err(e) => {
                diagnostics.push(structural(&job_name, e));
                continue;
            }
        };
        diagnostics.append(&mut resolved.diagnostics);

        let Some(table) = mapping_table(&mut resolved, job, &job_name, diagnostics) else {
            continue;
        };
        let Some(row) = table.rows.first() else {
            trace!("{job_name}: no row");
            continue;
        };
        diagnostics.extend(apply_metrics(
            store,
            connector,
            monitor_type,
            &target.id,
            &job.mapping,
            row,
            context.strategy_time,
        ));
    }
}

/// The table the mapping reads, or a structural diagnostic when it is not a job source
fn mapping_table(
    resolved: &mut ResolvedSources,
    job: &MonitorJob,
    job_name: &str,
    diagnostics: &mut Vec<Diagnostic>,
) -> Option<crate::table::SourceTable> {
    let table = resolved.take(&job.mapping.source);
    if table.is_none() && !resolved.cancelled {
        diagnostics.push(structural(
            job_name,
            format!("mapping source '{}' is not a source of the job", job.mapping.source),
        ));
    }
    table
}

fn structural(job_name: &str, error: impl ToString) -> Diagnostic {
    let message = error.to_string();
    warn!("{job_name} skipped: {message}");
    Diagnostic::structural(job_name, message)
}

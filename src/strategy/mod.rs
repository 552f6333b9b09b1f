//! Strategy State Machine - one monitoring cycle of a host
//!
//! A cycle drives every connector selected for the host through the same
//! phases, strictly one after the other:
//!
//! ```text
//! Detection ─► Discovery ─► post-discovery ─► Collect ─► post-collect
//!     │            │              │               │             │
//!     │            │              │               │             └─ thermal, child status
//!     │            │              │               └─ metrics of present monitors
//!     │            │              └─ parent links, child status
//!     │            └─ monitors created / refreshed / marked missing
//!     └─ connector monitors (ok | failed)
//! ```
//!
//! Each phase is bounded by the host phase timeout, which is never shorter than
//! twice the strategy timeout so a source waiting on its default protocol
//! timeout cannot starve its siblings. Jobs are written to the store as soon as
//! they resolve; a phase that times out keeps whatever it already wrote, is
//! listed in the [`CycleReport`] and the cycle moves on. Nothing in a phase
//! fails the cycle: problems become [`Diagnostic`]s.

mod collect;
mod detection;
mod discovery;
mod mapping;
mod metric;
pub mod post_processing;

use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{RwLock, Semaphore};
use tracing::{debug, instrument, warn};

use crate::config::HostConfiguration;
use crate::connector::Connector;
use crate::error::Diagnostic;
use crate::extension::ExtensionRegistry;
use crate::resolver::{CancellationFlag, SourceResolver};
use crate::telemetry::{CONNECTOR_MONITOR_TYPE, Metric, TelemetryStore};

pub use detection::{CONNECTOR_STATUS_METRIC, connector_monitor_id, host_up_metric_name};
pub use discovery::PRIORITY_MONITOR_TYPES;
pub use post_processing::{
    ChildStatusAggregator, HostThermalCalculator, ParentLinker, PostProcessor,
};

/// Metric recording how long a job took, in seconds
pub(crate) fn job_duration_metric_name(job_type: &str, monitor_type: &str, connector_id: &str) -> String {
    format!(
        "metricshub.job.duration{{job.type=\"{job_type}\", monitor.type=\"{monitor_type}\", connector_id=\"{connector_id}\"}}"
    )
}

/// Stages of a cycle, in execution order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Detection,
    Discovery,
    PostDiscovery,
    Collect,
    PostCollect,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Detection => "detection",
            Phase::Discovery => "discovery",
            Phase::PostDiscovery => "post-discovery",
            Phase::Collect => "collect",
            Phase::PostCollect => "post-collect",
        };
        f.write_str(name)
    }
}

/// What happened during one cycle
#[derive(Debug, Clone, Serialize)]
pub struct CycleReport {
    pub hostname: String,

    /// Timestamp stamped on every metric of the cycle
    pub strategy_time: DateTime<Utc>,

    /// Connectors whose detection succeeded
    pub applicable_connectors: Vec<String>,

    pub monitor_count: usize,

    pub present_monitor_count: usize,

    pub diagnostics: Vec<Diagnostic>,

    pub timed_out_phases: Vec<Phase>,

    /// Cancellation stopped the cycle before every phase ran
    pub cancelled: bool,
}

impl CycleReport {
    fn new(hostname: &str, strategy_time: DateTime<Utc>) -> Self {
        Self {
            hostname: hostname.to_string(),
            strategy_time,
            applicable_connectors: Vec::new(),
            monitor_count: 0,
            present_monitor_count: 0,
            diagnostics: Vec::new(),
            timed_out_phases: Vec::new(),
            cancelled: false,
        }
    }
}

/// Shared, read-only inputs of the phases of one cycle
pub(crate) struct StrategyContext {
    pub host: Arc<HostConfiguration>,
    pub connectors: Vec<Arc<Connector>>,
    pub registry: Arc<ExtensionRegistry>,
    pub permits: Arc<Semaphore>,

    /// Serial lane of each connector, shared by all its jobs during the cycle
    pub lanes: BTreeMap<String, Arc<RwLock<()>>>,

    pub cancel: CancellationFlag,
    pub strategy_time: DateTime<Utc>,
}

impl StrategyContext {
    pub fn resolver(&self, connector: &Arc<Connector>) -> SourceResolver {
        SourceResolver::new(
            connector.clone(),
            self.host.clone(),
            self.registry.clone(),
            self.permits.clone(),
            self.lanes.get(&connector.id).cloned().unwrap_or_default(),
            self.cancel.clone(),
        )
    }

    /// Connectors whose connector monitor says `ok`
    pub fn applicable_connectors(&self, store: &TelemetryStore) -> Vec<Arc<Connector>> {
        self.connectors
            .iter()
            .filter(|connector| {
                store
                    .find_monitor(CONNECTOR_MONITOR_TYPE, &connector_monitor_id(&connector.id))
                    .and_then(|m| m.state_metric(CONNECTOR_STATUS_METRIC))
                    == Some("ok")
            })
            .cloned()
            .collect()
    }

    /// Record a job duration on the endpoint host monitor
    pub fn record_job_duration(
        &self,
        store: &mut TelemetryStore,
        job_type: &str,
        monitor_type: &str,
        connector_id: &str,
        elapsed: Duration,
    ) {
        let Some(host_id) = store.endpoint_host_id().map(str::to_string) else {
            return;
        };
        let name = job_duration_metric_name(job_type, monitor_type, connector_id);
        let metric = Metric::number(elapsed.as_secs_f64(), self.strategy_time)
            .with_unit(Some("s".to_string()))
            .with_attributes(crate::telemetry::metric_attributes(&name));
        store.set_metric(crate::telemetry::HOST_MONITOR_TYPE, &host_id, &name, metric);
    }
}

/// One monitoring cycle of a host
pub struct HostCycle {
    host: Arc<HostConfiguration>,
    connectors: Vec<Arc<Connector>>,
    registry: Arc<ExtensionRegistry>,
    cancel: CancellationFlag,
    post_discovery: Vec<Box<dyn PostProcessor>>,
    post_collect: Vec<Box<dyn PostProcessor>>,
}

impl HostCycle {
    /// Cycle over the connectors the host selects, with the built-in post-processors
    pub fn new(
        host: Arc<HostConfiguration>,
        connectors: &[Arc<Connector>],
        registry: Arc<ExtensionRegistry>,
    ) -> Self {
        let connectors = connectors
            .iter()
            .filter(|c| host.selects(&c.id))
            .cloned()
            .collect();
        Self {
            host,
            connectors,
            registry,
            cancel: CancellationFlag::new(),
            post_discovery: vec![Box::new(ParentLinker), Box::new(ChildStatusAggregator)],
            post_collect: vec![Box::new(HostThermalCalculator), Box::new(ChildStatusAggregator)],
        }
    }

    /// Share a cancellation flag with the owner of the cycle
    #[must_use]
    pub fn with_cancellation(mut self, cancel: CancellationFlag) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn cancellation(&self) -> &CancellationFlag {
        &self.cancel
    }

    pub fn host(&self) -> &HostConfiguration {
        &self.host
    }

    /// Run every phase against the host's store
    #[instrument(skip(self, store), fields(host = %self.host.hostname))]
    pub async fn run(&self, store: &mut TelemetryStore) -> CycleReport {
        let context = StrategyContext {
            host: self.host.clone(),
            connectors: self.connectors.clone(),
            registry: self.registry.clone(),
            permits: Arc::new(Semaphore::new(self.host.source_parallelism())),
            lanes: self
                .connectors
                .iter()
                .map(|c| (c.id.clone(), Arc::default()))
                .collect(),
            cancel: self.cancel.clone(),
            strategy_time: Utc::now(),
        };
        let mut report = CycleReport::new(&self.host.hostname, context.strategy_time);
        let timeout = self.host.phase_timeout();

        debug!("starting cycle with {} connector(s)", self.connectors.len());

        for phase in [
            Phase::Detection,
            Phase::Discovery,
            Phase::PostDiscovery,
            Phase::Collect,
            Phase::PostCollect,
        ] {
            if self.cancel.is_cancelled() {
                debug!("cycle cancelled before {phase}");
                report.cancelled = true;
                break;
            }

            let diagnostics = &mut report.diagnostics;
            let finished = match phase {
                Phase::Detection => {
                    bounded(phase, timeout, detection::run(&context, store)).await
                }
                Phase::Discovery => {
                    bounded(phase, timeout, discovery::run(&context, store, diagnostics)).await
                }
                Phase::PostDiscovery => {
                    let work = post_process(&self.post_discovery, store, context.strategy_time, diagnostics);
                    bounded(phase, timeout, work).await
                }
                Phase::Collect => {
                    bounded(phase, timeout, collect::run(&context, store, diagnostics)).await
                }
                Phase::PostCollect => {
                    let work = post_process(&self.post_collect, store, context.strategy_time, diagnostics);
                    bounded(phase, timeout, work).await
                }
            };
            if !finished {
                report.timed_out_phases.push(phase);
                report.diagnostics.push(Diagnostic::execution(
                    phase.to_string(),
                    format!("timed out after {timeout:?}"),
                ));
            }

            if phase == Phase::Detection {
                report.applicable_connectors = context
                    .applicable_connectors(store)
                    .iter()
                    .map(|c| c.id.clone())
                    .collect();
            }
        }

        report.monitor_count = store.monitor_count();
        report.present_monitor_count = store.all_monitors().filter(|m| m.is_present()).count();
        debug!(
            "cycle done: {} monitor(s), {} present, {} diagnostic(s)",
            report.monitor_count,
            report.present_monitor_count,
            report.diagnostics.len()
        );
        report
    }
}

/// Run a phase under the phase timeout; false when it was cut short
///
/// Diagnostics are pushed by the phase as it goes, so those of a timed-out
/// phase are kept too.
async fn bounded(phase: Phase, timeout: Duration, work: impl Future<Output = ()>) -> bool {
    let finished = tokio::time::timeout(timeout, work).await.is_ok();
    if !finished {
        warn!("{phase} timed out after {timeout:?}");
    }
    finished
}

async fn post_process(
    processors: &[Box<dyn PostProcessor>],
    store: &mut TelemetryStore,
    time: DateTime<Utc>,
    diagnostics: &mut Vec<Diagnostic>,
) {
    for processor in processors {
        diagnostics.extend(
            processor
                .process(store, time)
                .into_iter()
                .map(|d| d.within(processor.name())),
        );
    }
}

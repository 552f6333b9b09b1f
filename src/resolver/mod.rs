//! Source Resolver - dependency ordering and execution of a job's sources
//!
//! A monitor job declares its sources in a list, but Copy, TableJoin and
//! TableUnion sources read other sources of the same job. The resolver turns
//! that list into tables:
//!
//! ```text
//! sources ─► dependency graph ─► Kahn ordering ─┬─► cycle: EngineError::CyclicDependency
//!                                               │
//!                                               └─► ready sources in declaration order
//!                                                     ├── internal (Copy, Static, Union, Join): inline
//!                                                     └── protocol: JoinSet task
//!                                                           ├── host Semaphore (parallelism)
//!                                                           ├── connector serial lane (RwLock)
//!                                                           └── timeout
//!                                                   each result ─► computes ─► dependents ready
//! ```
//!
//! ## Concurrency
//!
//! Protocol sources whose inputs are resolved run concurrently, bounded by the
//! host's semaphore (one permit per source, a single permit for sequential
//! hosts). A `forceSerialization` source takes the write side of the
//! connector's serial lane while every other protocol source takes the read
//! side. The lane is shared by all jobs of the connector during a cycle, so a
//! serialized source never overlaps another source of that connector, even
//! across jobs resolved concurrently.
//!
//! ## Cancellation
//!
//! Once the [`CancellationFlag`] is raised no new source is scheduled. Calls in
//! flight finish or hit their own timeout, their tables are kept, and the
//! result is marked cancelled.

mod internal;

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::{RwLock, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error, instrument, trace, warn};

use crate::compute::{ComputeContext, apply_computes};
use crate::config::HostConfiguration;
use crate::connector::{Connector, Source};
use crate::error::{Diagnostic, EngineError, EngineResult};
use crate::extension::{ExtensionRegistry, SourceOutcome};
use crate::table::SourceTable;

/// Shared stop signal for a host cycle
#[derive(Debug, Clone, Default)]
pub struct CancellationFlag(Arc<AtomicBool>);

impl CancellationFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Re-arm the flag before a new cycle
    pub fn reset(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Tables of a job after resolution
#[derive(Debug, Clone, Default)]
pub struct ResolvedSources {
    /// Post-compute table of every source that ran
    pub tables: BTreeMap<String, SourceTable>,

    pub diagnostics: Vec<Diagnostic>,

    /// True when cancellation stopped scheduling before every source ran
    pub cancelled: bool,
}

impl ResolvedSources {
    pub fn table(&self, key: &str) -> Option<&SourceTable> {
        self.tables.get(key)
    }

    /// Take a table out, leaving nothing behind
    pub fn take(&mut self, key: &str) -> Option<SourceTable> {
        self.tables.remove(key)
    }
}

/// Resolves the sources of the jobs of one connector on one host
#[derive(Clone)]
pub struct SourceResolver {
    connector: Arc<Connector>,
    host: Arc<HostConfiguration>,
    registry: Arc<ExtensionRegistry>,

    /// Host-wide source parallelism, shared by every job of the cycle
    permits: Arc<Semaphore>,

    /// Serial lane of the connector, shared by every job of the cycle
    lane: Arc<RwLock<()>>,

    cancel: CancellationFlag,
}

impl SourceResolver {
    pub fn new(
        connector: Arc<Connector>,
        host: Arc<HostConfiguration>,
        registry: Arc<ExtensionRegistry>,
        permits: Arc<Semaphore>,
        lane: Arc<RwLock<()>>,
        cancel: CancellationFlag,
    ) -> Self {
        Self {
            connector,
            host,
            registry,
            permits,
            lane,
            cancel,
        }
    }

    /// Resolve every source of a job
    ///
    /// Fails only for a dependency cycle; every other problem is a diagnostic
    /// and an empty table.
    #[instrument(skip(self, job_name, sources), fields(host = %self.host.hostname, job = job_name))]
    pub async fn resolve(&self, job_name: &str, sources: &[Source]) -> EngineResult<ResolvedSources> {
        let graph = DependencyGraph::build(sources);
        if let Some(cycle) = graph.find_cycle() {
            return Err(EngineError::CyclicDependency {
                job: job_name.to_string(),
                sources: cycle.into_iter().map(|i| sources[i].key.clone()).collect(),
            });
        }

        let mut run = Run {
            resolver: self,
            sources,
            graph,
            resolved: ResolvedSources::default(),
            in_flight: BTreeSet::new(),
        };
        run.execute().await;

        let mut resolved = run.resolved;
        for diagnostic in &mut resolved.diagnostics {
            *diagnostic = diagnostic.clone().within(job_name);
        }
        debug!(
            "resolved {} of {} source(s)",
            resolved.tables.len(),
            sources.len()
        );
        Ok(resolved)
    }
}

/// Edges between the sources of one job, by declaration index
struct DependencyGraph {
    /// Number of unresolved inputs of each source
    in_degree: Vec<usize>,

    /// Sources reading each source
    dependents: Vec<Vec<usize>>,

    /// Inputs of each source, for cycle reporting
    inputs: Vec<Vec<usize>>,
}

impl DependencyGraph {
    fn build(sources: &[Source]) -> Self {
        let index: HashMap<&str, usize> = sources
            .iter()
            .enumerate()
            .map(|(i, s)| (s.key.as_str(), i))
            .collect();

        let mut graph = Self {
            in_degree: vec![0; sources.len()],
            dependents: vec![Vec::new(); sources.len()],
            inputs: vec![Vec::new(); sources.len()],
        };

        for (i, source) in sources.iter().enumerate() {
            let inputs: BTreeSet<usize> = source
                .kind
                .references()
                .into_iter()
                .filter_map(|reference| index.get(reference).copied())
                .collect();
            for input in inputs {
                graph.in_degree[i] += 1;
                graph.dependents[input].push(i);
                graph.inputs[i].push(input);
            }
        }
        graph
    }

    /// Kahn's algorithm; the sources left over form at least one cycle
    fn find_cycle(&self) -> Option<Vec<usize>> {
        let mut in_degree = self.in_degree.clone();
        let mut ready: Vec<usize> = (0..in_degree.len()).filter(|&i| in_degree[i] == 0).collect();
        let mut visited = 0;

        while let Some(node) = ready.pop() {
            visited += 1;
            for &dependent in &self.dependents[node] {
                in_degree[dependent] -= 1;
                if in_degree[dependent] == 0 {
                    ready.push(dependent);
                }
            }
        }

        if visited == in_degree.len() {
            return None;
        }

        // walk inputs among the leftovers until a node repeats
        let start = (0..in_degree.len()).find(|&i| in_degree[i] > 0)?;
        let mut path = vec![start];
        let mut node = start;
        loop {
            node = *self.inputs[node].iter().find(|&&i| in_degree[i] > 0)?;
            if let Some(position) = path.iter().position(|&n| n == node) {
                let mut cycle = path.split_off(position);
                cycle.push(node);
                return Some(cycle);
            }
            path.push(node);
        }
    }
}

/// State of one job resolution
struct Run<'r> {
    resolver: &'r SourceResolver,
    sources: &'r [Source],
    graph: DependencyGraph,
    resolved: ResolvedSources,
    in_flight: BTreeSet<usize>,
}

impl Run<'_> {
    async fn execute(&mut self) {
        let mut ready: BTreeSet<usize> = (0..self.sources.len())
            .filter(|&i| self.graph.in_degree[i] == 0)
            .collect();
        let mut tasks: JoinSet<(usize, SourceOutcome)> = JoinSet::new();

        loop {
            while let Some(index) = ready.pop_first() {
                if self.resolver.cancel.is_cancelled() {
                    debug!("cancelled, {} source(s) not scheduled", ready.len() + 1);
                    self.resolved.cancelled = true;
                    ready.clear();
                    break;
                }

                let sources = self.sources;
                let source = &sources[index];
                match internal::execute(
                    &source.key,
                    &source.kind,
                    &self.resolved.tables,
                    &mut self.resolved.diagnostics,
                ) {
                    Some(table) => {
                        let outcome = SourceOutcome {
                            table,
                            diagnostic: None,
                        };
                        ready.extend(self.complete(index, outcome));
                    }
                    None => {
                        self.spawn(&mut tasks, index);
                    }
                }
            }

            if tasks.is_empty() {
                if self.in_flight.is_empty() {
                    break;
                }
                // tasks that panicked never reported back
                for index in std::mem::take(&mut self.in_flight) {
                    let outcome = SourceOutcome {
                        table: SourceTable::empty(),
                        diagnostic: Some(Diagnostic::execution(
                            format!("source({})", self.sources[index].key),
                            "source task panicked",
                        )),
                    };
                    ready.extend(self.complete(index, outcome));
                }
                continue;
            }

            // in-flight calls always run to completion or to their timeout
            match tasks.join_next().await {
                Some(Ok((index, outcome))) => {
                    self.in_flight.remove(&index);
                    ready.extend(self.complete(index, outcome));
                }
                Some(Err(e)) => error!("source task failed: {e}"),
                None => {}
            }
        }
    }

    fn spawn(&mut self, tasks: &mut JoinSet<(usize, SourceOutcome)>, index: usize) {
        let source = self.sources[index].clone();
        let resolver = self.resolver;
        let registry = resolver.registry.clone();
        let host = resolver.host.clone();
        let connector_id = resolver.connector.id.clone();
        let permits = resolver.permits.clone();
        let lane = resolver.lane.clone();
        let timeout = host.source_timeout(&source);

        trace!("scheduling {} source {}", source.source_type(), source.key);
        self.in_flight.insert(index);
        tasks.spawn(async move {
            // a closed semaphore only means no limit is enforced anymore
            let _permit = permits.acquire_owned().await.ok();
            let outcome = if source.force_serialization {
                let _exclusive = lane.write().await;
                registry
                    .execute_source(&source, &connector_id, &host, timeout)
                    .await
            } else {
                let _shared = lane.read().await;
                registry
                    .execute_source(&source, &connector_id, &host, timeout)
                    .await
            };
            (index, outcome)
        });
    }

    /// Apply the source's computes, store the table and return newly ready sources
    fn complete(&mut self, index: usize, outcome: SourceOutcome) -> Vec<usize> {
        let sources = self.sources;
        let source = &sources[index];
        let resolver = self.resolver;
        let label = format!("source({})", source.key);

        if let Some(diagnostic) = outcome.diagnostic {
            self.resolved.diagnostics.push(diagnostic);
        }

        let context = ComputeContext::new(&resolver.connector.translation_tables)
            .with_policy(resolver.host.data_error_policy);
        let computed = apply_computes(outcome.table, &source.computes, &context);
        for diagnostic in computed.diagnostics {
            warn!("{}: {}", label, diagnostic);
            self.resolved.diagnostics.push(diagnostic.within(&label));
        }
        trace!("{label}: {} row(s)", computed.table.row_count());
        self.resolved.tables.insert(source.key.clone(), computed.table);

        let mut newly_ready = Vec::new();
        for &dependent in &self.graph.dependents[index] {
            self.graph.in_degree[dependent] -= 1;
            if self.graph.in_degree[dependent] == 0 {
                newly_ready.push(dependent);
            }
        }
        newly_ready
    }
}

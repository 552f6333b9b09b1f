//! HostMonitorActor - runs the monitoring cycles of one host
//!
//! ## Message Flow
//!
//! ```text
//! Timer tick → HostCycle::run(store) → Publish CycleEvent → [exporters, ...]
//!     ↑
//!     └─── Commands (RunCycle, GetMonitors, MonitorCount, UpdateInterval, Shutdown)
//! ```
//!
//! Commands are handled between cycles. Cancellation is the exception: the
//! handle flips the cycle's shared flag directly, so a busy cycle sees it at
//! its next checkpoint.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::interval;
use tracing::{debug, instrument, trace, warn};

use crate::config::HostConfiguration;
use crate::connector::Connector;
use crate::extension::ExtensionRegistry;
use crate::resolver::CancellationFlag;
use crate::strategy::{CycleReport, HostCycle};
use crate::telemetry::{Monitor, TelemetryStore};

use super::messages::{CycleEvent, HostCommand};

/// Actor owning the telemetry store of a single host
pub struct HostMonitorActor {
    cycle: HostCycle,

    store: TelemetryStore,

    command_rx: mpsc::Receiver<HostCommand>,

    event_tx: broadcast::Sender<CycleEvent>,

    interval_duration: Duration,
}

impl HostMonitorActor {
    pub fn new(
        cycle: HostCycle,
        command_rx: mpsc::Receiver<HostCommand>,
        event_tx: broadcast::Sender<CycleEvent>,
    ) -> Self {
        let host = cycle.host();
        let store = TelemetryStore::new(host.hostname.clone());
        let interval_duration = Duration::from_secs(host.collect_interval.max(1));
        Self {
            cycle,
            store,
            command_rx,
            event_tx,
            interval_duration,
        }
    }

    /// Run until a Shutdown command arrives or every handle is dropped
    #[instrument(skip(self), fields(host = %self.store.hostname()))]
    pub async fn run(mut self) {
        debug!("starting host actor");

        let mut ticker = interval(self.interval_duration);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.run_cycle().await;
                }

                Some(cmd) = self.command_rx.recv() => {
                    match cmd {
                        HostCommand::RunCycle { respond_to } => {
                            debug!("received RunCycle command");
                            let report = self.run_cycle().await;
                            let _ = respond_to.send(report);
                        }

                        HostCommand::GetMonitors { monitor_type, respond_to } => {
                            let _ = respond_to.send(self.store.snapshot(monitor_type.as_deref()));
                        }

                        HostCommand::MonitorCount { respond_to } => {
                            let _ = respond_to.send(self.store.monitor_count());
                        }

                        HostCommand::UpdateInterval { interval_secs } => {
                            debug!("updating interval to {interval_secs}s");
                            self.interval_duration = Duration::from_secs(interval_secs.max(1));
                            ticker = interval(self.interval_duration);
                        }

                        HostCommand::Shutdown => {
                            debug!("received shutdown command");
                            break;
                        }
                    }
                }

                else => {
                    warn!("command channel closed, shutting down");
                    break;
                }
            }
        }

        debug!("host actor stopped");
    }

    async fn run_cycle(&mut self) -> CycleReport {
        self.cycle.cancellation().reset();
        let report = self.cycle.run(&mut self.store).await;

        let event = CycleEvent {
            hostname: report.hostname.clone(),
            report: report.clone(),
            timestamp: Utc::now(),
        };
        match self.event_tx.send(event) {
            Ok(receivers) => trace!("published cycle event to {receivers} receivers"),
            Err(_) => trace!("no receivers for cycle event"),
        }
        report
    }
}

/// Handle for controlling a HostMonitorActor
///
/// Cheap to clone; every clone talks to the same actor.
#[derive(Clone)]
pub struct HostHandle {
    sender: mpsc::Sender<HostCommand>,

    cancel: CancellationFlag,

    pub hostname: String,
}

impl HostHandle {
    /// Spawn the actor of a host
    ///
    /// Connectors the host does not select are ignored. The first cycle starts
    /// right away, the next ones every `collect_interval` seconds.
    pub fn spawn(
        host: HostConfiguration,
        connectors: &[Arc<Connector>],
        registry: Arc<ExtensionRegistry>,
        event_tx: broadcast::Sender<CycleEvent>,
    ) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(32);

        let hostname = host.hostname.clone();
        let cancel = CancellationFlag::new();
        let cycle = HostCycle::new(Arc::new(host), connectors, registry).with_cancellation(cancel.clone());

        let actor = HostMonitorActor::new(cycle, cmd_rx, event_tx);
        tokio::spawn(actor.run());

        Self {
            sender: cmd_tx,
            cancel,
            hostname,
        }
    }

    /// Run a cycle now and wait for its report
    pub async fn run_cycle(&self) -> Result<CycleReport> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(HostCommand::RunCycle { respond_to: tx })
            .await
            .context("failed to send RunCycle command")?;

        rx.await.context("failed to receive response")
    }

    /// Snapshot of the host's monitors, optionally of a single type
    pub async fn monitors(&self, monitor_type: Option<&str>) -> Result<Vec<Monitor>> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(HostCommand::GetMonitors {
                monitor_type: monitor_type.map(str::to_string),
                respond_to: tx,
            })
            .await
            .context("failed to send GetMonitors command")?;

        rx.await.context("failed to receive response")
    }

    pub async fn monitor_count(&self) -> Result<usize> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(HostCommand::MonitorCount { respond_to: tx })
            .await
            .context("failed to send MonitorCount command")?;

        rx.await.context("failed to receive response")
    }

    /// Update the collect interval
    pub async fn update_interval(&self, interval_secs: u64) -> Result<()> {
        self.sender
            .send(HostCommand::UpdateInterval { interval_secs })
            .await
            .context("failed to send UpdateInterval command")?;
        Ok(())
    }

    /// Ask the running cycle, if any, to stop at its next checkpoint
    pub fn cancel_cycle(&self) {
        debug!("cancelling cycle of {}", self.hostname);
        self.cancel.cancel();
    }

    /// Gracefully shut down the actor
    pub async fn shutdown(&self) -> Result<()> {
        self.sender
            .send(HostCommand::Shutdown)
            .await
            .context("failed to send Shutdown command")?;
        Ok(())
    }
}

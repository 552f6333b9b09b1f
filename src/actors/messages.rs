//! Message types for the host actors
//!
//! Commands travel over a host's mpsc channel, replies over oneshot channels.
//! Finished cycles are broadcast as [`CycleEvent`]s to whoever subscribed.

use chrono::{DateTime, Utc};
use tokio::sync::oneshot;

use crate::strategy::CycleReport;
use crate::telemetry::Monitor;

/// Event published when a host finished a cycle
///
/// Slow subscribers may lag and miss events; the store of the host remains
/// the source of truth.
#[derive(Debug, Clone)]
pub struct CycleEvent {
    pub hostname: String,

    pub report: CycleReport,

    /// When the cycle finished
    pub timestamp: DateTime<Utc>,
}

/// Commands that can be sent to a HostMonitorActor
#[derive(Debug)]
pub enum HostCommand {
    /// Run a cycle now, bypassing the interval timer
    RunCycle {
        respond_to: oneshot::Sender<CycleReport>,
    },

    /// Snapshot of the monitors of one type, or of every monitor
    GetMonitors {
        monitor_type: Option<String>,
        respond_to: oneshot::Sender<Vec<Monitor>>,
    },

    MonitorCount {
        respond_to: oneshot::Sender<usize>,
    },

    /// Change the collect interval
    ///
    /// The timer restarts, so the next cycle runs right away.
    UpdateInterval {
        /// New interval in seconds
        interval_secs: u64,
    },

    /// Stop the actor once the current cycle (if any) is over
    Shutdown,
}

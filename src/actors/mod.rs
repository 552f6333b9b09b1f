//! Host actors
//!
//! Every monitored host gets one actor that owns its [`TelemetryStore`] and
//! runs its cycles. Nothing else ever touches that store: exporters ask the
//! actor for a snapshot.
//!
//! ```text
//!        ┌─────────────────┐
//!        │   Hub (main)    │
//!        └────────┬────────┘
//!                 │ spawns one per host
//!        ┌────────┴────────┐
//!        │                 │
//! ┌──────▼───────┐  ┌──────▼───────┐
//! │ HostMonitor  │  │ HostMonitor  │   Commands (RunCycle, GetMonitors,
//! │ (host A)     │  │ (host N)     │   MonitorCount, UpdateInterval, Shutdown)
//! └──────┬───────┘  └──────┬───────┘
//!        │                 │
//!        └────────┬────────┘
//!                 │ CycleEvent
//!       ┌─────────▼──────────┐
//!       │ Broadcast Channel  │
//!       └────────────────────┘
//! ```
//!
//! [`TelemetryStore`]: crate::telemetry::TelemetryStore

pub mod host;
pub mod messages;

pub use host::{HostHandle, HostMonitorActor};
pub use messages::{CycleEvent, HostCommand};

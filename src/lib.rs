//! Connector-driven hardware monitoring engine
//!
//! A [`Connector`](connector::Connector) describes one class of device: the
//! criteria telling whether it applies to a host, and for every monitor type
//! the sources to query and how their rows map to monitors and metrics. The
//! engine runs these descriptions against each configured host:
//!
//! ```text
//! HostHandle ─► HostCycle::run ─► Detection ─► Discovery ─► Collect ─► post-processing
//!                                     │             │           │
//!                                     └─────────────┴───────────┴─► SourceResolver
//!                                                                       │
//!                                                  ExtensionRegistry ◄──┤ protocol sources
//!                                                  compute pipeline  ◄──┘ every table
//! ```
//!
//! Results land in the host's [`TelemetryStore`](telemetry::TelemetryStore),
//! which exporters read through the actor handle.

pub mod actors;
pub mod compute;
pub mod config;
pub mod connector;
pub mod error;
pub mod extension;
pub mod resolver;
pub mod strategy;
pub mod table;
pub mod telemetry;

pub use error::{Diagnostic, DiagnosticKind, EngineError, EngineResult};
pub use strategy::{CycleReport, HostCycle};
pub use table::SourceTable;
pub use telemetry::TelemetryStore;

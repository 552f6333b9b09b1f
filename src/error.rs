//! Error and diagnostic types for the execution engine
//!
//! Two layers live here:
//!
//! - [`EngineError`]: typed failures returned by fallible library calls (protocol
//!   execution, source dependency resolution, I/O). These never escape a Source,
//!   Criterion or Compute boundary; the registry and the strategies turn them into
//!   diagnostics.
//! - [`Diagnostic`]: the warning record attached to every report, classified the way
//!   the strategies react to it.

use std::fmt;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;

/// Result type alias for engine operations
pub type EngineResult<T> = Result<T, EngineError>;

/// Errors that can occur while executing sources, criteria or monitor jobs
#[derive(Debug, Error)]
pub enum EngineError {
    /// Sources of one job reference each other in a loop
    #[error("cyclic source dependency in {job}: {}", .sources.join(" -> "))]
    CyclicDependency { job: String, sources: Vec<String> },

    /// The mapping reads a key column the resolved table does not have
    #[error("instance key '{key}' reads column {column} missing from source {source_key}")]
    MissingKeyColumn {
        key: String,
        column: usize,
        source_key: String,
    },

    /// A protocol call did not answer in time
    #[error("{operation} timed out after {timeout:?}")]
    Timeout {
        operation: String,
        timeout: Duration,
    },

    /// The host has no usable configuration for the protocol
    #[error("no valid '{0}' configuration for this host")]
    MissingConfiguration(String),

    /// The extension received a source or criterion variant it does not handle
    #[error("{extension} does not support {variant}")]
    Unsupported {
        extension: &'static str,
        variant: String,
    },

    /// Protocol-level failure reported by an extension
    #[error("protocol error: {0}")]
    Protocol(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Http(#[from] reqwest::Error),

    #[error(transparent)]
    Url(#[from] url::ParseError),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[cfg(feature = "sql")]
    #[error(transparent)]
    Sql(#[from] sqlx::Error),
}

/// How the strategies react to a recorded problem
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DiagnosticKind {
    /// Malformed cell, out-of-range column, unresolvable translation key
    Data,

    /// Network failure, timeout, unsupported configuration
    Execution,

    /// Cyclic dependency or missing key column; the monitor job is skipped
    Structural,
}

/// A warning recorded during a cycle
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Diagnostic {
    pub kind: DiagnosticKind,

    /// Where it happened, e.g. `"disk.discovery.source(2).compute(1)"`
    pub context: String,

    pub message: String,
}

impl Diagnostic {
    pub fn data(context: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: DiagnosticKind::Data,
            context: context.into(),
            message: message.into(),
        }
    }

    pub fn execution(context: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: DiagnosticKind::Execution,
            context: context.into(),
            message: message.into(),
        }
    }

    pub fn structural(context: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: DiagnosticKind::Structural,
            context: context.into(),
            message: message.into(),
        }
    }

    /// Prefix the context, used when a lower layer's diagnostics bubble up
    pub fn within(mut self, outer: &str) -> Self {
        if !outer.is_empty() {
            self.context = format!("{outer}.{}", self.context);
        }
        self
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{:?}] {}: {}", self.kind, self.context, self.message)
    }
}

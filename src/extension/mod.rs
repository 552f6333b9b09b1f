//! Protocol Extension Registry
//!
//! Protocol executors are pluggable: each one implements [`ProtocolExtension`]
//! and declares which source and criterion variants it handles. The registry is
//! built once at start-up and shared read-only as `Arc<ExtensionRegistry>`.
//!
//! ## Lookup
//!
//! ```text
//! source / criterion tag ─► extensions with a valid configuration on the host
//!                               │
//!                               └─► first one whose supported set has the tag
//! ```
//!
//! No extension, or no configuration on the host, gives an empty table (or a
//! failed criterion) logged at debug level.
//!
//! ## Isolation
//!
//! Extensions return [`EngineResult`]; the registry wraps every call in a timeout
//! and turns errors into values so nothing escapes a Source or Criterion.

mod http;
mod os_command;
#[cfg(feature = "sql")]
mod sql;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use regex::RegexBuilder;
use serde::Serialize;
use futures::future::join_all;
use tracing::{debug, trace, warn};

use crate::config::HostConfiguration;
use crate::connector::{Criterion, CriterionType, Source, SourceType};
use crate::error::{Diagnostic, EngineResult};
use crate::table::SourceTable;

pub use http::HttpExtension;
pub use os_command::OsCommandExtension;
#[cfg(feature = "sql")]
pub use sql::SqlExtension;

/// Outcome of one detection criterion
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CriterionTestResult {
    pub success: bool,

    /// Human-readable trace, copied to the connector monitor
    pub message: String,

    /// Raw protocol answer, if any
    pub result: Option<String>,
}

impl CriterionTestResult {
    pub fn success(message: impl Into<String>, result: Option<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
            result,
        }
    }

    pub fn failure(message: impl Into<String>, result: Option<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
            result,
        }
    }

    /// Test a protocol answer against the criterion's expected result
    ///
    /// Without an expected result any answer passes. The expected result is a
    /// case-insensitive regular expression searched anywhere in the answer.
    pub fn from_output(
        description: &str,
        output: impl Into<String>,
        expected_result: Option<&str>,
    ) -> Self {
        let output = output.into();
        match check_expected_result(&output, expected_result) {
            Ok(true) => Self::success(
                format!("{description} succeeded. Result: {}", output.trim()),
                Some(output),
            ),
            Ok(false) => Self::failure(
                format!(
                    "{description} ran but the result did not match '{}'. Result: {}",
                    expected_result.unwrap_or_default(),
                    output.trim()
                ),
                Some(output),
            ),
            Err(e) => Self::failure(format!("{description}: {e}"), Some(output)),
        }
    }
}

/// Case-insensitive search of `expected` in `output`
pub fn check_expected_result(output: &str, expected: Option<&str>) -> Result<bool, regex::Error> {
    let Some(expected) = expected.filter(|e| !e.is_empty()) else {
        return Ok(true);
    };
    let re = RegexBuilder::new(expected)
        .case_insensitive(true)
        .multi_line(true)
        .build()?;
    Ok(re.is_match(output))
}

/// Executor for one family of protocols
#[async_trait]
pub trait ProtocolExtension: Send + Sync {
    /// Short name used in logs
    fn identifier(&self) -> &'static str;

    /// Whether the host's configuration for `protocol` is usable by this extension
    fn is_valid_configuration(&self, protocol: &str, configuration: &serde_json::Value) -> bool;

    fn supported_sources(&self) -> &[SourceType];

    fn supported_criteria(&self) -> &[CriterionType];

    async fn process_source(
        &self,
        source: &Source,
        connector_id: &str,
        host: &HostConfiguration,
    ) -> EngineResult<SourceTable>;

    async fn process_criterion(
        &self,
        criterion: &Criterion,
        connector_id: &str,
        host: &HostConfiguration,
    ) -> CriterionTestResult;

    /// Whether the host answers on this protocol; `None` when the extension has no check
    async fn health_check(&self, _host: &HostConfiguration) -> Option<bool> {
        None
    }
}

/// Result of running one source through the registry
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SourceOutcome {
    pub table: SourceTable,

    /// Set when the source failed, timed out or had no executor
    pub diagnostic: Option<Diagnostic>,
}

/// Read-only set of protocol extensions
#[derive(Clone, Default)]
pub struct ExtensionRegistry {
    extensions: Vec<Arc<dyn ProtocolExtension>>,
}

impl std::fmt::Debug for ExtensionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.extensions.iter().map(|e| e.identifier()))
            .finish()
    }
}

impl ExtensionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding the built-in extensions
    pub fn with_defaults() -> Self {
        let registry = Self::new()
            .register(OsCommandExtension)
            .register(HttpExtension::new());
        #[cfg(feature = "sql")]
        let registry = registry.register(SqlExtension::new());
        registry
    }

    /// Add an extension; earlier registrations win lookups
    #[must_use]
    pub fn register(mut self, extension: impl ProtocolExtension + 'static) -> Self {
        self.extensions.push(Arc::new(extension));
        self
    }

    pub fn len(&self) -> usize {
        self.extensions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.extensions.is_empty()
    }

    fn configured_on<'a>(
        &'a self,
        host: &'a HostConfiguration,
    ) -> impl Iterator<Item = &'a Arc<dyn ProtocolExtension>> + 'a {
        self.extensions.iter().filter(move |extension| {
            host.protocols
                .iter()
                .any(|(name, config)| extension.is_valid_configuration(name, config))
        })
    }

    pub fn find_source_extension(
        &self,
        source_type: SourceType,
        host: &HostConfiguration,
    ) -> Option<Arc<dyn ProtocolExtension>> {
        self.configured_on(host)
            .find(|e| e.supported_sources().contains(&source_type))
            .cloned()
    }

    pub fn find_criterion_extension(
        &self,
        criterion_type: CriterionType,
        host: &HostConfiguration,
    ) -> Option<Arc<dyn ProtocolExtension>> {
        self.configured_on(host)
            .find(|e| e.supported_criteria().contains(&criterion_type))
            .cloned()
    }

    /// Health of every protocol configured on the host, by extension identifier
    ///
    /// Extensions without a check are left out. A check that does not answer in
    /// time counts as down.
    pub async fn check_protocols(
        &self,
        host: &HostConfiguration,
        timeout: Duration,
    ) -> Vec<(&'static str, bool)> {
        let checks = self.configured_on(host).map(|extension| async move {
            let up = match tokio::time::timeout(timeout, extension.health_check(host)).await {
                Ok(up) => up?,
                Err(_) => {
                    warn!(host = %host.hostname, "{} health check timed out", extension.identifier());
                    false
                }
            };
            Some((extension.identifier(), up))
        });
        join_all(checks).await.into_iter().flatten().collect()
    }

    /// Run a protocol source; never fails
    ///
    /// A missing executor yields an empty table without diagnostic. Errors and
    /// timeouts yield an empty table and an execution diagnostic.
    pub async fn execute_source(
        &self,
        source: &Source,
        connector_id: &str,
        host: &HostConfiguration,
        timeout: Duration,
    ) -> SourceOutcome {
        let source_type = source.source_type();
        let Some(extension) = self.find_source_extension(source_type, host) else {
            debug!(
                "no extension configured for {source_type} source {} on {}",
                source.key, host.hostname
            );
            return SourceOutcome::default();
        };

        let call = extension.process_source(source, connector_id, host);
        let message = match tokio::time::timeout(timeout, call).await {
            Ok(Ok(mut table)) => {
                if !table.is_rectangular() {
                    trace!("padding ragged {} output of {}", source_type, source.key);
                    table.pad_rows();
                }
                return SourceOutcome {
                    table,
                    diagnostic: None,
                };
            }
            Ok(Err(e)) => format!("{} failed: {e}", extension.identifier()),
            Err(_) => format!("{} timed out after {timeout:?}", extension.identifier()),
        };

        warn!(host = %host.hostname, "source {}: {message}", source.key);
        SourceOutcome {
            table: SourceTable::empty(),
            diagnostic: Some(Diagnostic::execution(
                format!("source({})", source.key),
                message,
            )),
        }
    }

    /// Run a detection criterion; errors and timeouts are failed results
    pub async fn execute_criterion(
        &self,
        criterion: &Criterion,
        connector_id: &str,
        host: &HostConfiguration,
        timeout: Duration,
    ) -> CriterionTestResult {
        let criterion_type = criterion.criterion_type();
        let Some(extension) = self.find_criterion_extension(criterion_type, host) else {
            debug!(
                "no extension configured for {criterion_type} criterion on {}",
                host.hostname
            );
            return CriterionTestResult::failure(
                format!("no protocol configured on {} for {criterion_type}", host.hostname),
                None,
            );
        };

        let call = extension.process_criterion(criterion, connector_id, host);
        match tokio::time::timeout(timeout, call).await {
            Ok(result) => result,
            Err(_) => {
                warn!(host = %host.hostname, "{criterion_type} criterion timed out");
                CriterionTestResult::failure(
                    format!(
                        "{} {criterion_type} criterion timed out after {timeout:?}",
                        extension.identifier()
                    ),
                    None,
                )
            }
        }
    }
}

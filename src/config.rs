use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use tracing::trace;

use crate::compute::DataErrorPolicy;
use crate::connector::{Connector, DeviceKind, Source};

/// Hub configuration: the hosts to monitor and the connector files to load
#[derive(Debug, Clone, serde::Deserialize)]
pub struct Config {
    #[serde(default)]
    pub hosts: Vec<HostConfiguration>,

    /// JSON connector models, loaded with [`load_connector_file`]
    #[serde(default)]
    pub connectors: Vec<PathBuf>,
}

/// Per-host settings read by the strategies, the resolver and the extensions
#[derive(Debug, Clone, serde::Deserialize)]
pub struct HostConfiguration {
    pub hostname: String,

    /// Id of the endpoint host monitor, the hostname when unset
    #[serde(default)]
    pub host_id: Option<String>,

    #[serde(default)]
    pub host_type: DeviceKind,

    /// One source, one connector at a time
    #[serde(default)]
    pub sequential: bool,

    /// Default protocol timeout of sources and criteria, in seconds
    #[serde(default = "default_strategy_timeout")]
    pub strategy_timeout: u64,

    /// Upper bound of each cycle phase, in seconds
    #[serde(default = "default_phase_timeout")]
    pub phase_timeout: u64,

    #[serde(default = "default_max_parallel_sources")]
    pub max_parallel_sources: usize,

    /// Seconds between two cycles
    #[serde(default = "default_collect_interval")]
    pub collect_interval: u64,

    /// Protocol name -> opaque configuration decoded by the matching extension
    #[serde(default)]
    pub protocols: BTreeMap<String, serde_json::Value>,

    /// Connector ids to consider; all loaded connectors when empty
    #[serde(default)]
    pub connectors: Vec<String>,

    #[serde(default)]
    pub data_error_policy: DataErrorPolicy,
}

fn default_strategy_timeout() -> u64 {
    120
}

fn default_phase_timeout() -> u64 {
    300
}

fn default_max_parallel_sources() -> usize {
    20
}

fn default_collect_interval() -> u64 {
    120
}

impl HostConfiguration {
    pub fn new(hostname: impl Into<String>) -> Self {
        Self {
            hostname: hostname.into(),
            host_id: None,
            host_type: DeviceKind::default(),
            sequential: false,
            strategy_timeout: default_strategy_timeout(),
            phase_timeout: default_phase_timeout(),
            max_parallel_sources: default_max_parallel_sources(),
            collect_interval: default_collect_interval(),
            protocols: BTreeMap::new(),
            connectors: Vec::new(),
            data_error_policy: DataErrorPolicy::default(),
        }
    }

    #[must_use]
    pub fn with_protocol(mut self, name: &str, configuration: serde_json::Value) -> Self {
        self.protocols.insert(name.to_string(), configuration);
        self
    }

    /// Id of the monitor standing for this host
    pub fn host_id(&self) -> &str {
        self.host_id.as_deref().unwrap_or(&self.hostname)
    }

    pub fn protocol(&self, name: &str) -> Option<&serde_json::Value> {
        self.protocols.get(name)
    }

    pub fn strategy_timeout(&self) -> Duration {
        Duration::from_secs(self.strategy_timeout)
    }

    /// Bound of one cycle phase, at least twice the strategy timeout
    pub fn phase_timeout(&self) -> Duration {
        Duration::from_secs(self.phase_timeout.max(self.strategy_timeout.saturating_mul(2)))
    }

    /// Timeout of one protocol call for a source
    pub fn source_timeout(&self, source: &Source) -> Duration {
        source
            .timeout
            .map(Duration::from_secs)
            .unwrap_or_else(|| self.strategy_timeout())
    }

    /// Number of sources that may run at once
    pub fn source_parallelism(&self) -> usize {
        if self.sequential {
            1
        } else {
            self.max_parallel_sources.max(1)
        }
    }

    /// Whether a connector is selected for this host
    pub fn selects(&self, connector_id: &str) -> bool {
        self.connectors.is_empty() || self.connectors.iter().any(|c| c == connector_id)
    }
}

pub fn read_config_file(path: impl AsRef<Path>) -> anyhow::Result<Config> {
    let path = path.as_ref();
    let file_content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    serde_json::from_str(&file_content)
        .with_context(|| format!("invalid configuration file {}", path.display()))
        .inspect(|config| trace!("loaded config: {config:?}"))
}

/// Load a connector model serialized as JSON
pub fn load_connector_file(path: impl AsRef<Path>) -> anyhow::Result<Connector> {
    let path = path.as_ref();
    let file_content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read connector {}", path.display()))?;
    serde_json::from_str(&file_content)
        .with_context(|| format!("invalid connector file {}", path.display()))
        .inspect(|connector: &Connector| trace!("loaded connector {}", connector.id))
}

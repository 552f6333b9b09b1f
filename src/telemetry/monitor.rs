//! Monitor and Metric entities

use std::collections::BTreeMap;
use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::Serialize;

/// Attribute naming the connector that discovered a monitor
pub const CONNECTOR_ID_ATTRIBUTE: &str = "connector_id";

/// Type of the synthetic monitor recording detection results
pub const CONNECTOR_MONITOR_TYPE: &str = "connector";

/// Type of the monitor representing the polled host itself
pub const HOST_MONITOR_TYPE: &str = "host";

/// Stable monitor identifier
///
/// `{connector}_{type}_{key1}_{key2}...` with all whitespace removed. Identical
/// inputs always give the same identifier, which is what keeps repeated
/// discoveries from creating duplicates.
pub fn monitor_id(connector_id: &str, monitor_type: &str, key_values: &[&str]) -> String {
    let mut id = format!("{connector_id}_{monitor_type}");
    for value in key_values {
        id.push('_');
        id.push_str(value);
    }
    id.retain(|c| !c.is_whitespace());
    id
}

/// Name of the presence metric of a monitor type
pub fn present_metric_name(monitor_type: &str) -> String {
    format!("hw.status{{hw.type=\"{monitor_type}\", state=\"present\"}}")
}

static METRIC_ATTRIBUTE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"([\w.]+)\s*=\s*"([^"]*)""#).expect("metric attribute pattern is valid")
});

/// Attributes embedded in a metric name: `hw.power{hw.type="fan"}`
pub fn metric_attributes(name: &str) -> BTreeMap<String, String> {
    let Some((_, block)) = name.split_once('{') else {
        return BTreeMap::new();
    };
    METRIC_ATTRIBUTE
        .captures_iter(block)
        .map(|caps| (caps[1].to_string(), caps[2].to_string()))
        .collect()
}

/// One named measurement owned by a monitor
///
/// Overwritten on every pass that produces a value; no history is kept.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Metric {
    Number {
        value: f64,
        unit: Option<String>,
        collect_time: DateTime<Utc>,
        attributes: BTreeMap<String, String>,
    },
    StateSet {
        value: String,
        possible_states: Vec<String>,
        collect_time: DateTime<Utc>,
        attributes: BTreeMap<String, String>,
    },
}

impl Metric {
    pub fn number(value: f64, collect_time: DateTime<Utc>) -> Self {
        Metric::Number {
            value,
            unit: None,
            collect_time,
            attributes: BTreeMap::new(),
        }
    }

    pub fn state_set(
        value: impl Into<String>,
        possible_states: Vec<String>,
        collect_time: DateTime<Utc>,
    ) -> Self {
        Metric::StateSet {
            value: value.into(),
            possible_states,
            collect_time,
            attributes: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn with_unit(mut self, new_unit: Option<String>) -> Self {
        if let Metric::Number { unit, .. } = &mut self {
            *unit = new_unit;
        }
        self
    }

    #[must_use]
    pub fn with_attributes(mut self, new_attributes: BTreeMap<String, String>) -> Self {
        match &mut self {
            Metric::Number { attributes, .. } | Metric::StateSet { attributes, .. } => {
                *attributes = new_attributes
            }
        }
        self
    }

    pub fn collect_time(&self) -> DateTime<Utc> {
        match self {
            Metric::Number { collect_time, .. } | Metric::StateSet { collect_time, .. } => {
                *collect_time
            }
        }
    }

    pub fn attributes(&self) -> &BTreeMap<String, String> {
        match self {
            Metric::Number { attributes, .. } | Metric::StateSet { attributes, .. } => attributes,
        }
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            Metric::Number { value, .. } => Some(*value),
            Metric::StateSet { .. } => None,
        }
    }

    pub fn as_state(&self) -> Option<&str> {
        match self {
            Metric::StateSet { value, .. } => Some(value),
            Metric::Number { .. } => None,
        }
    }
}

/// A discovered hardware or software instance
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Monitor {
    pub(crate) id: String,
    pub(crate) monitor_type: String,
    pub(crate) parent_id: Option<String>,
    pub(crate) attributes: BTreeMap<String, String>,
    pub(crate) metrics: BTreeMap<String, Metric>,
    pub(crate) present: bool,
    pub(crate) discovery_time: Option<DateTime<Utc>>,
}

impl Monitor {
    /// A new monitor starts not present until a discovery pass marks it
    pub fn new(monitor_type: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            monitor_type: monitor_type.into(),
            parent_id: None,
            attributes: BTreeMap::new(),
            metrics: BTreeMap::new(),
            present: false,
            discovery_time: None,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn monitor_type(&self) -> &str {
        &self.monitor_type
    }

    pub fn parent_id(&self) -> Option<&str> {
        self.parent_id.as_deref()
    }

    pub fn attributes(&self) -> &BTreeMap<String, String> {
        &self.attributes
    }

    pub fn attribute(&self, name: &str) -> Option<&str> {
        self.attributes.get(name).map(String::as_str)
    }

    pub fn metrics(&self) -> &BTreeMap<String, Metric> {
        &self.metrics
    }

    pub fn metric(&self, name: &str) -> Option<&Metric> {
        self.metrics.get(name)
    }

    pub fn number_metric(&self, name: &str) -> Option<f64> {
        self.metric(name).and_then(Metric::as_number)
    }

    pub fn state_metric(&self, name: &str) -> Option<&str> {
        self.metric(name).and_then(Metric::as_state)
    }

    pub fn is_present(&self) -> bool {
        self.present
    }

    /// When the monitor was last seen by a discovery pass
    pub fn discovery_time(&self) -> Option<DateTime<Utc>> {
        self.discovery_time
    }

    pub fn connector_id(&self) -> Option<&str> {
        self.attribute(CONNECTOR_ID_ATTRIBUTE)
    }

    pub fn set_attribute(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.attributes.insert(name.into(), value.into());
    }

    pub fn set_parent_id(&mut self, parent_id: Option<String>) {
        self.parent_id = parent_id;
    }
}

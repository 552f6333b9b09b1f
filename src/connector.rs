//! In-memory Connector model
//!
//! A [`Connector`] describes how to detect, discover and collect one class of
//! device. The engine consumes it as an immutable object graph (shared as
//! `Arc<Connector>`); it never parses connector source text. The serde derives only
//! exist so a host process can hand over an already-compiled model as JSON.
//!
//! ## Shape
//!
//! ```text
//! Connector
//!  ├── detection: criteria (in order) + applicability policy
//!  ├── monitors: type -> { discovery: MonitorJob, collect: MonitorJob }
//!  │                        └── sources (in order) -> computes (in order)
//!  │                        └── mapping: source key, attribute/metric expressions
//!  ├── translation_tables: name -> TranslationTable (Arc, shared)
//!  └── metrics: metric name -> definition (unit, number | state set)
//! ```

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, LazyLock};

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::compute::Compute;

/// Declarative definition of one class of monitored device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Connector {
    pub id: String,

    #[serde(default)]
    pub display_name: Option<String>,

    #[serde(default)]
    pub detection: Detection,

    /// Jobs per monitor type
    #[serde(default)]
    pub monitors: BTreeMap<String, MonitorJobs>,

    #[serde(default)]
    pub translation_tables: BTreeMap<String, TranslationTable>,

    /// Metric definitions, keyed by metric name without attributes
    #[serde(default)]
    pub metrics: BTreeMap<String, MetricDefinition>,
}

impl Connector {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            display_name: None,
            detection: Detection::default(),
            monitors: BTreeMap::new(),
            translation_tables: BTreeMap::new(),
            metrics: BTreeMap::new(),
        }
    }

    pub fn display_name(&self) -> &str {
        self.display_name.as_deref().unwrap_or(&self.id)
    }

    /// Definition of a metric; `hw.power{hw.type="fan"}` resolves to `hw.power`
    pub fn metric_definition(&self, metric_name: &str) -> Option<&MetricDefinition> {
        self.metrics
            .get(metric_name)
            .or_else(|| self.metrics.get(base_metric_name(metric_name)))
    }

    pub fn discovery_job(&self, monitor_type: &str) -> Option<&MonitorJob> {
        self.monitors.get(monitor_type)?.discovery.as_ref()
    }

    pub fn collect_job(&self, monitor_type: &str) -> Option<&MonitorJob> {
        self.monitors.get(monitor_type)?.collect.as_ref()
    }
}

/// Name of a metric without its `{...}` attribute block
pub fn base_metric_name(name: &str) -> &str {
    name.split_once('{').map_or(name, |(base, _)| base).trim()
}

/// Detection block of a connector
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Detection {
    /// Tested in declaration order
    #[serde(default)]
    pub criteria: Vec<Criterion>,

    #[serde(default)]
    pub policy: ApplicabilityPolicy,

    /// Connector ids this connector replaces when both apply
    #[serde(default)]
    pub supersedes: Vec<String>,

    #[serde(default)]
    pub tags: Vec<String>,
}

/// When a connector counts as applicable
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApplicabilityPolicy {
    /// Every criterion must succeed
    #[default]
    All,

    /// A single succeeding criterion is enough
    Any,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MonitorJobs {
    #[serde(default)]
    pub discovery: Option<MonitorJob>,

    #[serde(default)]
    pub collect: Option<MonitorJob>,
}

/// The Discovery or Collect job for one monitor type
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MonitorJob {
    /// Executed in dependency order, declaration order breaks ties
    pub sources: Vec<Source>,

    pub mapping: Mapping,

    /// Attributes identifying an instance
    #[serde(default = "default_keys")]
    pub keys: Vec<String>,

    /// Only meaningful for collect jobs
    #[serde(default)]
    pub kind: JobKind,
}

fn default_keys() -> Vec<String> {
    vec!["id".to_string()]
}

impl MonitorJob {
    pub fn new(sources: Vec<Source>, mapping: Mapping) -> Self {
        Self {
            sources,
            mapping,
            keys: default_keys(),
            kind: JobKind::default(),
        }
    }

    #[must_use]
    pub fn with_keys(mut self, keys: &[&str]) -> Self {
        self.keys = keys.iter().map(|k| k.to_string()).collect();
        self
    }

    #[must_use]
    pub fn mono_instance(mut self) -> Self {
        self.kind = JobKind::MonoInstance;
        self
    }
}

/// How a collect job relates rows to monitors
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    /// Resolve once, match every row back to a monitor through its keys
    #[default]
    MultiInstance,

    /// Resolve once per monitor with `${attribute::name}` substituted
    MonoInstance,
}

/// Row-to-monitor mapping of a job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Mapping {
    /// Key of the source whose table is mapped
    pub source: String,

    #[serde(default)]
    pub attributes: BTreeMap<String, String>,

    #[serde(default)]
    pub metrics: BTreeMap<String, String>,
}

impl Mapping {
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            attributes: BTreeMap::new(),
            metrics: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn attribute(mut self, name: &str, expression: &str) -> Self {
        self.attributes
            .insert(name.to_string(), expression.to_string());
        self
    }

    #[must_use]
    pub fn metric(mut self, name: &str, expression: &str) -> Self {
        self.metrics.insert(name.to_string(), expression.to_string());
        self
    }
}

static COLUMN_REF: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\$(\d+)").expect("column reference pattern is valid"));

/// Column read by an expression made of a single `$n` reference
pub fn column_reference(expression: &str) -> Option<usize> {
    expression
        .trim()
        .strip_prefix('$')
        .and_then(|n| n.parse::<usize>().ok())
        .filter(|n| *n >= 1)
}

/// Evaluate a mapping expression against one row
///
/// A bare `$n` yields the cell (or `None` when the row is too short). Any other
/// expression is a template: each `$n` is replaced by its cell, or by an empty
/// string when the cell does not exist.
pub fn evaluate_expression(expression: &str, row: &[String]) -> Option<String> {
    if let Some(column) = column_reference(expression) {
        return row.get(column - 1).cloned();
    }

    let rendered = COLUMN_REF.replace_all(expression, |caps: &regex::Captures<'_>| {
        caps[1]
            .parse::<usize>()
            .ok()
            .and_then(|n| n.checked_sub(1))
            .and_then(|i| row.get(i))
            .cloned()
            .unwrap_or_default()
    });
    Some(rendered.into_owned())
}

/// Read-only, case-insensitive lookup table shared by reference
///
/// Cloning a `TranslationTable` clones the `Arc`, never the entries.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(
    from = "BTreeMap<String, String>",
    into = "BTreeMap<String, String>"
)]
pub struct TranslationTable(Arc<BTreeMap<String, String>>);

/// Fallback key of a translation table
pub const DEFAULT_TRANSLATION_KEY: &str = "default";

impl TranslationTable {
    /// Exact (case-insensitive) lookup, no fallback
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(&key.to_lowercase()).map(String::as_str)
    }

    /// Lookup falling back on the `default` entry
    pub fn translate(&self, key: &str) -> Option<&str> {
        self.get(key).or_else(|| self.get(DEFAULT_TRANSLATION_KEY))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// True when both handles point at the same entries
    pub fn shares_entries_with(&self, other: &TranslationTable) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl From<BTreeMap<String, String>> for TranslationTable {
    fn from(entries: BTreeMap<String, String>) -> Self {
        Self(Arc::new(
            entries
                .into_iter()
                .map(|(k, v)| (k.to_lowercase(), v))
                .collect(),
        ))
    }
}

impl<const N: usize> From<[(&str, &str); N]> for TranslationTable {
    fn from(entries: [(&str, &str); N]) -> Self {
        entries
            .into_iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect::<BTreeMap<_, _>>()
            .into()
    }
}

impl From<TranslationTable> for BTreeMap<String, String> {
    fn from(table: TranslationTable) -> Self {
        (*table.0).clone()
    }
}

/// Declared shape of a metric
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricDefinition {
    #[serde(default)]
    pub unit: Option<String>,

    #[serde(default)]
    pub description: Option<String>,

    #[serde(default)]
    pub kind: MetricKind,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MetricKind {
    #[default]
    Number,
    StateSet {
        states: Vec<String>,
    },
}

/// One declarative query of a monitor job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Source {
    /// Unique within the job; referenced by Copy/TableJoin/TableUnion and the mapping
    pub key: String,

    #[serde(flatten)]
    pub kind: SourceKind,

    /// Applied in declaration order after execution
    #[serde(default)]
    pub computes: Vec<Compute>,

    /// Never run concurrently with another source of the same connector
    #[serde(default)]
    pub force_serialization: bool,

    /// Per-source timeout in seconds, overriding the host strategy timeout
    #[serde(default)]
    pub timeout: Option<u64>,
}

impl Source {
    pub fn new(key: impl Into<String>, kind: SourceKind) -> Self {
        Self {
            key: key.into(),
            kind,
            computes: Vec::new(),
            force_serialization: false,
            timeout: None,
        }
    }

    #[must_use]
    pub fn with_computes(mut self, computes: Vec<Compute>) -> Self {
        self.computes = computes;
        self
    }

    #[must_use]
    pub fn serialized(mut self) -> Self {
        self.force_serialization = true;
        self
    }

    #[must_use]
    pub fn with_timeout(mut self, seconds: u64) -> Self {
        self.timeout = Some(seconds);
        self
    }

    pub fn source_type(&self) -> SourceType {
        self.kind.source_type()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    #[default]
    Get,
    Post,
    Put,
    Delete,
}

impl HttpMethod {
    pub fn as_reqwest(self) -> reqwest::Method {
        match self {
            HttpMethod::Get => reqwest::Method::GET,
            HttpMethod::Post => reqwest::Method::POST,
            HttpMethod::Put => reqwest::Method::PUT,
            HttpMethod::Delete => reqwest::Method::DELETE,
        }
    }
}

/// Protocol-specific parameters of a source
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum SourceKind {
    SnmpGet {
        oid: String,
    },
    SnmpTable {
        oid: String,
        select_columns: String,
    },
    Http {
        #[serde(default)]
        method: HttpMethod,
        path: String,
        #[serde(default)]
        header: Option<String>,
        #[serde(default)]
        body: Option<String>,
    },
    OsCommand {
        command_line: String,
        #[serde(default)]
        keep_only_reg_exp: Option<String>,
        #[serde(default)]
        exclude_reg_exp: Option<String>,
        #[serde(default)]
        begin_at_line_number: Option<usize>,
        #[serde(default)]
        end_at_line_number: Option<usize>,
        #[serde(default)]
        separators: Option<String>,
        #[serde(default)]
        select_columns: Option<String>,
    },
    Wbem {
        query: String,
        #[serde(default)]
        namespace: Option<String>,
    },
    Wmi {
        query: String,
        #[serde(default)]
        namespace: Option<String>,
    },
    Sql {
        query: String,
    },
    Copy {
        from: String,
    },
    TableJoin {
        left_table: String,
        right_table: String,
        left_key_column: usize,
        right_key_column: usize,
        #[serde(default)]
        default_right_line: Option<String>,
    },
    TableUnion {
        tables: Vec<String>,
    },
    Static {
        value: String,
    },
}

impl SourceKind {
    pub fn source_type(&self) -> SourceType {
        match self {
            SourceKind::SnmpGet { .. } => SourceType::SnmpGet,
            SourceKind::SnmpTable { .. } => SourceType::SnmpTable,
            SourceKind::Http { .. } => SourceType::Http,
            SourceKind::OsCommand { .. } => SourceType::OsCommand,
            SourceKind::Wbem { .. } => SourceType::Wbem,
            SourceKind::Wmi { .. } => SourceType::Wmi,
            SourceKind::Sql { .. } => SourceType::Sql,
            SourceKind::Copy { .. } => SourceType::Copy,
            SourceKind::TableJoin { .. } => SourceType::TableJoin,
            SourceKind::TableUnion { .. } => SourceType::TableUnion,
            SourceKind::Static { .. } => SourceType::Static,
        }
    }

    /// Keys of the sources this one reads
    pub fn references(&self) -> Vec<&str> {
        match self {
            SourceKind::Copy { from } => vec![from.as_str()],
            SourceKind::TableJoin {
                left_table,
                right_table,
                ..
            } => vec![left_table.as_str(), right_table.as_str()],
            SourceKind::TableUnion { tables } => tables.iter().map(String::as_str).collect(),
            _ => Vec::new(),
        }
    }

    /// Rewrite every protocol parameter string (used to inject monitor attributes)
    pub fn map_parameters(&mut self, f: &dyn Fn(&str) -> String) {
        let apply = |s: &mut String| *s = f(s);
        let apply_opt = |s: &mut Option<String>| {
            if let Some(s) = s {
                *s = f(s);
            }
        };
        match self {
            SourceKind::SnmpGet { oid } => apply(oid),
            SourceKind::SnmpTable { oid, .. } => apply(oid),
            SourceKind::Http {
                path, header, body, ..
            } => {
                apply(path);
                apply_opt(header);
                apply_opt(body);
            }
            SourceKind::OsCommand { command_line, .. } => apply(command_line),
            SourceKind::Wbem { query, .. } | SourceKind::Wmi { query, .. } => apply(query),
            SourceKind::Sql { query } => apply(query),
            SourceKind::Static { value } => apply(value),
            SourceKind::Copy { .. } | SourceKind::TableJoin { .. } | SourceKind::TableUnion { .. } => {}
        }
    }
}

/// Capability tag of a source variant, used for extension lookup
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SourceType {
    SnmpGet,
    SnmpTable,
    Http,
    OsCommand,
    Wbem,
    Wmi,
    Sql,
    Copy,
    TableJoin,
    TableUnion,
    Static,
}

impl SourceType {
    /// Executed by the resolver itself, not by a protocol extension
    pub fn is_internal(self) -> bool {
        matches!(
            self,
            SourceType::Copy | SourceType::TableJoin | SourceType::TableUnion | SourceType::Static
        )
    }
}

impl fmt::Display for SourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Kind of host, tested by the `DeviceType` criterion
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceKind {
    #[default]
    Linux,
    Windows,
    Solaris,
    Network,
    Storage,
    Oob,
    Other,
}

/// A pass/fail test evaluated during Detection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum Criterion {
    SnmpGet {
        oid: String,
        #[serde(default)]
        expected_result: Option<String>,
    },
    SnmpGetNext {
        oid: String,
        #[serde(default)]
        expected_result: Option<String>,
    },
    Http {
        #[serde(default)]
        method: HttpMethod,
        path: String,
        #[serde(default)]
        header: Option<String>,
        #[serde(default)]
        body: Option<String>,
        #[serde(default)]
        expected_result: Option<String>,
    },
    OsCommand {
        command_line: String,
        #[serde(default)]
        expected_result: Option<String>,
    },
    Wbem {
        query: String,
        #[serde(default)]
        namespace: Option<String>,
        #[serde(default)]
        expected_result: Option<String>,
    },
    Wmi {
        query: String,
        #[serde(default)]
        namespace: Option<String>,
        #[serde(default)]
        expected_result: Option<String>,
    },
    Sql {
        query: String,
        #[serde(default)]
        expected_result: Option<String>,
    },
    Ipmi {},
    DeviceType {
        #[serde(default)]
        keep: Vec<DeviceKind>,
        #[serde(default)]
        exclude: Vec<DeviceKind>,
    },
}

impl Criterion {
    pub fn criterion_type(&self) -> CriterionType {
        match self {
            Criterion::SnmpGet { .. } => CriterionType::SnmpGet,
            Criterion::SnmpGetNext { .. } => CriterionType::SnmpGetNext,
            Criterion::Http { .. } => CriterionType::Http,
            Criterion::OsCommand { .. } => CriterionType::OsCommand,
            Criterion::Wbem { .. } => CriterionType::Wbem,
            Criterion::Wmi { .. } => CriterionType::Wmi,
            Criterion::Sql { .. } => CriterionType::Sql,
            Criterion::Ipmi {} => CriterionType::Ipmi,
            Criterion::DeviceType { .. } => CriterionType::DeviceType,
        }
    }

    pub fn expected_result(&self) -> Option<&str> {
        match self {
            Criterion::SnmpGet {
                expected_result, ..
            }
            | Criterion::SnmpGetNext {
                expected_result, ..
            }
            | Criterion::Http {
                expected_result, ..
            }
            | Criterion::OsCommand {
                expected_result, ..
            }
            | Criterion::Wbem {
                expected_result, ..
            }
            | Criterion::Wmi {
                expected_result, ..
            }
            | Criterion::Sql {
                expected_result, ..
            } => expected_result.as_deref(),
            Criterion::Ipmi {} | Criterion::DeviceType { .. } => None,
        }
    }
}

/// Capability tag of a criterion variant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CriterionType {
    SnmpGet,
    SnmpGetNext,
    Http,
    OsCommand,
    Wbem,
    Wmi,
    Sql,
    Ipmi,
    DeviceType,
}

impl fmt::Display for CriterionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

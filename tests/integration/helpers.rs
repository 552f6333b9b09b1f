//! Helper functions for integration tests

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use hwmon_engine::{
    EngineError, EngineResult, SourceTable,
    compute::Compute,
    config::HostConfiguration,
    connector::{
        Connector, Criterion, CriterionType, Mapping, MonitorJob, MonitorJobs, Source, SourceKind,
        SourceType,
    },
    extension::{CriterionTestResult, ExtensionRegistry, ProtocolExtension},
};

pub const SYSTEM_OID: &str = "1.3.6.1.2.1.1.1.0";
pub const ENCLOSURE_OID: &str = "1.3.6.1.4.1.674.10892.1.300.10.1";

/// What the mock agent answers for an OID
#[derive(Debug, Clone)]
pub enum Answer {
    Value(String),
    Fail,
    Slow(Duration, String),
}

/// SNMP stand-in whose answers can be changed between cycles
#[derive(Clone, Default)]
pub struct MockSnmp {
    answers: Arc<Mutex<HashMap<String, Answer>>>,
    health: Arc<Mutex<Option<bool>>>,
    running: Arc<AtomicUsize>,
    max_running: Arc<AtomicUsize>,
}

/// Counts a source call as running until dropped
struct Running<'a>(&'a AtomicUsize);

impl Drop for Running<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl MockSnmp {
    pub fn set(&self, oid: &str, answer: Answer) {
        self.answers.lock().unwrap().insert(oid.to_string(), answer);
    }

    /// What the health check reports; `None` means no check
    pub fn set_health(&self, health: Option<bool>) {
        *self.health.lock().unwrap() = health;
    }

    /// Most source calls seen running at the same time
    pub fn max_running(&self) -> usize {
        self.max_running.load(Ordering::SeqCst)
    }

    fn start(&self) -> Running<'_> {
        let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_running.fetch_max(now, Ordering::SeqCst);
        Running(&self.running)
    }

    fn answer(&self, oid: &str) -> Option<Answer> {
        self.answers.lock().unwrap().get(oid).cloned()
    }

    pub fn registry(&self) -> Arc<ExtensionRegistry> {
        Arc::new(ExtensionRegistry::new().register(self.clone()))
    }
}

#[async_trait]
impl ProtocolExtension for MockSnmp {
    fn identifier(&self) -> &'static str {
        "mock-snmp"
    }

    fn is_valid_configuration(&self, protocol: &str, _: &serde_json::Value) -> bool {
        protocol == "snmp"
    }

    fn supported_sources(&self) -> &[SourceType] {
        &[SourceType::SnmpGet, SourceType::SnmpTable]
    }

    fn supported_criteria(&self) -> &[CriterionType] {
        &[CriterionType::SnmpGet]
    }

    async fn process_source(
        &self,
        source: &Source,
        _: &str,
        _: &HostConfiguration,
    ) -> EngineResult<SourceTable> {
        let oid = match &source.kind {
            SourceKind::SnmpGet { oid } | SourceKind::SnmpTable { oid, .. } => oid,
            _ => return Err(EngineError::Protocol("not an snmp source".into())),
        };
        let _running = self.start();
        match self.answer(oid) {
            Some(Answer::Value(value)) => Ok(SourceTable::from_raw(value)),
            Some(Answer::Slow(delay, value)) => {
                tokio::time::sleep(delay).await;
                Ok(SourceTable::from_raw(value))
            }
            Some(Answer::Fail) | None => Err(EngineError::Protocol(format!("no such object {oid}"))),
        }
    }

    async fn process_criterion(
        &self,
        criterion: &Criterion,
        _: &str,
        _: &HostConfiguration,
    ) -> CriterionTestResult {
        let Criterion::SnmpGet { oid, .. } = criterion else {
            return CriterionTestResult::failure("unsupported", None);
        };
        match self.answer(oid) {
            Some(Answer::Value(value)) | Some(Answer::Slow(_, value)) => {
                CriterionTestResult::from_output("SNMP Get", value, criterion.expected_result())
            }
            _ => CriterionTestResult::failure(format!("SNMP Get on {oid} failed"), None),
        }
    }

    async fn health_check(&self, _: &HostConfiguration) -> Option<bool> {
        *self.health.lock().unwrap()
    }
}

pub fn snmp_host(hostname: &str) -> HostConfiguration {
    HostConfiguration::new(hostname).with_protocol("snmp", serde_json::json!({ "community": "public" }))
}

pub fn snmp_get(key: &str, oid: &str) -> Source {
    Source::new(key, SourceKind::SnmpGet { oid: oid.into() })
}

/// Connector detecting "Dell" on the system OID and discovering enclosures
///
/// Rows are `id;index;health`, health being translated to `ok|degraded|failed`.
pub fn enclosure_connector() -> Connector {
    let mut connector = Connector::new("DellEnclosure");
    connector.detection.criteria.push(Criterion::SnmpGet {
        oid: SYSTEM_OID.into(),
        expected_result: Some("dell".into()),
    });
    connector.translation_tables.insert(
        "health".into(),
        [("healthy", "ok"), ("warning", "degraded"), ("critical", "failed")].into(),
    );

    let source = snmp_get("enclosures", ENCLOSURE_OID).with_computes(vec![Compute::Translate {
        column: 3,
        translation_table: "health".into(),
    }]);
    connector.monitors.insert(
        "enclosure".into(),
        MonitorJobs {
            discovery: Some(MonitorJob::new(
                vec![source],
                Mapping::new("enclosures")
                    .attribute("id", "$1")
                    .attribute("index", "$2")
                    .metric("hw.status", "$3"),
            )),
            collect: None,
        },
    );
    connector
}

/// A reachable agent answering as a Dell host
pub fn dell_agent() -> MockSnmp {
    let snmp = MockSnmp::default();
    snmp.set(SYSTEM_OID, Answer::Value("Dell Inc. PowerEdge".into()));
    snmp
}
